// Typed progress/status callbacks and their channel adapter.
use super::*;

/// One percentage update, in tool output order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Completion in `[0, 1]`.
    pub fraction: f64,
    /// Decimal megabits per second.
    pub speed_mbps: Option<f64>,
    pub eta: Option<String>,
}

impl ProgressUpdate {
    pub(super) fn done() -> Self {
        Self {
            fraction: 1.0,
            speed_mbps: None,
            eta: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobPhase {
    Preparing,
    Running,
    PostProcessing,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum StatusEvent {
    Phase { phase: JobPhase },
    Message { text: String },
    PlaylistItem { index: u32, total: u32 },
    AddingCover,
    Cancelling,
    /// The tool was stopped; finished items are still being post-processed.
    FinalizingAfterCancel,
}

/// Receives job events on the worker thread, synchronously and in output order.
pub trait DownloadObserver: Send + Sync {
    fn on_progress(&self, update: ProgressUpdate);
    fn on_status(&self, event: StatusEvent);
}

/// Discards everything.
impl DownloadObserver for () {
    fn on_progress(&self, _update: ProgressUpdate) {}
    fn on_status(&self, _event: StatusEvent) {}
}

/// Adapts a pair of closures.
pub struct FnObserver<P, S> {
    progress: P,
    status: S,
}

impl<P, S> FnObserver<P, S>
where
    P: Fn(ProgressUpdate) + Send + Sync,
    S: Fn(StatusEvent) + Send + Sync,
{
    pub fn new(progress: P, status: S) -> Self {
        Self { progress, status }
    }
}

impl<P, S> DownloadObserver for FnObserver<P, S>
where
    P: Fn(ProgressUpdate) + Send + Sync,
    S: Fn(StatusEvent) + Send + Sync,
{
    fn on_progress(&self, update: ProgressUpdate) {
        (self.progress)(update);
    }

    fn on_status(&self, event: StatusEvent) {
        (self.status)(event);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "payload")]
pub enum JobEvent {
    Progress(ProgressUpdate),
    Status(StatusEvent),
}

/// Marshals events to another thread; the receiver drains them at its own pace.
pub struct ChannelObserver {
    sender: mpsc::Sender<JobEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::Receiver<JobEvent>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl DownloadObserver for ChannelObserver {
    fn on_progress(&self, update: ProgressUpdate) {
        // A dropped receiver only means nobody is watching anymore.
        let _ = self.sender.send(JobEvent::Progress(update));
    }

    fn on_status(&self, event: StatusEvent) {
        let _ = self.sender.send(JobEvent::Status(event));
    }
}

/// Tracks which selected playlist entry is downloading, for ` • X/Y` suffixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaylistOrdinal {
    selected_total: Option<u32>,
    ordinal: u32,
    last_reported: Option<(u32, u32)>,
}

impl PlaylistOrdinal {
    pub fn new(selected_total: Option<u32>) -> Self {
        Self {
            selected_total: selected_total.filter(|total| *total > 0),
            ..Self::default()
        }
    }

    /// Feeds a `PlaylistItem` event; repeats of the same report are ignored.
    /// Without a selected total, the first reported total is adopted.
    pub fn observe(&mut self, index: u32, total: u32) {
        if self.last_reported == Some((index, total)) {
            return;
        }
        self.last_reported = Some((index, total));
        if self.selected_total.is_none() && total > 0 {
            self.selected_total = Some(total);
        }
        self.ordinal = match self.selected_total {
            Some(selected) if selected == total && index > 0 => index,
            _ => self.ordinal + 1,
        };
    }

    pub fn current(&self) -> Option<u32> {
        (self.ordinal > 0).then_some(self.ordinal)
    }

    pub fn suffix(&self) -> String {
        match (self.current(), self.selected_total) {
            (Some(current), Some(total)) => format!(" • {current}/{total}"),
            (Some(current), None) => format!(" • {current}"),
            (None, _) => String::new(),
        }
    }
}
