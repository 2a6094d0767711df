// Public entry points consumed by the UI collaborator.
use super::*;

pub fn get_runtime_tools_settings(paths: &ToolPaths) -> Result<RuntimeToolsSettings, ConfigError> {
    RuntimeToolsSettings::load(paths)
}

pub fn save_runtime_tools_settings(
    paths: &ToolPaths,
    settings: RuntimeToolsSettings,
) -> Result<RuntimeToolsSettings, ConfigError> {
    settings.save(paths)
}

pub fn get_runtime_tools_status(context: &ToolContext) -> Vec<ToolStatus> {
    context.status()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub url: String,
    pub playlist_mode: bool,
    pub playlist_items: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum ScanOutcome {
    Ready {
        title: String,
        keys: Vec<FormatKey>,
        overrides: BTreeMap<FormatKey, String>,
        /// Index into `keys` the selector should start on.
        preferred_index: usize,
        capabilities: Capabilities,
        playlist: Option<PlaylistProbe>,
        /// A playlist was detected behind a single-video URL while playlist mode is off.
        suggest_playlist: bool,
    },
    PlaylistModeRequired {
        playlist: PlaylistProbe,
    },
    NoOptions {
        reason: String,
        playlist: Option<PlaylistProbe>,
    },
}

pub(super) fn looks_like_playlist_url(url: &str) -> bool {
    url.contains("list=") || url.contains("/playlist")
}

pub(super) fn preferred_key_index(keys: &[FormatKey]) -> usize {
    keys.iter()
        .position(|key| *key == FormatKey::AudioOpus)
        .or_else(|| keys.iter().position(|key| *key == FormatKey::AudioM4a))
        .unwrap_or(0)
}

fn items_spec(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|spec| !spec.is_empty())
}

/// Probes a URL and decides which format keys the user may pick.
pub fn scan_formats(context: &ToolContext, request: &ScanRequest) -> Result<ScanOutcome, ProbeError> {
    let url = request.url.trim();
    let playlist = if looks_like_playlist_url(url) || request.playlist_mode {
        match probe_playlist(context, url) {
            Ok(meta) => Some(meta),
            Err(error) => {
                log::warn!("Playlist probe failed, scanning as a single video: {error}");
                None
            }
        }
    } else {
        None
    };

    if let Some(meta) = playlist.as_ref() {
        if meta.is_playlist && meta.playlist_only && !request.playlist_mode {
            return Ok(ScanOutcome::PlaylistModeRequired {
                playlist: meta.clone(),
            });
        }
    }

    let detected = playlist.as_ref().is_some_and(|meta| meta.is_playlist);
    let probed = if detected && request.playlist_mode {
        let index = first_index_from_items_spec(
            items_spec(request.playlist_items.as_deref()).unwrap_or_default(),
        );
        let mut probed = get_formats_for_playlist_item(context, url, index)?;
        if let Some(meta) = playlist.as_ref().filter(|meta| !meta.title.is_empty()) {
            probed.title = meta.title.clone();
        }
        probed
    } else {
        get_formats(context, url)?
    };

    let plan = plan_formats(&probed.streams);
    if let Some(reason) = plan.reason {
        return Ok(ScanOutcome::NoOptions { reason, playlist });
    }
    let suggest_playlist = playlist
        .as_ref()
        .is_some_and(|meta| meta.is_playlist && !meta.playlist_only && !request.playlist_mode);
    Ok(ScanOutcome::Ready {
        title: probed.title,
        preferred_index: preferred_key_index(&plan.keys),
        keys: plan.keys,
        overrides: plan.overrides,
        capabilities: plan.capabilities,
        playlist,
        suggest_playlist,
    })
}

/// How many playlist entries a download will touch: the items spec wins over the probe.
pub fn selected_total(playlist_items: Option<&str>, probe_count: u32) -> Option<u32> {
    let from_spec = items_spec(playlist_items)
        .map(count_playlist_items)
        .filter(|count| *count > 0);
    from_spec.or((probe_count > 0).then_some(probe_count))
}

/// A download running on its own worker thread.
pub struct DownloadHandle {
    cancel: CancellationToken,
    worker: thread::JoinHandle<Result<DownloadOutcome, DownloadError>>,
}

impl DownloadHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub fn join(self) -> Result<DownloadOutcome, DownloadError> {
        self.worker.join().unwrap_or_else(|_| {
            Err(DownloadError::Failed(
                "Download worker terminated unexpectedly.".to_string(),
            ))
        })
    }
}

/// Starts `download` on a dedicated thread; events reach `observer` from that thread.
pub fn spawn_download(
    context: Arc<ToolContext>,
    request: DownloadRequest,
    observer: Arc<dyn DownloadObserver>,
) -> DownloadHandle {
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let worker = thread::spawn(move || {
        download(&context, &request, observer.as_ref(), &worker_cancel)
    });
    DownloadHandle { cancel, worker }
}

/// Runs the yt-dlp update check in the background.
///
/// Unless forced, this only touches the managed copy and honours `autoUpdateYtdlp`.
/// A custom yt-dlp path is never updated, forced or not. Failures are logged and yield `None`.
pub fn spawn_update_check(
    context: Arc<ToolContext>,
    force: bool,
) -> thread::JoinHandle<Option<UpdateReport>> {
    thread::spawn(move || {
        let settings = context.settings();
        if !force && (!settings.auto_update_ytdlp || settings.ytdlp_mode != "managed") {
            log::debug!("Automatic yt-dlp updates are disabled for this configuration");
            return None;
        }
        match ensure_ytdlp_updated(&context, force) {
            Ok(report) => {
                if report.updated {
                    log::info!(
                        "yt-dlp updated to {}",
                        report.new.as_deref().unwrap_or_default()
                    );
                }
                Some(report)
            }
            Err(error) => {
                log::warn!("yt-dlp update check failed: {error}");
                None
            }
        }
    })
}
