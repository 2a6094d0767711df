// Supervised child processes: line streaming, cooperative cancellation and group termination.
use super::*;
use std::process::Child;
use std::sync::mpsc::RecvTimeoutError;

pub const CANCELLED_EXIT_CODE: i32 = 130;
pub const CANCELLED_MARKER: &str = "cancelled";

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(150);
const GRACEFUL_STOP_WINDOW: Duration = Duration::from_secs(2);
const READ_CHUNK_SIZE: usize = 4096;
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Shared stop flag. Setting it is terminal for the job that holds it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            log::info!("Cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub exit_code: i32,
    /// Existing absolute paths the tool printed, first-seen order, no duplicates.
    pub output_paths: Vec<PathBuf>,
    /// Last non-empty output line, or the cancellation marker.
    pub last_line: String,
}

impl ProcessResult {
    pub fn was_cancelled(&self) -> bool {
        self.exit_code == CANCELLED_EXIT_CODE
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    fn cancelled(output_paths: Vec<PathBuf>) -> Self {
        Self {
            exit_code: CANCELLED_EXIT_CODE,
            output_paths,
            last_line: CANCELLED_MARKER.to_string(),
        }
    }
}

fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().to_string()
}

fn spawn_child(command: &mut Command) -> Result<Child, ProcessError> {
    let program = program_name(command);
    log::debug!(
        "Spawning {program} with {} argument(s)",
        command.get_args().len()
    );
    command.spawn().map_err(|source| ProcessError::Spawn { program, source })
}

pub(super) fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    let group = child.id() as libc::pid_t;
    // The child leads its own group (see `hidden_command`), so the negative pid reaches every member.
    unsafe {
        libc::kill(-group, signal);
    }
}

/// Graceful stop for the whole process group, forced after a short window. Always reaps.
fn terminate_group(child: &mut Child, program: &str) {
    #[cfg(unix)]
    signal_group(child, libc::SIGTERM);
    #[cfg(not(unix))]
    let _ = child.kill();

    let deadline = Instant::now() + GRACEFUL_STOP_WINDOW;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => {
                #[cfg(unix)]
                signal_group(child, libc::SIGKILL);
                return;
            }
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(_) => break,
        }
    }

    log::warn!("{program} ignored termination; sending SIGKILL");
    #[cfg(unix)]
    signal_group(child, libc::SIGKILL);
    let _ = child.kill();
    let _ = child.wait();
}

enum StreamMessage {
    Chunk(Vec<u8>),
    Closed,
}

/// Forwards raw output chunks until EOF. Line splitting happens on the supervising thread so
/// that a trailing partial line can still be flushed when EOF never comes.
fn spawn_chunk_reader<R: Read + Send + 'static>(
    mut reader: R,
    sender: mpsc::Sender<StreamMessage>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        loop {
            let read = match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };
            if sender.send(StreamMessage::Chunk(chunk[..read].to_vec())).is_err() {
                return;
            }
        }
        let _ = sender.send(StreamMessage::Closed);
    })
}

/// Splits a byte stream into lines. `\r` counts as a line break because the tool redraws
/// its progress line in place.
#[derive(Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for byte in bytes {
            if *byte != b'\n' && *byte != b'\r' {
                self.pending.push(*byte);
                continue;
            }
            if !self.pending.is_empty() {
                lines.push(String::from_utf8_lossy(&self.pending).to_string());
                self.pending.clear();
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        (!rest.iter().all(u8::is_ascii_whitespace))
            .then(|| String::from_utf8_lossy(&rest).to_string())
    }
}

#[derive(Default)]
struct LineTracker {
    last_line: String,
    output_paths: Vec<PathBuf>,
    last_item: Option<PlaylistPosition>,
}

impl LineTracker {
    fn handle(&mut self, raw: &str, observer: &dyn DownloadObserver) {
        let parsed = parse_line(raw);
        let trimmed = parsed.plain.trim();
        if !trimmed.is_empty() {
            self.last_line = trimmed.to_string();
        }

        if let Some(position) = parsed.playlist_item {
            if self.last_item != Some(position) {
                self.last_item = Some(position);
                observer.on_status(StatusEvent::PlaylistItem {
                    index: position.index,
                    total: position.total,
                });
            }
        }

        if let Some(fraction) = parsed.fraction {
            observer.on_progress(ProgressUpdate {
                fraction,
                speed_mbps: parsed.speed_mbps,
                eta: parsed.eta.clone(),
            });
        }

        let candidate = Path::new(trimmed);
        if candidate.is_absolute()
            && candidate.exists()
            && !self.output_paths.iter().any(|known| known == candidate)
        {
            self.output_paths.push(candidate.to_path_buf());
        }
    }
}

/// One pipe shared by stdout and stderr, so the tool's output keeps its production order.
fn combined_output_pipe(
    program: &str,
) -> Result<(std::io::PipeReader, Stdio, Stdio), ProcessError> {
    let pipe_error = |source| ProcessError::Spawn {
        program: program.to_string(),
        source,
    };
    let (reader, writer) = std::io::pipe().map_err(pipe_error)?;
    let writer_for_stderr = writer.try_clone().map_err(pipe_error)?;
    Ok((reader, Stdio::from(writer), Stdio::from(writer_for_stderr)))
}

/// Runs a tool to completion, feeding each output line to the progress parser.
///
/// Stdout and stderr share one pipe and arrive in the order the tool wrote them. The
/// cancellation token is polled every ~150 ms; once set, the process group is stopped and
/// the result carries exit code 130. After the tool exits, output still in flight is drained
/// for a short grace period even if a detached grandchild keeps the pipe open, and a trailing
/// line without newline is kept. When this returns, the process has been reaped.
pub fn run_streaming(
    mut command: Command,
    cancel: &CancellationToken,
    observer: &dyn DownloadObserver,
) -> Result<ProcessResult, ProcessError> {
    let program = program_name(&command);
    let (output, stdout, stderr) = combined_output_pipe(&program)?;
    command.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
    let spawned = spawn_child(&mut command);
    // The command still owns the parent's copies of the write end; EOF needs them closed.
    drop(command);
    let mut child = spawned?;

    let (sender, receiver) = mpsc::channel();
    let reader = spawn_chunk_reader(output, sender);
    let mut splitter = LineSplitter::default();
    let mut tracker = LineTracker::default();
    let mut closed = false;
    let mut exited: Option<(ExitStatus, Instant)> = None;

    loop {
        if cancel.is_cancelled() && exited.is_none() {
            observer.on_status(StatusEvent::Cancelling);
            terminate_group(&mut child, &program);
            return Ok(ProcessResult::cancelled(tracker.output_paths));
        }
        match receiver.recv_timeout(CANCEL_POLL_INTERVAL) {
            Ok(StreamMessage::Chunk(bytes)) => {
                for line in splitter.push(&bytes) {
                    tracker.handle(&line, observer);
                }
            }
            Ok(StreamMessage::Closed) | Err(RecvTimeoutError::Disconnected) => {
                closed = true;
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        match exited {
            Some((_, at)) if at.elapsed() >= OUTPUT_DRAIN_GRACE => {
                log::debug!("{program} exited but its output pipe is still open");
                break;
            }
            Some(_) => {}
            None => match child.try_wait() {
                Ok(Some(status)) => exited = Some((status, Instant::now())),
                Ok(None) => {}
                Err(source) => return Err(ProcessError::Wait { program, source }),
            },
        }
    }

    if let Some(line) = splitter.finish() {
        tracker.handle(&line, observer);
    }
    if closed {
        let _ = reader.join();
    }

    let status = match exited {
        Some((status, _)) => status,
        None => loop {
            if cancel.is_cancelled() {
                observer.on_status(StatusEvent::Cancelling);
                terminate_group(&mut child, &program);
                return Ok(ProcessResult::cancelled(tracker.output_paths));
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(CANCEL_POLL_INTERVAL),
                Err(source) => return Err(ProcessError::Wait { program, source }),
            }
        },
    };

    let exit_code = exit_code_of(status);
    log::debug!("{program} exited with code {exit_code}");
    Ok(ProcessResult {
        exit_code,
        output_paths: tracker.output_paths,
        last_line: tracker.last_line,
    })
}

fn spawn_capture<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = reader.read_to_end(&mut buffer);
        buffer
    })
}

fn join_capture(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}

/// Runs a short auxiliary tool (ffmpeg, opustags) with the same cancellation race.
///
/// Returns the exit code and trimmed stderr; `(130, "cancelled")` when stopped.
pub fn run_cancellable(
    mut command: Command,
    cancel: &CancellationToken,
) -> Result<(i32, String), ProcessError> {
    let program = program_name(&command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    let mut child = spawn_child(&mut command)?;
    let stderr = child.stderr.take().map(spawn_capture);

    loop {
        if cancel.is_cancelled() {
            terminate_group(&mut child, &program);
            return Ok((CANCELLED_EXIT_CODE, CANCELLED_MARKER.to_string()));
        }
        match child.try_wait() {
            Ok(Some(status)) => {
                let diagnostic = join_capture(stderr);
                return Ok((exit_code_of(status), diagnostic.trim().to_string()));
            }
            Ok(None) => thread::sleep(CANCEL_POLL_INTERVAL),
            Err(source) => return Err(ProcessError::Wait { program, source }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct CapturedOutput {
    pub(super) exit_code: i32,
    pub(super) stdout: String,
    pub(super) stderr: String,
}

pub(super) enum CaptureEnd {
    Finished(CapturedOutput),
    TimedOut,
    Cancelled,
}

/// Collects full stdout/stderr of a probe-style invocation, bounded by a timeout.
pub(super) fn capture_output_with_timeout(
    mut command: Command,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<CaptureEnd, ProcessError> {
    let program = program_name(&command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = spawn_child(&mut command)?;
    let stdout = child.stdout.take().map(spawn_capture);
    let stderr = child.stderr.take().map(spawn_capture);
    let deadline = Instant::now() + timeout;

    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            terminate_group(&mut child, &program);
            return Ok(CaptureEnd::Cancelled);
        }
        if Instant::now() >= deadline {
            log::warn!("{program} timed out after {}s", timeout.as_secs());
            terminate_group(&mut child, &program);
            return Ok(CaptureEnd::TimedOut);
        }
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(CaptureEnd::Finished(CapturedOutput {
                    exit_code: exit_code_of(status),
                    stdout: join_capture(stdout),
                    stderr: join_capture(stderr),
                }));
            }
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(source) => return Err(ProcessError::Wait { program, source }),
        }
    }
}
