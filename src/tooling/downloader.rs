// Download orchestration: one yt-dlp run per job, then per-kind finalization.
use super::*;

const SINGLE_OUTPUT_TEMPLATE: &str = "%(title).200B [%(id)s].%(ext)s";
const PLAYLIST_OUTPUT_TEMPLATE: &str =
    "%(playlist)s/%(playlist_index)03d - %(title).200B [%(id)s].%(ext)s";
const METADATA_PARSE_RULES: [&str; 3] = [
    "%(title|)s:%(meta_title)s",
    "%(artist,creator,uploader,channel|)s:%(meta_artist)s",
    "%(album,playlist_title,channel,uploader|)s:%(meta_album)s",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: String,
    pub output_dir: PathBuf,
    pub format_key: FormatKey,
    /// Concrete selector from a scan's best-effort fallback; replaces the catalog expression.
    pub selection_override: Option<String>,
    pub playlist: bool,
    pub playlist_items: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum DownloadOutcome {
    /// Final file, or the playlist folder in playlist mode.
    Completed { path: PathBuf },
    /// Items that were already complete when the job stopped may still have been finalized.
    Cancelled { finalized: Option<PathBuf> },
}

/// Per-job state. Lives for exactly one `download` call.
struct DownloadJob<'a> {
    context: &'a ToolContext,
    request: &'a DownloadRequest,
    option: &'static FormatOption,
    output_dir: PathBuf,
    started: SystemTime,
    cancel: &'a CancellationToken,
    observer: &'a dyn DownloadObserver,
}

enum Finalized {
    Done(Option<PathBuf>),
    /// The job token was set between items.
    Interrupted,
}

impl DownloadJob<'_> {
    fn cleanup(&self) -> usize {
        cleanup_cancel_artifacts(&self.output_dir, self.started, self.request.playlist)
    }

    fn cancelled_outcome(&self) -> DownloadOutcome {
        self.cleanup();
        DownloadOutcome::Cancelled { finalized: None }
    }

    fn failure(&self, result: &ProcessResult) -> DownloadError {
        let error = DownloadError::from_exit(&result.last_line);
        if error.is_network() {
            log::warn!("Network failure during download: {error}");
            self.cleanup();
        }
        error
    }

    /// The playlist folder in playlist mode, otherwise `single`.
    fn result_path(&self, paths: &[PathBuf], single: Option<PathBuf>) -> PathBuf {
        if self.request.playlist {
            if let Some(parent) = paths.first().and_then(|path| path.parent()) {
                return parent.to_path_buf();
            }
        }
        single.unwrap_or_else(|| self.output_dir.clone())
    }

    fn interrupted_mid_finalize(&self, finalizing_after_cancel: bool) -> bool {
        !finalizing_after_cancel && self.cancel.is_cancelled()
    }

    fn build_command(&self, ytdlp: &Path) -> Command {
        let request = self.request;
        let selector = request
            .selection_override
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(self.option.selector);
        let template = if request.playlist {
            PLAYLIST_OUTPUT_TEMPLATE
        } else {
            SINGLE_OUTPUT_TEMPLATE
        };

        let mut command = hidden_command(ytdlp);
        command
            .arg("--newline")
            .arg("--progress")
            .arg("--retries")
            .arg("1000000")
            .arg("--fragment-retries")
            .arg("1000000")
            .arg("--extractor-retries")
            .arg("5")
            .arg("--retry-sleep")
            .arg("5")
            .arg("--socket-timeout")
            .arg("10")
            .arg(if request.playlist {
                "--yes-playlist"
            } else {
                "--no-playlist"
            })
            .arg("--restrict-filenames")
            .arg("-P")
            .arg(&self.output_dir)
            .arg("-o")
            .arg(template);
        for rule in METADATA_PARSE_RULES {
            command.arg("--parse-metadata").arg(rule);
        }
        command
            .arg("--embed-metadata")
            .arg("--no-embed-chapters")
            .arg("--no-embed-info-json")
            .arg("--print")
            .arg("after_move:filepath")
            .arg("-f")
            .arg(selector);

        if request.playlist {
            if let Some(items) = request
                .playlist_items
                .as_deref()
                .map(str::trim)
                .filter(|items| !items.is_empty())
            {
                command.arg("--playlist-items").arg(items);
            }
        }
        if let Some(location) = self.context.ffmpeg_location() {
            command.arg("--ffmpeg-location").arg(location);
        }

        match self.option.kind {
            FormatKind::VideoAudio => {
                if let Some(container) = self.option.merge_container {
                    command.arg("--merge-output-format").arg(container);
                }
            }
            FormatKind::VideoOnlyRemux => {
                if let Some(container) = self.option.remux_container {
                    command.arg("--remux-video").arg(container);
                }
            }
            FormatKind::AudioOpus | FormatKind::AudioM4a => {
                command
                    .arg("--write-all-thumbnails")
                    .arg("--convert-thumbnails")
                    .arg("jpg");
            }
            FormatKind::VideoOnlyMp4 => {}
        }
        command.arg(&request.url);
        command
    }

    fn finish_video(&self, result: ProcessResult) -> Result<DownloadOutcome, DownloadError> {
        if result.was_cancelled() {
            return Ok(self.cancelled_outcome());
        }
        if !result.succeeded() {
            return Err(self.failure(&result));
        }
        let last = result.output_paths.last().cloned();
        if self.option.kind == FormatKind::VideoOnlyMp4 {
            if let Some(path) = &last {
                if !has_extension(path, "mp4") {
                    return Err(DownloadError::NoMp4VideoOnly);
                }
            }
        }
        self.observer.on_progress(ProgressUpdate::done());
        Ok(DownloadOutcome::Completed {
            path: self.result_path(&result.output_paths, last),
        })
    }

    fn finish_audio(&self, result: ProcessResult) -> Result<DownloadOutcome, DownloadError> {
        let stopped = result.was_cancelled();
        if stopped {
            self.observer.on_status(StatusEvent::FinalizingAfterCancel);
        } else if !result.succeeded() {
            return Err(self.failure(&result));
        }

        let mut paths = result.output_paths;
        if paths.is_empty() {
            if stopped {
                return Ok(self.cancelled_outcome());
            }
            return Err(DownloadError::MissingOutput);
        }

        if self.option.kind == FormatKind::AudioM4a
            && paths.iter().any(|path| !has_extension(path, "m4a"))
        {
            if !stopped {
                return Err(DownloadError::NoM4aAudio);
            }
            paths.retain(|path| has_extension(path, "m4a"));
            if paths.is_empty() {
                return Ok(self.cancelled_outcome());
            }
        }

        // After a cancel, finalization runs to completion on a token nobody can set.
        let step_cancel = if stopped {
            CancellationToken::new()
        } else {
            self.cancel.clone()
        };
        self.observer.on_status(StatusEvent::Phase {
            phase: JobPhase::PostProcessing,
        });

        let finalized = match self.option.kind {
            FormatKind::AudioOpus => self.finalize_opus(&paths, stopped, &step_cancel)?,
            _ => self.finalize_m4a(&paths, stopped, &step_cancel)?,
        };
        let last = match finalized {
            Finalized::Done(last) => last,
            Finalized::Interrupted => return Ok(self.cancelled_outcome()),
        };

        if self.request.playlist {
            let mut folders: BTreeSet<PathBuf> = paths
                .iter()
                .filter_map(|path| path.parent().map(Path::to_path_buf))
                .collect();
            if folders.is_empty() {
                folders.insert(self.output_dir.clone());
            }
            for folder in folders {
                cleanup_images_in_dir(&folder);
            }
        }

        if stopped {
            self.cleanup();
            return Ok(DownloadOutcome::Cancelled {
                finalized: Some(self.result_path(&paths, last)),
            });
        }
        self.observer.on_progress(ProgressUpdate::done());
        Ok(DownloadOutcome::Completed {
            path: self.result_path(&paths, last),
        })
    }

    fn finalize_m4a(
        &self,
        paths: &[PathBuf],
        stopped: bool,
        step_cancel: &CancellationToken,
    ) -> Result<Finalized, DownloadError> {
        for path in paths {
            if self.interrupted_mid_finalize(stopped) {
                return Ok(Finalized::Interrupted);
            }
            let step = match find_cover_image(self.context, path) {
                Some(cover) => {
                    self.observer.on_status(StatusEvent::AddingCover);
                    match self.context.ffmpeg() {
                        Ok(ffmpeg) => attach_cover_to_m4a(ffmpeg, path, &cover, step_cancel),
                        Err(missing) => {
                            cleanup_cover_images(path);
                            return Err(missing.into());
                        }
                    }
                }
                None => Ok(()),
            };
            cleanup_cover_images(path);

            match step {
                Ok(()) => {}
                Err(_) if self.interrupted_mid_finalize(stopped) => {
                    return Ok(Finalized::Interrupted)
                }
                Err(StepError::Cancelled) => return Ok(Finalized::Interrupted),
                Err(StepError::Failed(message)) => return Err(DownloadError::PostProcess(message)),
            }
        }
        Ok(Finalized::Done(paths.last().cloned()))
    }

    fn finalize_opus(
        &self,
        paths: &[PathBuf],
        stopped: bool,
        step_cancel: &CancellationToken,
    ) -> Result<Finalized, DownloadError> {
        let ffmpeg = self.context.ffmpeg()?;
        let mut last = None;
        for source in paths {
            if self.interrupted_mid_finalize(stopped) {
                return Ok(Finalized::Interrupted);
            }
            if !source.exists() {
                continue;
            }

            let target = if has_extension(source, "opus") {
                source.clone()
            } else {
                let target = source.with_extension("opus");
                if let Err(error) = remux_audio_to_opus(ffmpeg, source, &target, step_cancel) {
                    if self.interrupted_mid_finalize(stopped) || error == StepError::Cancelled {
                        return Ok(Finalized::Interrupted);
                    }
                    return Err(DownloadError::PostProcess(error.to_string()));
                }
                target
            };

            let step = match find_cover_image(self.context, &target) {
                Some(cover) => {
                    self.observer.on_status(StatusEvent::AddingCover);
                    set_opus_cover(self.context.opustags(), &target, &cover, step_cancel)
                }
                None => Ok(()),
            };
            cleanup_cover_images(&target);
            if let Err(error) = step {
                if self.interrupted_mid_finalize(stopped) {
                    return Ok(Finalized::Interrupted);
                }
                log::warn!("Cover art skipped for {}: {error}", target.display());
            }

            if &target != source {
                if let Err(error) = fs::remove_file(source) {
                    log::warn!("Failed to remove {}: {error}", source.display());
                }
            }
            last = Some(target);
        }
        Ok(Finalized::Done(last.or_else(|| {
            if stopped {
                None
            } else {
                paths.last().cloned()
            }
        })))
    }
}

fn prepare_output_dir(output_dir: &Path) -> Result<PathBuf, DownloadError> {
    let io_error = |source| DownloadError::OutputDir {
        path: output_dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(output_dir).map_err(io_error)?;
    canonicalize_with_retry(output_dir, 3, Duration::from_millis(100)).map_err(io_error)
}

fn run_job(
    context: &ToolContext,
    request: &DownloadRequest,
    observer: &dyn DownloadObserver,
    cancel: &CancellationToken,
) -> Result<DownloadOutcome, DownloadError> {
    let option = format_option(request.format_key);
    let ytdlp = context.ytdlp()?;
    if option.kind.needs_ffmpeg() {
        context.ffmpeg()?;
    }

    let job = DownloadJob {
        context,
        request,
        option,
        output_dir: prepare_output_dir(&request.output_dir)?,
        started: SystemTime::now(),
        cancel,
        observer,
    };
    log::info!(
        "Starting {} download into {}",
        option.key,
        job.output_dir.display()
    );

    observer.on_status(StatusEvent::Phase {
        phase: JobPhase::Running,
    });
    observer.on_status(StatusEvent::Message {
        text: option.label.to_string(),
    });
    let result = run_streaming(job.build_command(ytdlp), cancel, observer)?;

    if option.kind.is_audio() {
        job.finish_audio(result)
    } else {
        job.finish_video(result)
    }
}

/// Runs one download job to a terminal state on the calling thread.
///
/// Cancellation is reported as [`DownloadOutcome::Cancelled`], never as an error. When this
/// returns, no process started for the job is still running.
pub fn download(
    context: &ToolContext,
    request: &DownloadRequest,
    observer: &dyn DownloadObserver,
    cancel: &CancellationToken,
) -> Result<DownloadOutcome, DownloadError> {
    observer.on_status(StatusEvent::Phase {
        phase: JobPhase::Preparing,
    });
    let outcome = run_job(context, request, observer, cancel);
    let phase = match &outcome {
        Ok(DownloadOutcome::Completed { .. }) => JobPhase::Completed,
        Ok(DownloadOutcome::Cancelled { .. }) => JobPhase::Cancelled,
        Err(error) => {
            log::warn!("Download failed: {error}");
            JobPhase::Failed
        }
    };
    observer.on_status(StatusEvent::Phase { phase });
    outcome
}
