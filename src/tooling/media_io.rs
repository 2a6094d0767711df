// Job artifact cleanup, cover art discovery and the ffmpeg/opustags finalization steps.
use super::*;
use regex::Regex;
use walkdir::WalkDir;

pub(super) const COVER_IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];
pub(super) const COVER_TMP_SUFFIX: &str = ".__cover_tmp__.m4a";
const PARTIAL_SIDECAR_SUFFIXES: [&str; 3] = [".ytdl", ".aria2", COVER_TMP_SUFFIX];
const CLEANUP_MTIME_SLACK: Duration = Duration::from_secs(2);
const IMAGE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

static BRACKETED_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"\[([A-Za-z0-9_-]{6,})\]"));

pub(super) fn is_cover_image(path: &Path) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_lowercase())
        .map(|value| COVER_IMAGE_EXTENSIONS.contains(&value.as_str()))
        .unwrap_or(false)
}

pub(super) fn has_extension(path: &Path, expected: &str) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub(super) fn file_modified_or_epoch(path: &Path) -> SystemTime {
    path.metadata()
        .ok()
        .and_then(|metadata| metadata.modified().ok())
        .unwrap_or(UNIX_EPOCH)
}

fn list_files(root: &Path, recursive: bool) -> Vec<PathBuf> {
    let walker = WalkDir::new(root).min_depth(1);
    let walker = if recursive { walker } else { walker.max_depth(1) };
    walker
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

fn remove_files(paths: impl IntoIterator<Item = PathBuf>) -> usize {
    let mut removed = 0;
    for path in paths {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => log::warn!("Failed to remove {}: {error}", path.display()),
        }
    }
    removed
}

fn is_partial_artifact(name: &str) -> bool {
    name.contains(".part")
        || PARTIAL_SIDECAR_SUFFIXES
            .iter()
            .any(|suffix| name.ends_with(suffix))
}

/// Deletes partial downloads, sidecars and bracketed thumbnails that this job could have
/// written: files modified at or after `started - 2s`. Older files are never touched, so a
/// second pass after the same job removes nothing.
pub fn cleanup_cancel_artifacts(output_dir: &Path, started: SystemTime, recursive: bool) -> usize {
    let threshold = started
        .checked_sub(CLEANUP_MTIME_SLACK)
        .unwrap_or(UNIX_EPOCH);
    let doomed: Vec<PathBuf> = list_files(output_dir, recursive)
        .into_iter()
        .filter(|path| {
            let name = file_name(path);
            let bracketed_thumbnail = is_cover_image(path) && name.contains('[') && name.contains(']');
            is_partial_artifact(&name) || bracketed_thumbnail
        })
        .filter(|path| file_modified_or_epoch(path) >= threshold)
        .collect();
    let removed = remove_files(doomed);
    if removed > 0 {
        log::info!("Removed {removed} leftover artifact(s) from {}", output_dir.display());
    }
    removed
}

fn extract_video_id(name: &str) -> Option<&str> {
    BRACKETED_ID_RE
        .captures(name)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str())
}

/// Thumbnails yt-dlp wrote next to `media_path`: same directory, image extension, and either
/// the bracketed video id or the media file's stem in the name. Sorted.
pub fn list_cover_images(media_path: &Path) -> Vec<PathBuf> {
    let Some(directory) = media_path.parent() else {
        return Vec::new();
    };
    let media_name = file_name(media_path);
    let video_id = extract_video_id(&media_name).map(|id| format!("[{id}]"));
    let stem = media_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();

    let candidates: BTreeSet<PathBuf> = list_files(directory, false)
        .into_iter()
        .filter(|path| is_cover_image(path))
        .filter(|path| {
            let name = file_name(path);
            video_id.as_deref().is_some_and(|id| name.contains(id))
                || (!stem.is_empty() && name.starts_with(&stem))
        })
        .collect();
    candidates.into_iter().collect()
}

fn ffprobe_image_area(ffprobe: &Path, image: &Path) -> Option<u64> {
    let mut command = hidden_command(ffprobe);
    command
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height")
        .arg("-of")
        .arg("csv=p=0:s=x")
        .arg(image);
    let CaptureEnd::Finished(output) =
        capture_output_with_timeout(command, IMAGE_PROBE_TIMEOUT, None).ok()?
    else {
        return None;
    };
    if output.exit_code != 0 {
        return None;
    }
    let (width, height) = output.stdout.trim().split_once('x')?;
    let width = width.trim().parse::<u64>().ok()?;
    let height = height.trim().parse::<u64>().ok()?;
    (width > 0 && height > 0).then_some(width * height)
}

/// Largest image by pixel area (ffprobe), else by file size. Ties go to the smaller path.
pub fn pick_best_cover_image(candidates: &[PathBuf], ffprobe: Option<&Path>) -> Option<PathBuf> {
    let mut best: Option<(u64, &PathBuf)> = None;
    for candidate in candidates {
        let metric = ffprobe
            .and_then(|binary| ffprobe_image_area(binary, candidate))
            .or_else(|| candidate.metadata().ok().map(|metadata| metadata.len()))
            .unwrap_or(0);
        let better = match best {
            None => true,
            Some((best_metric, best_path)) => {
                metric > best_metric || (metric == best_metric && candidate < best_path)
            }
        };
        if better {
            best = Some((metric, candidate));
        }
    }
    best.map(|(_, path)| path.clone())
}

pub(super) fn find_cover_image(context: &ToolContext, media_path: &Path) -> Option<PathBuf> {
    pick_best_cover_image(&list_cover_images(media_path), context.ffprobe())
}

pub(super) fn cleanup_cover_images(media_path: &Path) -> usize {
    remove_files(list_cover_images(media_path))
}

/// Removes every image directly inside `directory`; playlist folders end up thumbnail-free.
pub(super) fn cleanup_images_in_dir(directory: &Path) -> usize {
    remove_files(
        list_files(directory, false)
            .into_iter()
            .filter(|path| is_cover_image(path)),
    )
}

fn last_diagnostic_line(stderr: &str, fallback: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or(fallback)
        .to_string()
}

fn run_step(
    command: Command,
    cancel: &CancellationToken,
    fallback: &str,
    scratch: Option<&Path>,
) -> Result<(), StepError> {
    let discard_scratch = || {
        if let Some(path) = scratch {
            let _ = fs::remove_file(path);
        }
    };
    let (code, stderr) = run_cancellable(command, cancel).map_err(|error| {
        discard_scratch();
        StepError::Failed(error.to_string())
    })?;
    if code == CANCELLED_EXIT_CODE {
        discard_scratch();
        return Err(StepError::Cancelled);
    }
    if code != 0 {
        discard_scratch();
        return Err(StepError::Failed(last_diagnostic_line(&stderr, fallback)));
    }
    Ok(())
}

/// Embeds `cover` into an M4A as an attached picture, stream copy only.
pub(super) fn attach_cover_to_m4a(
    ffmpeg: &Path,
    media_path: &Path,
    cover: &Path,
    cancel: &CancellationToken,
) -> Result<(), StepError> {
    let stem = media_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let scratch = media_path.with_file_name(format!("{stem}{COVER_TMP_SUFFIX}"));

    let mut command = hidden_command(ffmpeg);
    command
        .arg("-v")
        .arg("error")
        .arg("-y")
        .arg("-i")
        .arg(media_path)
        .arg("-i")
        .arg(cover)
        .arg("-map")
        .arg("0")
        .arg("-map")
        .arg("1")
        .arg("-c")
        .arg("copy")
        .arg("-disposition:v:0")
        .arg("attached_pic")
        .arg(&scratch);
    run_step(command, cancel, "ffmpeg failed to attach cover art.", Some(&scratch))?;

    fs::rename(&scratch, media_path).map_err(|error| {
        let _ = fs::remove_file(&scratch);
        StepError::Failed(format!("Failed to replace {}: {error}", media_path.display()))
    })
}

/// Repackages an Opus stream into an `.opus` container without re-encoding.
pub(super) fn remux_audio_to_opus(
    ffmpeg: &Path,
    source: &Path,
    destination: &Path,
    cancel: &CancellationToken,
) -> Result<(), StepError> {
    let mut command = hidden_command(ffmpeg);
    command
        .arg("-v")
        .arg("error")
        .arg("-y")
        .arg("-i")
        .arg(source)
        .arg("-vn")
        .arg("-map_metadata")
        .arg("0")
        .arg("-c:a")
        .arg("copy")
        .arg(destination);
    run_step(command, cancel, "ffmpeg failed to remux audio.", Some(destination))
}

/// Sets the cover of an Opus file with opustags. A missing opustags is not an error.
pub(super) fn set_opus_cover(
    opustags: Option<&Path>,
    opus_path: &Path,
    cover: &Path,
    cancel: &CancellationToken,
) -> Result<(), StepError> {
    let Some(opustags) = opustags else {
        log::debug!("opustags not available; leaving {} without cover", opus_path.display());
        return Ok(());
    };
    let mut command = hidden_command(opustags);
    command
        .arg("--in-place")
        .arg("--set-cover")
        .arg(cover)
        .arg(opus_path);
    run_step(command, cancel, "opustags failed to set cover art.", None)
}
