// Throttled, checksum-verified refresh of the managed yt-dlp binary.
use super::*;
use fs2::FileExt;

const LATEST_RELEASE_URL: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest";
const RELEASE_DOWNLOAD_BASE: &str = "https://github.com/yt-dlp/yt-dlp/releases/download";
const CHECKSUM_MANIFEST_NAME: &str = "SHA2-256SUMS";
const UPDATE_STATE_FILE: &str = "ytdlp_update_state.json";
const UPDATE_LOCK_FILE: &str = "ytdlp_update.lock";
const TAG_TIMEOUT: Duration = Duration::from_secs(8);
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(20);
const BINARY_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateState {
    /// Unix seconds of the last attempt, successful or not.
    pub last_check: f64,
    pub latest: Option<String>,
    pub last_ok: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub updated: bool,
    pub old: Option<String>,
    pub new: Option<String>,
    pub path: Option<PathBuf>,
}

pub(super) fn ytdlp_asset_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else {
        "yt-dlp"
    }
}

/// Looks up `asset_name` in a `sha256sum`-style manifest. `*name` and `./name` are accepted.
pub fn parse_sha256_for_asset(manifest: &str, asset_name: &str) -> Option<String> {
    for line in manifest.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let normalized = trimmed.replace('*', " ");
        let mut parts = normalized.split_whitespace();
        let Some(hash) = parts.next() else {
            continue;
        };
        let Some(filename) = parts.next_back() else {
            continue;
        };
        let candidate_name = filename.trim_start_matches("./");
        if candidate_name == asset_name
            && hash.len() == 64
            && hash.chars().all(|ch| ch.is_ascii_hexdigit())
        {
            return Some(hash.to_ascii_lowercase());
        }
    }
    None
}

pub(super) fn tag_from_release_url(final_url: &str) -> Option<String> {
    let (_, tail) = final_url.split_once("/tag/")?;
    let tag = tail
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim();
    (!tag.is_empty()).then(|| tag.to_string())
}

fn state_path(tools_dir: &Path) -> PathBuf {
    tools_dir.join(UPDATE_STATE_FILE)
}

pub(super) fn read_update_state(tools_dir: &Path) -> UpdateState {
    fs::read_to_string(state_path(tools_dir))
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub(super) fn write_update_state(tools_dir: &Path, state: &UpdateState) -> Result<(), UpdateError> {
    let path = state_path(tools_dir);
    let temp_path = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(state).map_err(|error| UpdateError::Io {
        path: path.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, error),
    })?;
    fs::write(&temp_path, payload).map_err(io_error_at(&temp_path))?;
    fs::rename(&temp_path, &path).map_err(io_error_at(&path))
}

fn current_version(paths: &ToolPaths) -> Option<String> {
    let managed = paths.managed_ytdlp();
    let binary = if is_executable_file(&managed) {
        managed
    } else {
        which::which("yt-dlp").ok()?
    };
    run_version(&binary, "--version")
}

fn latest_release_tag() -> Result<String, UpdateError> {
    let final_url = resolve_redirect_target(LATEST_RELEASE_URL, TAG_TIMEOUT)?;
    tag_from_release_url(&final_url).ok_or(UpdateError::TagUnresolved)
}

fn install_release(tools_dir: &Path, target_path: &Path, tag: &str) -> Result<(), UpdateError> {
    let asset = ytdlp_asset_name();
    let manifest = download_text(
        &format!("{RELEASE_DOWNLOAD_BASE}/{tag}/{CHECKSUM_MANIFEST_NAME}"),
        MANIFEST_TIMEOUT,
    )?;
    let expected = parse_sha256_for_asset(&manifest, asset)
        .ok_or_else(|| UpdateError::ChecksumMissing(asset.to_string()))?;

    let temp_path = tools_dir.join(format!("{asset}.tmp"));
    let staged = download_to_path(
        &format!("{RELEASE_DOWNLOAD_BASE}/{tag}/{asset}"),
        &temp_path,
        BINARY_TIMEOUT,
    )
    .and_then(|_| verify_download_checksum(&temp_path, &expected));
    if let Err(error) = staged {
        log::warn!("Discarding yt-dlp {tag}: {error}");
        let _ = fs::remove_file(&temp_path);
        return Err(error);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o755))
            .map_err(io_error_at(&temp_path))?;
    }
    fs::rename(&temp_path, target_path).map_err(io_error_at(target_path))
}

/// Brings the managed yt-dlp copy up to the latest release.
///
/// Skipped (empty report) in custom-path mode, when the last check is younger than the
/// configured interval and `force` is off, or when another check holds the lock. The binary is replaced only after
/// its checksum matched the release manifest.
pub fn ensure_ytdlp_updated(context: &ToolContext, force: bool) -> Result<UpdateReport, UpdateError> {
    if context.settings().ytdlp_mode == "custom" {
        log::info!("yt-dlp runs from a custom path; the managed copy is left alone");
        return Ok(UpdateReport::default());
    }
    let paths = context.paths();
    let tools_dir = paths
        .ensure_tools_dir()
        .map_err(io_error_at(&paths.tools_dir))?;

    let now = unix_now();
    let mut state = read_update_state(tools_dir);
    let interval = context.settings().update_check_interval().as_secs_f64();
    if !force && now - state.last_check < interval {
        log::debug!("yt-dlp update check throttled");
        return Ok(UpdateReport::default());
    }

    let lock_path = tools_dir.join(UPDATE_LOCK_FILE);
    let lock = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(io_error_at(&lock_path))?;
    if lock.try_lock_exclusive().is_err() {
        log::debug!("Another yt-dlp update check is running");
        return Ok(UpdateReport::default());
    }

    let report = run_locked_update(paths, tools_dir, &mut state, now);
    let _ = FileExt::unlock(&lock);
    report
}

fn run_locked_update(
    paths: &ToolPaths,
    tools_dir: &Path,
    state: &mut UpdateState,
    now: f64,
) -> Result<UpdateReport, UpdateError> {
    state.last_check = now;
    write_update_state(tools_dir, state)?;

    let latest = latest_release_tag()?;
    let old = current_version(paths);
    if old.as_deref() == Some(latest.as_str()) {
        log::info!("yt-dlp {latest} is current");
        state.latest = Some(latest.clone());
        state.last_ok = Some(now);
        write_update_state(tools_dir, state)?;
        return Ok(UpdateReport {
            updated: false,
            old,
            new: Some(latest),
            path: None,
        });
    }

    let target_path = paths.managed_ytdlp();
    log::info!(
        "Updating yt-dlp {} -> {latest}",
        old.as_deref().unwrap_or("(none)")
    );
    install_release(tools_dir, &target_path, &latest)?;

    state.latest = Some(latest.clone());
    state.last_ok = Some(now);
    write_update_state(tools_dir, state)?;
    Ok(UpdateReport {
        updated: true,
        old,
        new: Some(latest),
        path: Some(target_path),
    })
}
