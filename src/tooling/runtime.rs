// Runtime context: settings, tool discovery, trusted downloads and common process primitives.
use super::*;
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;
use which::which;

pub(super) const APP_DIR_NAME: &str = "vidfetch";
pub(super) const SETTINGS_FILE_NAME: &str = "runtime-tools.json";
pub(super) const USER_AGENT: &str = "vidfetch";
pub(super) const TRUSTED_DOWNLOAD_HOSTS: [&str; 3] = [
    "github.com",
    "objects.githubusercontent.com",
    "release-assets.githubusercontent.com",
];
#[cfg(target_os = "windows")]
pub(super) const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Builds a command that never opens a console window and, on unix, leads its own
/// process group so the whole tree can be signalled at once.
pub(super) fn hidden_command(program: impl AsRef<OsStr>) -> Command {
    let mut command = Command::new(program);
    #[cfg(target_os = "windows")]
    {
        command.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        command.process_group(0);
    }
    command
}

pub(super) fn compile_static_regex(pattern: &str) -> regex::Regex {
    regex::Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

fn default_update_interval_hours() -> u64 {
    24
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeToolsSettings {
    pub ytdlp_mode: String,
    pub ytdlp_custom_path: Option<String>,
    pub ffmpeg_custom_path: Option<String>,
    pub ffprobe_custom_path: Option<String>,
    pub download_dir: Option<String>,
    pub auto_update_ytdlp: bool,
    #[serde(default = "default_update_interval_hours")]
    pub update_check_interval_hours: u64,
}

impl Default for RuntimeToolsSettings {
    fn default() -> Self {
        Self {
            ytdlp_mode: "managed".to_string(),
            ytdlp_custom_path: None,
            ffmpeg_custom_path: None,
            ffprobe_custom_path: None,
            download_dir: None,
            auto_update_ytdlp: true,
            update_check_interval_hours: default_update_interval_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatus {
    pub name: String,
    pub available: bool,
    pub source: String,
    pub path: Option<String>,
    pub version: Option<String>,
    pub message: Option<String>,
}

/// Directories the application reads and writes. Resolved once, then passed around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub tools_dir: PathBuf,
}

impl ToolPaths {
    pub fn from_system() -> Result<Self, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or(ConfigError::NoDirectory("config"))?
            .join(APP_DIR_NAME);
        let data_dir = dirs::data_dir()
            .ok_or(ConfigError::NoDirectory("data"))?
            .join(APP_DIR_NAME);
        Ok(Self::with_dirs(config_dir, data_dir))
    }

    /// Places every directory under one root; used for portable installs and tests.
    pub fn under(root: &Path) -> Self {
        Self::with_dirs(root.join("config"), root.join("data"))
    }

    fn with_dirs(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        let tools_dir = data_dir.join("tools");
        Self {
            config_dir,
            data_dir,
            tools_dir,
        }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE_NAME)
    }

    pub fn managed_ytdlp(&self) -> PathBuf {
        self.tools_dir.join(platform_bin("yt-dlp"))
    }

    pub(super) fn ensure_tools_dir(&self) -> std::io::Result<&Path> {
        fs::create_dir_all(&self.tools_dir)?;
        Ok(&self.tools_dir)
    }
}

pub(super) fn sanitize_optional_path(value: Option<String>) -> Result<Option<String>, ConfigError> {
    match value {
        None => Ok(None),
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            if trimmed.len() > 512 {
                return Err(ConfigError::Invalid("Path is too long.".to_string()));
            }
            if trimmed.chars().any(|ch| ch.is_control()) {
                return Err(ConfigError::Invalid(
                    "Path contains invalid control characters.".to_string(),
                ));
            }
            Ok(Some(trimmed.to_string()))
        }
    }
}

pub(super) fn normalize_settings(
    mut settings: RuntimeToolsSettings,
) -> Result<RuntimeToolsSettings, ConfigError> {
    settings.ytdlp_mode = settings.ytdlp_mode.trim().to_lowercase();
    if settings.ytdlp_mode != "managed"
        && settings.ytdlp_mode != "custom"
        && settings.ytdlp_mode != "system"
    {
        settings.ytdlp_mode = "managed".to_string();
    }
    settings.ytdlp_custom_path = sanitize_optional_path(settings.ytdlp_custom_path)?;
    settings.ffmpeg_custom_path = sanitize_optional_path(settings.ffmpeg_custom_path)?;
    settings.ffprobe_custom_path = sanitize_optional_path(settings.ffprobe_custom_path)?;
    settings.download_dir = sanitize_optional_path(settings.download_dir)?;
    settings.update_check_interval_hours = settings.update_check_interval_hours.max(1);
    Ok(settings)
}

impl RuntimeToolsSettings {
    pub fn load(paths: &ToolPaths) -> Result<Self, ConfigError> {
        let path = paths.settings_file();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let parsed: RuntimeToolsSettings = serde_json::from_str(&raw)?;
        normalize_settings(parsed)
    }

    pub fn save(self, paths: &ToolPaths) -> Result<Self, ConfigError> {
        let normalized = normalize_settings(self)?;
        let path = paths.settings_file();
        let io_error = |source| ConfigError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&paths.config_dir).map_err(io_error)?;
        let payload = serde_json::to_string_pretty(&normalized)?;
        fs::write(&path, payload).map_err(io_error)?;
        Ok(normalized)
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.update_check_interval_hours.max(1) * 3600)
    }
}

pub(super) fn platform_bin(name: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

pub(super) fn run_version(binary: &Path, arg: &str) -> Option<String> {
    let output = hidden_command(binary).arg(arg).output().ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    stdout
        .lines()
        .chain(stderr.lines())
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
}

pub(super) fn is_executable_file(path: &Path) -> bool {
    let Ok(metadata) = path.metadata() else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn ensure_custom_binary(path: &str) -> Option<PathBuf> {
    let parsed = PathBuf::from(path);
    if parsed.exists() {
        Some(parsed)
    } else {
        None
    }
}

fn resolve_ytdlp_binary(
    paths: &ToolPaths,
    settings: &RuntimeToolsSettings,
) -> Option<(PathBuf, String)> {
    if settings.ytdlp_mode == "custom" {
        return settings
            .ytdlp_custom_path
            .as_ref()
            .and_then(|value| ensure_custom_binary(value))
            .map(|path| (path, "custom".to_string()));
    }

    if settings.ytdlp_mode == "managed" {
        let managed = paths.managed_ytdlp();
        if is_executable_file(&managed) {
            return Some((managed, "managed".to_string()));
        }
    }

    which("yt-dlp")
        .ok()
        .map(|system| (system, "system".to_string()))
}

fn resolve_ffmpeg_family_binary(
    paths: &ToolPaths,
    custom_path: Option<&String>,
    name: &str,
) -> Option<(PathBuf, String)> {
    if let Some(custom) = custom_path.and_then(|value| ensure_custom_binary(value)) {
        return Some((custom, "custom".to_string()));
    }

    let managed = paths.tools_dir.join(platform_bin(name));
    if managed.exists() {
        return Some((managed, "managed".to_string()));
    }

    which(name)
        .ok()
        .map(|system| (system, "system".to_string()))
}

fn inspect_tool(
    path_with_source: Option<&(PathBuf, String)>,
    name: &str,
    version_arg: &str,
) -> ToolStatus {
    match path_with_source {
        Some((path, source)) => {
            let version = run_version(path, version_arg);
            ToolStatus {
                name: name.to_string(),
                available: version.is_some(),
                source: source.clone(),
                path: Some(path.to_string_lossy().to_string()),
                version,
                message: None,
            }
        }
        None => ToolStatus {
            name: name.to_string(),
            available: false,
            source: "missing".to_string(),
            path: None,
            version: None,
            message: Some("Tool was not found.".to_string()),
        },
    }
}

/// Resolved tool locations plus the settings they came from.
///
/// Built once by [`ToolContext::initialize`] and shared by reference with every
/// probe, download and update call; nothing here touches process-wide state.
#[derive(Debug, Clone)]
pub struct ToolContext {
    paths: ToolPaths,
    settings: RuntimeToolsSettings,
    ytdlp: Option<(PathBuf, String)>,
    ffmpeg: Option<(PathBuf, String)>,
    ffprobe: Option<(PathBuf, String)>,
    opustags: Option<PathBuf>,
}

impl ToolContext {
    pub fn initialize(paths: ToolPaths, settings: RuntimeToolsSettings) -> Self {
        let ytdlp = resolve_ytdlp_binary(&paths, &settings);
        let ffmpeg =
            resolve_ffmpeg_family_binary(&paths, settings.ffmpeg_custom_path.as_ref(), "ffmpeg");
        let ffprobe =
            resolve_ffmpeg_family_binary(&paths, settings.ffprobe_custom_path.as_ref(), "ffprobe");
        let opustags = which("opustags").ok();
        match &ytdlp {
            Some((path, source)) => {
                log::info!("Using {source} yt-dlp at {}", path.display());
            }
            None => log::warn!("yt-dlp could not be resolved"),
        }
        if ffmpeg.is_none() {
            log::warn!("ffmpeg could not be resolved; merge and remux formats are unavailable");
        }
        Self {
            paths,
            settings,
            ytdlp,
            ffmpeg,
            ffprobe,
            opustags,
        }
    }

    /// Loads persisted settings from the system directories and resolves tools.
    pub fn from_system() -> Result<Self, ConfigError> {
        let paths = ToolPaths::from_system()?;
        let settings = RuntimeToolsSettings::load(&paths)?;
        Ok(Self::initialize(paths, settings))
    }

    /// Re-resolves binaries, e.g. after the managed yt-dlp copy was replaced.
    pub fn refreshed(&self) -> Self {
        Self::initialize(self.paths.clone(), self.settings.clone())
    }

    pub fn paths(&self) -> &ToolPaths {
        &self.paths
    }

    pub fn settings(&self) -> &RuntimeToolsSettings {
        &self.settings
    }

    pub fn ytdlp(&self) -> Result<&Path, ToolMissing> {
        self.ytdlp
            .as_ref()
            .map(|(path, _)| path.as_path())
            .ok_or(ToolMissing { tool: "yt-dlp" })
    }

    pub fn ffmpeg(&self) -> Result<&Path, ToolMissing> {
        self.ffmpeg
            .as_ref()
            .map(|(path, _)| path.as_path())
            .ok_or(ToolMissing { tool: "ffmpeg" })
    }

    pub fn ffprobe(&self) -> Option<&Path> {
        self.ffprobe.as_ref().map(|(path, _)| path.as_path())
    }

    pub fn opustags(&self) -> Option<&Path> {
        self.opustags.as_deref()
    }

    /// Directory handed to yt-dlp through `--ffmpeg-location`.
    pub(super) fn ffmpeg_location(&self) -> Option<PathBuf> {
        self.ffmpeg
            .as_ref()
            .and_then(|(path, _)| path.parent().map(Path::to_path_buf))
            .filter(|parent| !parent.as_os_str().is_empty())
    }

    pub fn default_download_dir(&self) -> PathBuf {
        self.settings
            .download_dir
            .as_ref()
            .map(PathBuf::from)
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| self.paths.data_dir.join("downloads"))
    }

    pub fn status(&self) -> Vec<ToolStatus> {
        let opustags = self
            .opustags
            .as_ref()
            .map(|path| (path.clone(), "system".to_string()));
        vec![
            inspect_tool(self.ytdlp.as_ref(), "yt-dlp", "--version"),
            inspect_tool(self.ffmpeg.as_ref(), "ffmpeg", "-version"),
            inspect_tool(self.ffprobe.as_ref(), "ffprobe", "-version"),
            inspect_tool(opustags.as_ref(), "opustags", "--version"),
        ]
    }
}

pub(super) fn trusted_host_match(host: &str, allowed_host: &str) -> bool {
    host.eq_ignore_ascii_case(allowed_host)
        || host
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", allowed_host.to_ascii_lowercase()))
}

pub(super) fn ensure_trusted_https_url(url: &str) -> Result<Url, UpdateError> {
    let parsed =
        Url::parse(url).map_err(|_| UpdateError::UntrustedSource("Invalid source URL.".into()))?;
    if parsed.scheme() != "https" {
        return Err(UpdateError::UntrustedSource(
            "Only HTTPS download sources are allowed.".into(),
        ));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(UpdateError::UntrustedSource(
            "Source URL must not include credentials.".into(),
        ));
    }
    if parsed.port().is_some() {
        return Err(UpdateError::UntrustedSource(
            "Source URL must not include a custom port.".into(),
        ));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| UpdateError::UntrustedSource("Failed to resolve source domain.".into()))?;
    if TRUSTED_DOWNLOAD_HOSTS
        .iter()
        .any(|allowed| trusted_host_match(host, allowed))
    {
        return Ok(parsed);
    }
    Err(UpdateError::UntrustedSource(format!(
        "Untrusted download source: {host}"
    )))
}

fn http_get(url: &Url, timeout: Duration) -> Result<ureq::Response, UpdateError> {
    ureq::get(url.as_str())
        .set("User-Agent", USER_AGENT)
        .timeout(timeout)
        .call()
        .map_err(|error| UpdateError::Http {
            url: url.to_string(),
            message: error.to_string(),
        })
}

/// Follows redirects and returns the final URL the server landed on.
pub(super) fn resolve_redirect_target(url: &str, timeout: Duration) -> Result<String, UpdateError> {
    let parsed = ensure_trusted_https_url(url)?;
    let response = http_get(&parsed, timeout)?;
    Ok(response.get_url().to_string())
}

pub(super) fn download_text(url: &str, timeout: Duration) -> Result<String, UpdateError> {
    let parsed = ensure_trusted_https_url(url)?;
    let response = http_get(&parsed, timeout)?;
    let mut reader = response.into_reader();
    let mut body = Vec::new();
    reader
        .read_to_end(&mut body)
        .map_err(|error| UpdateError::Http {
            url: url.to_string(),
            message: format!("Failed to read response: {error}"),
        })?;
    Ok(String::from_utf8_lossy(&body).to_string())
}

pub(super) fn download_to_path(
    url: &str,
    destination_path: &Path,
    timeout: Duration,
) -> Result<u64, UpdateError> {
    let parsed = ensure_trusted_https_url(url)?;
    let response = http_get(&parsed, timeout)?;
    let mut reader = response.into_reader();
    let mut file = fs::File::create(destination_path).map_err(io_error_at(destination_path))?;

    let mut downloaded = 0_u64;
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer).map_err(|error| UpdateError::Http {
            url: url.to_string(),
            message: format!("Failed to read download stream: {error}"),
        })?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .map_err(io_error_at(destination_path))?;
        downloaded += read as u64;
    }
    file.flush().map_err(io_error_at(destination_path))?;
    log::debug!("Downloaded {downloaded} bytes from {}", parsed.host_str().unwrap_or("?"));
    Ok(downloaded)
}

pub(super) fn sha256_of_file(path: &Path) -> Result<String, UpdateError> {
    let mut file = fs::File::open(path).map_err(io_error_at(path))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(io_error_at(path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub(super) fn verify_download_checksum(path: &Path, expected_sha256: &str) -> Result<(), UpdateError> {
    let expected = expected_sha256.trim().to_ascii_lowercase();
    let actual = sha256_of_file(path)?;
    if actual != expected {
        return Err(UpdateError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

pub(super) fn canonicalize_with_retry(
    path: &Path,
    attempts: usize,
    delay: Duration,
) -> std::io::Result<PathBuf> {
    let total_attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match fs::canonicalize(path) {
            Ok(resolved) => return Ok(resolved),
            Err(error) => {
                attempt += 1;
                if attempt >= total_attempts {
                    return Err(error);
                }
                thread::sleep(delay);
            }
        }
    }
}

pub(super) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
