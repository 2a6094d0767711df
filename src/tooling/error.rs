// Error taxonomy for configuration, process supervision, probing, downloads and updates.
use super::*;
use thiserror::Error;

/// A required external binary could not be resolved.
#[derive(Debug, Clone, Error)]
#[error("{tool} was not found. Install it or set a custom path in settings.")]
pub struct ToolMissing {
    pub tool: &'static str,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to resolve the {0} directory.")]
    NoDirectory(&'static str),

    #[error("{0}")]
    Invalid(String),

    #[error("Failed to access settings at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed while supervising {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to capture output of {0}.")]
    Pipe(String),
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    ToolMissing(#[from] ToolMissing),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("yt-dlp timed out after {0}s.")]
    Timeout(u64),

    #[error("Probe was cancelled.")]
    Cancelled,

    /// Non-zero exit; carries stderr, stdout or the exit code, in that order of preference.
    #[error("{0}")]
    Failed(String),

    #[error("Failed to parse yt-dlp response: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of a single post-processing step (remux, cover embed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    ToolMissing(#[from] ToolMissing),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Unknown format key: {0}")]
    UnknownFormat(String),

    /// The diagnostic line matched a known connectivity failure.
    #[error("{line}")]
    Network { line: String },

    /// Unrecognized tool failure; the last diagnostic line verbatim.
    #[error("{0}")]
    Failed(String),

    #[error("Download finished but the output file path was not reported.")]
    MissingOutput,

    #[error("No M4A audio stream is available for this content.")]
    NoM4aAudio,

    #[error("No 1080p MP4 video-only stream is available for this content.")]
    NoMp4VideoOnly,

    #[error("Post-processing failed: {0}")]
    PostProcess(String),

    #[error("Failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    /// Builds the failure for a non-zero tool exit, classifying connectivity problems.
    pub(super) fn from_exit(last_line: &str) -> Self {
        let line = if last_line.trim().is_empty() {
            "Download failed.".to_string()
        } else {
            last_line.to_string()
        };
        if is_network_error_line(&line) {
            Self::Network { line }
        } else {
            Self::Failed(line)
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("HTTP request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("{0}")]
    UntrustedSource(String),

    #[error("Failed to resolve the latest yt-dlp release tag.")]
    TagUnresolved,

    #[error("Checksum manifest has no entry for {0}.")]
    ChecksumMissing(String),

    #[error("Checksum mismatch. Expected {expected}, got {actual}.")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Update I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub(super) fn io_error_at(path: &Path) -> impl FnOnce(std::io::Error) -> UpdateError + '_ {
    move |source| UpdateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

const NETWORK_ERROR_NEEDLES: [&str; 25] = [
    "name or service not known",
    "temporary failure in name resolution",
    "connection timed out",
    "timed out",
    "network is unreachable",
    "no route to host",
    "connection reset",
    "connection aborted",
    "connection refused",
    "failed to establish a new connection",
    "getaddrinfo failed",
    "unable to download webpage",
    "http error",
    "httpsconnectionpool",
    "proxy error",
    "remote end closed connection",
    "errno -2",
    "errno -3",
    "errno 101",
    "errno 104",
    "errno 110",
    "errno 111",
    "errno 113",
    "[download] got error",
    "giving up after",
];

/// True when a diagnostic line looks like a DNS / TCP / HTTP connectivity failure.
pub(super) fn is_network_error_line(line: &str) -> bool {
    let lowered = line.to_lowercase();
    NETWORK_ERROR_NEEDLES
        .iter()
        .any(|needle| lowered.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connectivity_failures() {
        assert!(is_network_error_line(
            "ERROR: [youtube] abc: Unable to download webpage: <urlopen error [Errno -3] Temporary failure in name resolution>"
        ));
        assert!(is_network_error_line("[download] Got error: Connection reset by peer"));
        assert!(!is_network_error_line("ERROR: Requested format is not available"));
    }

    #[test]
    fn exit_failure_keeps_diagnostic_verbatim() {
        let error = DownloadError::from_exit("ERROR: Video unavailable");
        assert!(!error.is_network());
        assert_eq!(error.to_string(), "ERROR: Video unavailable");

        let error = DownloadError::from_exit("ERROR: Connection refused");
        assert!(error.is_network());

        let error = DownloadError::from_exit("   ");
        assert_eq!(error.to_string(), "Download failed.");
    }
}
