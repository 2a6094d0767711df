use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use url::Url;

mod capabilities;
mod commands;
mod downloader;
mod error;
mod events;
mod media_io;
mod probe;
mod process;
mod progress;
mod runtime;
mod self_update;

use capabilities::*;
use downloader::*;
use error::*;
use events::*;
use media_io::*;
use probe::*;
use process::*;
use progress::*;
use runtime::*;
use self_update::*;

pub use capabilities::{
    best_effort_selection, detect_capabilities, format_option, permitted_format_keys,
    plan_formats, policy_reason, snap_height, Capabilities, FormatKey, FormatKind, FormatOption,
    FormatPlan, RawFormat, StreamDescriptor, FORMAT_OPTIONS,
};
pub use commands::*;
pub use downloader::{download, DownloadOutcome, DownloadRequest};
pub use error::{
    ConfigError, DownloadError, ProbeError, ProcessError, StepError, ToolMissing, UpdateError,
};
pub use events::{
    ChannelObserver, DownloadObserver, FnObserver, JobEvent, JobPhase, PlaylistOrdinal,
    ProgressUpdate, StatusEvent,
};
pub use media_io::{cleanup_cancel_artifacts, list_cover_images, pick_best_cover_image};
pub use probe::{
    count_playlist_items, first_index_from_items_spec, get_formats,
    get_formats_for_playlist_item, probe_playlist, PlaylistProbe, ProbedFormats,
};
pub use process::{
    run_cancellable, run_streaming, CancellationToken, ProcessResult, CANCELLED_EXIT_CODE,
    CANCELLED_MARKER,
};
pub use progress::{
    parse_line, parse_playlist_item, parse_progress, parse_speed_eta, strip_ansi, ParsedLine,
    PlaylistPosition,
};
pub use runtime::{RuntimeToolsSettings, ToolContext, ToolPaths, ToolStatus};
pub use self_update::{ensure_ytdlp_updated, parse_sha256_for_asset, UpdateReport, UpdateState};
