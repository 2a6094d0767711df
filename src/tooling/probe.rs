// yt-dlp JSON probes and playlist-items helpers.
use super::*;
use regex::Regex;
use serde_json::Value;

const PLAYLIST_PROBE_TIMEOUT: Duration = Duration::from_secs(20);
const FORMATS_PROBE_TIMEOUT: Duration = Duration::from_secs(25);
const PLAYLIST_ITEM_PROBE_TIMEOUT: Duration = Duration::from_secs(35);

static BARE_VIDEO_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"^[A-Za-z0-9_-]{6,}$"));
static FIRST_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"\d+"));

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistProbe {
    pub is_playlist: bool,
    /// The URL names a playlist without targeting one of its videos.
    pub playlist_only: bool,
    pub title: String,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbedFormats {
    pub title: String,
    pub streams: Vec<StreamDescriptor>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProbeInfo {
    title: Option<String>,
    playlist_title: Option<String>,
    formats: Option<Value>,
    entries: Option<Value>,
    playlist_count: Option<Value>,
    n_entries: Option<Value>,
    entries_count: Option<Value>,
}

fn trimmed(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_string()
}

fn raw_formats(value: Option<&Value>) -> Vec<RawFormat> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.is_object())
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn descriptors(raw: &[RawFormat]) -> Vec<StreamDescriptor> {
    raw.iter().map(StreamDescriptor::from_raw).collect()
}

fn run_ytdlp_json(
    context: &ToolContext,
    args: &[&str],
    url: &str,
    timeout: Duration,
) -> Result<ProbeInfo, ProbeError> {
    let ytdlp = context.ytdlp()?;
    let mut command = hidden_command(ytdlp);
    command.args(args).arg(url);

    let output = match capture_output_with_timeout(command, timeout, None)? {
        CaptureEnd::Finished(output) => output,
        CaptureEnd::TimedOut => return Err(ProbeError::Timeout(timeout.as_secs())),
        CaptureEnd::Cancelled => return Err(ProbeError::Cancelled),
    };

    if output.exit_code != 0 {
        let stderr = output.stderr.trim();
        let stdout = output.stdout.trim();
        let message = if !stderr.is_empty() {
            stderr.to_string()
        } else if !stdout.is_empty() {
            stdout.to_string()
        } else {
            format!("yt-dlp exited with code {}", output.exit_code)
        };
        return Err(ProbeError::Failed(message));
    }

    Ok(serde_json::from_str(&output.stdout)?)
}

fn first_positive(values: [&Option<Value>; 3]) -> Option<u32> {
    values
        .into_iter()
        .filter_map(|value| value.as_ref().and_then(Value::as_u64))
        .find(|value| *value > 0)
        .map(|value| value.min(u64::from(u32::MAX)) as u32)
}

fn is_playlist_only_url(url: &str) -> bool {
    let has_list = url.contains("list=");
    let has_video = url.contains("v=");
    url.contains("/playlist") || (has_list && !has_video)
}

fn summarize_playlist(info: &ProbeInfo, url: &str) -> PlaylistProbe {
    let entries = info.entries.as_ref().and_then(Value::as_array);
    let is_playlist = entries.is_some();
    let title = trimmed(
        info.title
            .as_deref()
            .filter(|title| !title.trim().is_empty())
            .or(info.playlist_title.as_deref()),
    );
    let count = match entries {
        Some(entries) => first_positive([
            &info.playlist_count,
            &info.n_entries,
            &info.entries_count,
        ])
        .unwrap_or(entries.len() as u32),
        None => 0,
    };
    PlaylistProbe {
        is_playlist,
        playlist_only: is_playlist && is_playlist_only_url(url),
        title,
        count,
    }
}

/// Flat-playlist probe: is the URL a playlist, and how many entries does it hold.
pub fn probe_playlist(context: &ToolContext, url: &str) -> Result<PlaylistProbe, ProbeError> {
    let info = run_ytdlp_json(
        context,
        &[
            "-J",
            "--flat-playlist",
            "--yes-playlist",
            "--skip-download",
            "--no-warnings",
        ],
        url,
        PLAYLIST_PROBE_TIMEOUT,
    )?;
    let summary = summarize_playlist(&info, url);
    log::debug!(
        "Playlist probe: playlist={} only={} count={}",
        summary.is_playlist,
        summary.playlist_only,
        summary.count
    );
    Ok(summary)
}

fn formats_with_timeout(
    context: &ToolContext,
    url: &str,
    timeout: Duration,
) -> Result<ProbedFormats, ProbeError> {
    let info = run_ytdlp_json(
        context,
        &["-J", "--no-playlist", "--skip-download", "--no-warnings"],
        url,
        timeout,
    )?;
    Ok(ProbedFormats {
        title: trimmed(info.title.as_deref()),
        streams: descriptors(&raw_formats(info.formats.as_ref())),
    })
}

/// Stream descriptors and title of a single video.
pub fn get_formats(context: &ToolContext, url: &str) -> Result<ProbedFormats, ProbeError> {
    formats_with_timeout(context, url, FORMATS_PROBE_TIMEOUT)
}

fn entry_target_url(entry: &Value) -> Option<String> {
    let target = ["webpage_url", "url", "id"]
        .iter()
        .filter_map(|key| entry.get(key).and_then(Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())?;
    if !target.starts_with("http") && BARE_VIDEO_ID_RE.is_match(target) {
        return Some(format!("https://www.youtube.com/watch?v={target}"));
    }
    Some(target.to_string())
}

/// Formats of one playlist entry, used to scan a playlist through its first selected item.
///
/// yt-dlp sometimes answers with playlist JSON even for a single item; then the first
/// entry's own formats are used, or that entry is probed again on its own URL.
pub fn get_formats_for_playlist_item(
    context: &ToolContext,
    url: &str,
    index: u32,
) -> Result<ProbedFormats, ProbeError> {
    let index = index.max(1).to_string();
    let info = run_ytdlp_json(
        context,
        &[
            "-J",
            "--yes-playlist",
            "--playlist-items",
            &index,
            "--skip-download",
            "--no-warnings",
        ],
        url,
        PLAYLIST_ITEM_PROBE_TIMEOUT,
    )?;

    let title = trimmed(info.title.as_deref());
    let top_level = raw_formats(info.formats.as_ref());
    if !top_level.is_empty() {
        return Ok(ProbedFormats {
            title,
            streams: descriptors(&top_level),
        });
    }

    let Some(entry) = info
        .entries
        .as_ref()
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
        .filter(|entry| entry.is_object())
    else {
        return Ok(ProbedFormats {
            title,
            streams: Vec::new(),
        });
    };

    let entry_title = entry
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| title.clone());
    let entry_formats = raw_formats(entry.get("formats"));
    if !entry_formats.is_empty() {
        return Ok(ProbedFormats {
            title: entry_title,
            streams: descriptors(&entry_formats),
        });
    }

    match entry_target_url(entry) {
        Some(target) => {
            log::debug!("Playlist item carried no formats; probing {target}");
            let probed = formats_with_timeout(context, &target, PLAYLIST_ITEM_PROBE_TIMEOUT)?;
            let title = [entry_title, probed.title, title]
                .into_iter()
                .find(|candidate| !candidate.is_empty())
                .unwrap_or_default();
            Ok(ProbedFormats {
                title,
                streams: probed.streams,
            })
        }
        None => Ok(ProbedFormats {
            title: entry_title,
            streams: Vec::new(),
        }),
    }
}

/// Number of entries a `--playlist-items` spec selects. Overlaps are not merged.
pub fn count_playlist_items(spec: &str) -> u32 {
    spec.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once(':') {
            Some((start, end)) => {
                match (start.trim().parse::<i64>(), end.trim().parse::<i64>()) {
                    (Ok(start), Ok(end)) if start > 0 && end > 0 => (end - start).unsigned_abs() + 1,
                    _ => 0,
                }
            }
            None => match part.parse::<i64>() {
                Ok(value) if value > 0 => 1,
                _ => 0,
            },
        })
        .map(|count| count.min(u64::from(u32::MAX)) as u32)
        .fold(0_u32, u32::saturating_add)
}

/// First concrete index named by a spec, 1 when none.
pub fn first_index_from_items_spec(spec: &str) -> u32 {
    FIRST_NUMBER_RE
        .find(spec.trim())
        .and_then(|found| found.as_str().parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(1)
}
