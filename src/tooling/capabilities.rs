// Format policy catalog and the capability detector that decides which keys a URL offers.
use super::*;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

pub(super) const STANDARD_HEIGHTS: [u32; 8] = [144, 240, 360, 480, 720, 1080, 1440, 2160];
const HEIGHT_SNAP_TOLERANCE: u32 = 12;

static RESOLUTION_HEIGHT_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"x(\d{3,4})$"));
static LABEL_HEIGHT_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(\d{3,4})p"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKey {
    VideoBest,
    #[serde(rename = "video_2160p")]
    Video2160p,
    #[serde(rename = "video_1440p")]
    Video1440p,
    #[serde(rename = "video_1080p")]
    Video1080p,
    AudioOpus,
    AudioM4a,
    #[serde(rename = "video_only_mkv_1080")]
    VideoOnlyMkv1080,
    #[serde(rename = "video_only_mp4_1080")]
    VideoOnlyMp41080,
}

impl FormatKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VideoBest => "video_best",
            Self::Video2160p => "video_2160p",
            Self::Video1440p => "video_1440p",
            Self::Video1080p => "video_1080p",
            Self::AudioOpus => "audio_opus",
            Self::AudioM4a => "audio_m4a",
            Self::VideoOnlyMkv1080 => "video_only_mkv_1080",
            Self::VideoOnlyMp41080 => "video_only_mp4_1080",
        }
    }

    pub fn is_muxed_tier(self) -> bool {
        matches!(self, Self::Video2160p | Self::Video1440p | Self::Video1080p)
    }
}

impl fmt::Display for FormatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for FormatKey {
    type Err = DownloadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        FORMAT_OPTIONS
            .iter()
            .map(|option| option.key)
            .find(|key| key.as_str() == value.trim())
            .ok_or_else(|| DownloadError::UnknownFormat(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FormatKind {
    /// Separate video and audio merged into one container.
    VideoAudio,
    AudioOpus,
    AudioM4a,
    /// Video-only stream remuxed to another container.
    VideoOnlyRemux,
    VideoOnlyMp4,
}

impl FormatKind {
    pub fn is_audio(self) -> bool {
        matches!(self, Self::AudioOpus | Self::AudioM4a)
    }

    pub fn needs_ffmpeg(self) -> bool {
        matches!(self, Self::VideoAudio | Self::VideoOnlyRemux | Self::AudioOpus)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOption {
    pub key: FormatKey,
    pub kind: FormatKind,
    pub label: &'static str,
    pub selector: &'static str,
    pub merge_container: Option<&'static str>,
    pub remux_container: Option<&'static str>,
    pub height_cap: Option<u32>,
}

pub const FORMAT_OPTIONS: [FormatOption; 8] = [
    FormatOption {
        key: FormatKey::VideoBest,
        kind: FormatKind::VideoAudio,
        label: "Video + audio (best)",
        selector: "bestvideo[acodec=none][vcodec~='^vp0?9']+bestaudio[vcodec=none][acodec=opus]",
        merge_container: Some("mkv"),
        remux_container: None,
        height_cap: None,
    },
    FormatOption {
        key: FormatKey::Video2160p,
        kind: FormatKind::VideoAudio,
        label: "Video + audio (MKV)",
        selector: "bestvideo[acodec=none][vcodec~='^vp0?9'][height=2160]+bestaudio[vcodec=none][acodec=opus]",
        merge_container: Some("mkv"),
        remux_container: None,
        height_cap: Some(2160),
    },
    FormatOption {
        key: FormatKey::Video1440p,
        kind: FormatKind::VideoAudio,
        label: "Video + audio (MKV)",
        selector: "bestvideo[acodec=none][vcodec~='^vp0?9'][height=1440]+bestaudio[vcodec=none][acodec=opus]",
        merge_container: Some("mkv"),
        remux_container: None,
        height_cap: Some(1440),
    },
    FormatOption {
        key: FormatKey::Video1080p,
        kind: FormatKind::VideoAudio,
        label: "Video + audio (MKV)",
        selector: "bestvideo[acodec=none][vcodec~='^vp0?9'][height=1080]+bestaudio[vcodec=none][acodec=opus]",
        merge_container: Some("mkv"),
        remux_container: None,
        height_cap: Some(1080),
    },
    FormatOption {
        key: FormatKey::AudioOpus,
        kind: FormatKind::AudioOpus,
        label: "Audio (Opus)",
        selector: "bestaudio[vcodec=none][acodec=opus]",
        merge_container: None,
        remux_container: None,
        height_cap: None,
    },
    FormatOption {
        key: FormatKey::AudioM4a,
        kind: FormatKind::AudioM4a,
        label: "Audio (M4A)",
        selector: "bestaudio[vcodec=none][ext=m4a]",
        merge_container: None,
        remux_container: None,
        height_cap: None,
    },
    FormatOption {
        key: FormatKey::VideoOnlyMkv1080,
        kind: FormatKind::VideoOnlyRemux,
        label: "Video only (1080p MKV)",
        selector: "bestvideo[acodec=none][vcodec~='^vp0?9'][height=1080]",
        merge_container: None,
        remux_container: Some("mkv"),
        height_cap: None,
    },
    FormatOption {
        key: FormatKey::VideoOnlyMp41080,
        kind: FormatKind::VideoOnlyMp4,
        label: "Video only (1080p MP4)",
        selector: "bestvideo[acodec=none][ext=mp4][vcodec^=avc1][height=1080]",
        merge_container: None,
        remux_container: None,
        height_cap: None,
    },
];

pub fn format_option(key: FormatKey) -> &'static FormatOption {
    let index = FORMAT_OPTIONS
        .iter()
        .position(|option| option.key == key)
        .unwrap_or_default();
    &FORMAT_OPTIONS[index]
}

/// One entry of yt-dlp's `formats` array, as much of it as the policy looks at.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub ext: Option<String>,
    pub height: Option<f64>,
    pub resolution: Option<String>,
    pub format_note: Option<String>,
    pub format: Option<String>,
    pub tbr: Option<f64>,
    pub abr: Option<f64>,
    pub fps: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDescriptor {
    pub format_id: String,
    /// Lowercased; empty or `none` when the stream carries no video.
    pub vcodec: String,
    pub acodec: String,
    pub ext: String,
    /// Raw height in pixels, 0 when unknown.
    pub height: u32,
    pub tbr: f64,
    pub abr: f64,
    pub fps: f64,
    pub upscaled: bool,
}

fn lower(value: &Option<String>) -> String {
    value.as_deref().unwrap_or_default().trim().to_lowercase()
}

fn capture_height(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

fn extract_height(raw: &RawFormat) -> u32 {
    if let Some(height) = raw.height.filter(|height| *height >= 1.0) {
        return height as u32;
    }
    let resolution = raw.resolution.as_deref().unwrap_or_default().trim();
    if let Some(height) = capture_height(&RESOLUTION_HEIGHT_RE, resolution) {
        return height;
    }
    let note = raw.format_note.as_deref().unwrap_or_default().trim();
    if let Some(height) = capture_height(&LABEL_HEIGHT_RE, note) {
        return height;
    }
    let format = raw.format.as_deref().unwrap_or_default().trim();
    capture_height(&LABEL_HEIGHT_RE, format).unwrap_or(0)
}

impl StreamDescriptor {
    pub fn from_raw(raw: &RawFormat) -> Self {
        let format_id = raw.format_id.clone().unwrap_or_default();
        let note = lower(&raw.format_note);
        let format = lower(&raw.format);
        let upscaled = format_id.to_lowercase().contains("sr")
            || note.contains("upscaled")
            || format.contains("upscaled");
        Self {
            format_id,
            vcodec: lower(&raw.vcodec),
            acodec: lower(&raw.acodec),
            ext: lower(&raw.ext),
            height: extract_height(raw),
            tbr: raw.tbr.unwrap_or(0.0),
            abr: raw.abr.unwrap_or(0.0),
            fps: raw.fps.unwrap_or(0.0),
            upscaled,
        }
    }

    pub fn has_video(&self) -> bool {
        !self.vcodec.is_empty() && self.vcodec != "none"
    }

    pub fn has_audio(&self) -> bool {
        !self.acodec.is_empty() && self.acodec != "none"
    }

    pub fn snapped_height(&self) -> u32 {
        snap_height(self.height)
    }

    fn is_vp9(&self) -> bool {
        self.vcodec.contains("vp9") || self.vcodec.starts_with("vp09")
    }

    fn is_h264(&self) -> bool {
        self.vcodec.contains("avc1") || self.vcodec.contains("h264")
    }

    fn is_m4a_compatible(&self) -> bool {
        self.ext == "m4a" || self.acodec.contains("mp4a")
    }
}

/// Snaps a height to the nearest standard bucket within ±12 px; other values pass through.
pub fn snap_height(height: u32) -> u32 {
    if height == 0 {
        return 0;
    }
    STANDARD_HEIGHTS
        .iter()
        .copied()
        .find(|standard| height.abs_diff(*standard) <= HEIGHT_SNAP_TOLERANCE)
        .unwrap_or(height)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Every stream carrying video, upscaled ones included.
    pub video_count: usize,
    pub audio_count: usize,
    /// Highest genuine (non-upscaled) snapped height, muxed or video-only.
    pub max_height: u32,
    pub has_opus_audio: bool,
    pub has_m4a_audio: bool,
    pub has_vp9_2160: bool,
    pub has_vp9_1440: bool,
    pub has_vp9_1080: bool,
    pub has_mp4_h264_1080: bool,
}

impl Capabilities {
    fn has_vp9_tier(&self) -> bool {
        self.has_vp9_2160 || self.has_vp9_1440 || self.has_vp9_1080
    }
}

pub fn detect_capabilities(streams: &[StreamDescriptor]) -> Capabilities {
    let mut capabilities = Capabilities::default();
    let mut max_height_any = 0;
    let mut max_height_video_only = 0;

    for stream in streams {
        let has_video = stream.has_video();
        let has_audio = stream.has_audio();

        if has_video {
            capabilities.video_count += 1;
            if !stream.upscaled {
                max_height_any = max_height_any.max(stream.snapped_height());
            }
        }

        if has_audio && !has_video {
            capabilities.audio_count += 1;
            if stream.acodec == "opus" {
                capabilities.has_opus_audio = true;
            }
            if stream.is_m4a_compatible() {
                capabilities.has_m4a_audio = true;
            }
        }

        if !has_video || has_audio || stream.upscaled {
            continue;
        }

        let height = stream.snapped_height();
        max_height_video_only = max_height_video_only.max(height);

        if stream.is_vp9() {
            if height >= 2150 {
                capabilities.has_vp9_2160 = true;
            } else if height >= 1430 {
                capabilities.has_vp9_1440 = true;
            } else if height >= 1070 {
                capabilities.has_vp9_1080 = true;
            }
        }

        if stream.ext == "mp4" && stream.is_h264() && height >= 1070 {
            capabilities.has_mp4_h264_1080 = true;
        }
    }

    capabilities.max_height = if max_height_any > 0 {
        max_height_any
    } else {
        max_height_video_only
    };
    capabilities
}

/// Strict policy keys in presentation order: muxed tiers, audio, video-only.
pub fn permitted_format_keys(capabilities: &Capabilities) -> Vec<FormatKey> {
    let mut keys = Vec::new();
    if capabilities.has_opus_audio {
        if capabilities.has_vp9_2160 {
            keys.push(FormatKey::Video2160p);
        }
        if capabilities.has_vp9_1440 {
            keys.push(FormatKey::Video1440p);
        }
        if capabilities.has_vp9_1080 {
            keys.push(FormatKey::Video1080p);
        }
        keys.push(FormatKey::AudioOpus);
    }
    if capabilities.has_m4a_audio {
        keys.push(FormatKey::AudioM4a);
    }
    if capabilities.has_vp9_1080 {
        keys.push(FormatKey::VideoOnlyMkv1080);
    }
    if capabilities.has_mp4_h264_1080 {
        keys.push(FormatKey::VideoOnlyMp41080);
    }
    keys
}

fn video_codec_rank(vcodec: &str) -> u8 {
    if vcodec.contains("vp9") || vcodec.starts_with("vp09") {
        3
    } else if vcodec.contains("av01") {
        2
    } else if vcodec.contains("avc1") || vcodec.contains("h264") {
        1
    } else {
        0
    }
}

fn audio_codec_rank(stream: &StreamDescriptor) -> u8 {
    if stream.acodec == "opus" {
        3
    } else if stream.is_m4a_compatible() {
        2
    } else {
        1
    }
}

type VideoScore = (u32, u8, f64, f64);
type AudioScore = (u8, f64, f64);

/// Keeps the first candidate among equal scores.
fn keep_best<'a, S: PartialOrd>(
    best: &mut Option<(S, &'a StreamDescriptor)>,
    score: S,
    stream: &'a StreamDescriptor,
) {
    let better = match best {
        Some((current, _)) => score > *current,
        None => true,
    };
    if better {
        *best = Some((score, stream));
    }
}

/// Picks a concrete `video+audio` format-id pair when no strict muxed tier qualifies.
///
/// Upscaled streams and streams without an id never take part. A video-only stream is
/// preferred over a muxed one; a muxed pick is returned alone.
pub fn best_effort_selection(streams: &[StreamDescriptor]) -> Option<String> {
    let mut best_video_only: Option<(VideoScore, &StreamDescriptor)> = None;
    let mut best_muxed: Option<(VideoScore, &StreamDescriptor)> = None;
    let mut best_audio: Option<(AudioScore, &StreamDescriptor)> = None;

    for stream in streams {
        if stream.upscaled || stream.format_id.is_empty() {
            continue;
        }
        let has_video = stream.has_video();
        let has_audio = stream.has_audio();

        if has_audio && !has_video {
            let score = (audio_codec_rank(stream), stream.abr, stream.tbr);
            keep_best(&mut best_audio, score, stream);
            continue;
        }
        if !has_video {
            continue;
        }

        let height = stream.snapped_height();
        if height == 0 {
            continue;
        }
        let score = (height, video_codec_rank(&stream.vcodec), stream.tbr, stream.fps);
        if has_audio {
            keep_best(&mut best_muxed, score, stream);
        } else {
            keep_best(&mut best_video_only, score, stream);
        }
    }

    let (_, video) = best_video_only.or(best_muxed)?;
    if video.has_audio() {
        return Some(video.format_id.clone());
    }
    match best_audio {
        Some((_, audio)) => Some(format!("{}+{}", video.format_id, audio.format_id)),
        None => Some(video.format_id.clone()),
    }
}

/// Human-readable explanation for an empty key list.
pub fn policy_reason(capabilities: &Capabilities) -> String {
    if capabilities.video_count == 0 && capabilities.audio_count == 0 {
        return "No suitable format: no downloadable media streams were found at this URL."
            .to_string();
    }
    if !capabilities.has_opus_audio && !capabilities.has_m4a_audio {
        return "Policy not satisfied: this content has no Opus or M4A audio stream.".to_string();
    }
    if capabilities.video_count > 0
        && !(capabilities.has_vp9_tier() || capabilities.has_mp4_h264_1080)
    {
        return "Policy not satisfied: no VP9 (2160/1440/1080) or MP4 H.264 (1080) video stream."
            .to_string();
    }

    let mut missing = Vec::new();
    if capabilities.video_count > 0 {
        if !capabilities.has_vp9_tier() {
            missing.push("VP9 video (2160/1440/1080)");
        }
        if !capabilities.has_mp4_h264_1080 {
            missing.push("MP4 H.264 video-only (1080)");
        }
    }
    if !capabilities.has_opus_audio {
        missing.push("Opus audio");
    }
    if !capabilities.has_m4a_audio {
        missing.push("M4A audio");
    }
    if missing.is_empty() {
        "No suitable format found.".to_string()
    } else {
        format!("Policy not satisfied: missing {}", missing.join(", "))
    }
}

/// Everything a scan needs to populate the selectable list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatPlan {
    pub capabilities: Capabilities,
    pub keys: Vec<FormatKey>,
    /// Concrete selectors replacing a key's catalog expression.
    pub overrides: BTreeMap<FormatKey, String>,
    /// Set only when `keys` is empty.
    pub reason: Option<String>,
}

pub fn plan_formats(streams: &[StreamDescriptor]) -> FormatPlan {
    let capabilities = detect_capabilities(streams);
    let mut keys = permitted_format_keys(&capabilities);
    let mut overrides = BTreeMap::new();

    let has_muxed_tier = keys.iter().any(|key| key.is_muxed_tier());
    if !has_muxed_tier && capabilities.video_count > 0 && capabilities.audio_count > 0 {
        if let Some(selection) = best_effort_selection(streams) {
            log::debug!("No strict video tier; best-effort selection {selection}");
            overrides.insert(FormatKey::VideoBest, selection);
            if !keys.contains(&FormatKey::VideoBest) {
                keys.insert(0, FormatKey::VideoBest);
            }
        }
    }

    let reason = keys.is_empty().then(|| policy_reason(&capabilities));
    FormatPlan {
        capabilities,
        keys,
        overrides,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_only(id: &str, vcodec: &str, ext: &str, height: u32) -> StreamDescriptor {
        StreamDescriptor {
            format_id: id.to_string(),
            vcodec: vcodec.to_string(),
            acodec: "none".to_string(),
            ext: ext.to_string(),
            height,
            tbr: 1000.0,
            ..StreamDescriptor::default()
        }
    }

    fn audio_only(id: &str, acodec: &str, ext: &str, abr: f64) -> StreamDescriptor {
        StreamDescriptor {
            format_id: id.to_string(),
            vcodec: "none".to_string(),
            acodec: acodec.to_string(),
            ext: ext.to_string(),
            abr,
            ..StreamDescriptor::default()
        }
    }

    #[test]
    fn snaps_heights_within_tolerance_only() {
        assert_eq!(snap_height(1437), 1440);
        assert_eq!(snap_height(1092), 1080);
        assert_eq!(snap_height(708), 720);
        assert_eq!(snap_height(1200), 1200);
        assert_eq!(snap_height(0), 0);
    }

    #[test]
    fn derives_height_from_fallback_fields() {
        let raw: RawFormat = serde_json::from_value(serde_json::json!({
            "format_id": "248",
            "vcodec": "VP9",
            "acodec": "none",
            "resolution": "1920x1080",
            "height": null
        }))
        .unwrap();
        let stream = StreamDescriptor::from_raw(&raw);
        assert_eq!(stream.height, 1080);
        assert_eq!(stream.vcodec, "vp9");
        assert!(!stream.upscaled);

        let raw: RawFormat = serde_json::from_value(serde_json::json!({
            "format_id": "616",
            "format_note": "Premium 1440p (AI-upscaled)"
        }))
        .unwrap();
        let stream = StreamDescriptor::from_raw(&raw);
        assert_eq!(stream.height, 1440);
        assert!(stream.upscaled);
    }

    #[test]
    fn upscaled_streams_never_qualify() {
        let mut upscaled = video_only("sr-401", "vp09.00.50.08", "webm", 2160);
        upscaled.upscaled = true;
        let streams = vec![upscaled, audio_only("251", "opus", "webm", 130.0)];

        let capabilities = detect_capabilities(&streams);
        assert_eq!(capabilities.max_height, 0);
        assert!(!capabilities.has_vp9_2160);
        assert!(!permitted_format_keys(&capabilities).contains(&FormatKey::Video2160p));
    }

    #[test]
    fn vp9_1080_with_opus_offers_expected_keys_in_order() {
        let streams = vec![
            video_only("248", "vp9", "webm", 1080),
            audio_only("251", "opus", "webm", 130.0),
        ];
        let capabilities = detect_capabilities(&streams);
        assert!(capabilities.has_vp9_1080);
        assert!(capabilities.has_opus_audio);
        assert_eq!(capabilities.max_height, 1080);
        assert_eq!(
            permitted_format_keys(&capabilities),
            vec![
                FormatKey::Video1080p,
                FormatKey::AudioOpus,
                FormatKey::VideoOnlyMkv1080
            ]
        );
    }

    #[test]
    fn falls_back_to_best_effort_pair_without_strict_tier() {
        let streams = vec![
            video_only("136", "avc1.4d401f", "mp4", 720),
            video_only("247", "vp9", "webm", 720),
            audio_only("140", "mp4a.40.2", "m4a", 128.0),
            audio_only("251", "opus", "webm", 120.0),
        ];
        let plan = plan_formats(&streams);
        assert_eq!(
            plan.keys,
            vec![FormatKey::VideoBest, FormatKey::AudioOpus, FormatKey::AudioM4a]
        );
        assert_eq!(
            plan.overrides.get(&FormatKey::VideoBest).map(String::as_str),
            Some("247+251")
        );
        assert_eq!(plan.reason, None);
    }

    #[test]
    fn muxed_fallback_is_returned_alone() {
        let muxed = StreamDescriptor {
            format_id: "18".to_string(),
            vcodec: "avc1.42001e".to_string(),
            acodec: "mp4a.40.2".to_string(),
            ext: "mp4".to_string(),
            height: 360,
            ..StreamDescriptor::default()
        };
        let streams = vec![muxed, audio_only("251", "opus", "webm", 120.0)];
        assert_eq!(best_effort_selection(&streams).as_deref(), Some("18"));
    }

    #[test]
    fn explains_missing_requirements_in_priority_order() {
        assert!(policy_reason(&Capabilities::default()).contains("no downloadable media"));

        let video_without_audio = Capabilities {
            video_count: 2,
            has_vp9_1080: true,
            ..Capabilities::default()
        };
        assert!(policy_reason(&video_without_audio).contains("no Opus or M4A"));

        let audio_only_opus = Capabilities {
            audio_count: 1,
            has_opus_audio: true,
            ..Capabilities::default()
        };
        assert_eq!(
            policy_reason(&audio_only_opus),
            "Policy not satisfied: missing M4A audio"
        );
    }

    #[test]
    fn parses_keys_from_catalog_names() {
        assert_eq!("audio_m4a".parse::<FormatKey>().unwrap(), FormatKey::AudioM4a);
        assert!(matches!(
            "video_8k".parse::<FormatKey>(),
            Err(DownloadError::UnknownFormat(_))
        ));
        assert_eq!(format_option(FormatKey::Video1440p).height_cap, Some(1440));
        assert_eq!(
            serde_json::to_string(&FormatKey::VideoOnlyMp41080).unwrap(),
            "\"video_only_mp4_1080\""
        );
    }
}
