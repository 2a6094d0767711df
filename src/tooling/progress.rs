// Stateless parsing of yt-dlp output lines.
use super::*;
use regex::Regex;

static ANSI_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"\x1b\[[0-9;]*[A-Za-z]"));
static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"\[download\]\s+(\d{1,3}(?:[.,]\d+)?)%"));
static SPEED_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?i)\bat\s+([0-9]+(?:[.,][0-9]+)?)\s*([KMGTP]?i?B)/s\b")
});
static ETA_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)\bETA\s+([0-9:]+|Unknown)\b"));
static PLAYLIST_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"(?i)Downloading\s+(?:item|video)\s+(\d+)\s*(?:(?:out\s+)?of\s+|/)\s*(\d+)")
});

/// Position reported by a `Downloading item I of N` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistPosition {
    pub index: u32,
    pub total: u32,
}

/// Everything one output line can tell about a running download.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLine {
    /// The line with ANSI escapes removed, untrimmed.
    pub plain: String,
    pub fraction: Option<f64>,
    pub speed_mbps: Option<f64>,
    pub eta: Option<String>,
    pub playlist_item: Option<PlaylistPosition>,
}

pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(line, "").into_owned()
}

fn parse_decimal(raw: &str) -> Option<f64> {
    raw.replace(',', ".").parse::<f64>().ok()
}

/// Completion fraction in `[0, 1]` from a `[download]  NN.N%` line.
pub fn parse_progress(line: &str) -> Option<f64> {
    let plain = strip_ansi(line);
    let captures = PERCENT_RE.captures(&plain)?;
    let percent = parse_decimal(captures.get(1)?.as_str())?;
    Some(percent.clamp(0.0, 100.0) / 100.0)
}

fn unit_multiplier(unit: &str) -> f64 {
    let base: f64 = if unit.contains('i') || unit.contains('I') {
        1024.0
    } else {
        1000.0
    };
    let power = match unit.chars().next().map(|ch| ch.to_ascii_lowercase()) {
        Some('k') => 1,
        Some('m') => 2,
        Some('g') => 3,
        Some('t') => 4,
        Some('p') => 5,
        _ => 0,
    };
    base.powi(power)
}

/// Transfer speed in decimal megabits per second and the ETA token, each when present.
pub fn parse_speed_eta(line: &str) -> (Option<f64>, Option<String>) {
    let plain = strip_ansi(line);
    let speed = SPEED_RE.captures(&plain).and_then(|captures| {
        let value = parse_decimal(captures.get(1)?.as_str())?;
        let bytes_per_second = value * unit_multiplier(captures.get(2)?.as_str());
        Some(bytes_per_second * 8.0 / 1_000_000.0)
    });
    let eta = ETA_RE
        .captures(&plain)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str().to_string());
    (speed, eta)
}

pub fn parse_playlist_item(line: &str) -> Option<PlaylistPosition> {
    let plain = strip_ansi(line);
    let captures = PLAYLIST_ITEM_RE.captures(&plain)?;
    Some(PlaylistPosition {
        index: captures.get(1)?.as_str().parse().ok()?,
        total: captures.get(2)?.as_str().parse().ok()?,
    })
}

/// Strips escapes once and runs every extractor over the result.
pub fn parse_line(line: &str) -> ParsedLine {
    let plain = strip_ansi(line);
    let (speed_mbps, eta) = parse_speed_eta(&plain);
    ParsedLine {
        fraction: parse_progress(&plain),
        speed_mbps,
        eta,
        playlist_item: parse_playlist_item(&plain),
        plain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_percentages_with_either_decimal_separator() {
        let fraction = parse_progress("[download]  12.3% of 40.00MiB").unwrap();
        assert!((fraction - 0.123).abs() < 1e-12);
        assert_eq!(
            parse_progress("[download]  12,3% of 40.00MiB"),
            parse_progress("[download]  12.3% of 40.00MiB")
        );
        assert_eq!(parse_progress("[download] 100% of 3.2MiB"), Some(1.0));
        assert_eq!(parse_progress("[download] 450% weird"), Some(1.0));
        assert_eq!(parse_progress("[info] 12.3% nothing"), None);
    }

    #[test]
    fn strips_color_codes_before_matching() {
        let colored = "\x1b[0;94m[download]\x1b[0m  \x1b[0;32m 42.0%\x1b[0m";
        assert_eq!(strip_ansi(colored), "[download]   42.0%");
        assert_eq!(parse_progress(colored), Some(0.42));
    }

    #[test]
    fn converts_binary_and_decimal_speeds_to_megabits() {
        let (speed, eta) = parse_speed_eta("[download]  5.0% of 10MiB at 1.5MiB/s ETA 00:07");
        let speed = speed.unwrap();
        assert!((speed - 12.582912).abs() < 1e-6);
        assert_eq!(eta.as_deref(), Some("00:07"));

        let (speed, _) = parse_speed_eta("at 2,5MB/s");
        assert!((speed.unwrap() - 20.0).abs() < 1e-9);

        let (speed, eta) = parse_speed_eta("at 800KiB/s ETA Unknown");
        assert!((speed.unwrap() - 6.5536).abs() < 1e-9);
        assert_eq!(eta.as_deref(), Some("Unknown"));
    }

    #[test]
    fn recognizes_playlist_positions() {
        assert_eq!(
            parse_playlist_item("[download] Downloading item 3 of 12"),
            Some(PlaylistPosition { index: 3, total: 12 })
        );
        assert_eq!(
            parse_playlist_item("[download] Downloading video 2 out of 5"),
            Some(PlaylistPosition { index: 2, total: 5 })
        );
        assert_eq!(
            parse_playlist_item("Downloading video 4/9"),
            Some(PlaylistPosition { index: 4, total: 9 })
        );
        assert_eq!(parse_playlist_item("[download]  50.0% of 1MiB"), None);
    }

    #[test]
    fn playlist_lines_are_distinct_from_progress_lines() {
        let parsed = parse_line("[download] Downloading item 1 of 2");
        assert_eq!(parsed.fraction, None);
        assert!(parsed.playlist_item.is_some());

        let parsed = parse_line("[download]  50.0% of 1MiB at 1MB/s ETA 00:01");
        assert_eq!(parsed.fraction, Some(0.5));
        assert_eq!(parsed.playlist_item, None);
        assert!(parsed.speed_mbps.is_some());
    }
}
