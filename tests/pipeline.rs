#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use vidfetch_lib::{
    cleanup_cancel_artifacts, download, run_cancellable, scan_formats, spawn_download,
    CancellationToken, DownloadError, DownloadObserver, DownloadOutcome, DownloadRequest,
    FormatKey, JobPhase, ProgressUpdate, RuntimeToolsSettings, ScanOutcome, ScanRequest,
    StatusEvent, ToolContext, ToolPaths, CANCELLED_EXIT_CODE,
};

// Any fork racing a script write can make the later exec fail with ETXTBSY.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Recorder {
    progress: Mutex<Vec<ProgressUpdate>>,
    status: Mutex<Vec<StatusEvent>>,
}

impl Recorder {
    fn phases(&self) -> Vec<JobPhase> {
        self.status
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                StatusEvent::Phase { phase } => Some(*phase),
                _ => None,
            })
            .collect()
    }
}

impl DownloadObserver for Recorder {
    fn on_progress(&self, update: ProgressUpdate) {
        self.progress.lock().unwrap().push(update);
    }

    fn on_status(&self, event: StatusEvent) {
        self.status.lock().unwrap().push(event);
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Shell prologue that leaves yt-dlp's `-P` value in `$out`.
const FIND_OUTPUT_DIR: &str = r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-P" ]; then out="$2"; shift; fi
  shift
done"#;

struct Fixture {
    root: tempfile::TempDir,
    output: tempfile::TempDir,
    context: ToolContext,
}

impl Fixture {
    /// Everything the fake ffmpeg was invoked with, one line per call.
    fn ffmpeg_calls(&self) -> String {
        fs::read_to_string(self.root.path().join("bin/ffmpeg.log")).unwrap_or_default()
    }

    fn output_file(&self, name: &str) -> PathBuf {
        fs::canonicalize(self.output.path()).unwrap().join(name)
    }
}

/// Fake ffmpeg: logs its arguments and writes `muxed` to its last argument (the output file).
const RECORDING_FFMPEG: &str = r#"echo "$*" >> "$(dirname "$0")/ffmpeg.log"
for last; do :; done
printf 'muxed' > "$last""#;

fn fixture(ytdlp_body: &str) -> Fixture {
    fixture_with(ytdlp_body, "exit 0", None)
}

fn fixture_with(ytdlp_body: &str, ffmpeg_body: &str, ffprobe_body: Option<&str>) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let bin = root.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    let ytdlp = write_script(&bin, "yt-dlp", ytdlp_body);
    let ffmpeg = write_script(&bin, "ffmpeg", ffmpeg_body);
    let ffprobe = ffprobe_body.map(|body| write_script(&bin, "ffprobe", body));

    let settings = RuntimeToolsSettings {
        ytdlp_mode: "custom".to_string(),
        ytdlp_custom_path: Some(ytdlp.to_string_lossy().to_string()),
        ffmpeg_custom_path: Some(ffmpeg.to_string_lossy().to_string()),
        ffprobe_custom_path: ffprobe.map(|path| path.to_string_lossy().to_string()),
        auto_update_ytdlp: false,
        ..RuntimeToolsSettings::default()
    };
    let context = ToolContext::initialize(ToolPaths::under(&root.path().join("app")), settings);
    Fixture {
        root,
        output,
        context,
    }
}

fn request(output_dir: &Path, format_key: FormatKey) -> DownloadRequest {
    DownloadRequest {
        url: "https://www.youtube.com/watch?v=abcdefghijk".to_string(),
        output_dir: output_dir.to_path_buf(),
        format_key,
        selection_override: None,
        playlist: false,
        playlist_items: None,
    }
}

#[test]
fn muxed_download_reports_progress_and_final_path() {
    let _guard = serial();
    let fixture = fixture(&format!(
        r#"{FIND_OUTPUT_DIR}
printf '[download]  50.0%% of 10.00MiB at  1.00MiB/s ETA 00:05\r'
printf '[download] 100.0%% of 10.00MiB at  1.00MiB/s ETA 00:00\n'
touch "$out/clip [abcdefghijk].mp4"
echo "$out/clip [abcdefghijk].mp4""#
    ));
    let recorder = Recorder::default();

    let outcome = download(
        &fixture.context,
        &request(fixture.output.path(), FormatKey::VideoBest),
        &recorder,
        &CancellationToken::new(),
    )
    .unwrap();

    let expected = fs::canonicalize(fixture.output.path())
        .unwrap()
        .join("clip [abcdefghijk].mp4");
    assert_eq!(outcome, DownloadOutcome::Completed { path: expected });

    let progress = recorder.progress.lock().unwrap();
    assert_eq!(progress.first().map(|update| update.fraction), Some(0.5));
    let first_speed = progress[0].speed_mbps.unwrap();
    assert!((first_speed - 8.388608).abs() < 1e-6);
    assert_eq!(progress[0].eta.as_deref(), Some("00:05"));
    assert_eq!(progress.last().map(|update| update.fraction), Some(1.0));
    drop(progress);

    assert_eq!(
        recorder.phases(),
        vec![JobPhase::Preparing, JobPhase::Running, JobPhase::Completed]
    );
}

#[test]
fn network_failure_cleans_partial_files() {
    let _guard = serial();
    let fixture = fixture(&format!(
        r#"{FIND_OUTPUT_DIR}
touch "$out/clip.mp4.part" "$out/clip.mp4.ytdl"
echo "ERROR: [youtube] abcdefghijk: Unable to download webpage: <urlopen error [Errno -3] Temporary failure in name resolution>" >&2
exit 1"#
    ));
    let kept = fixture.output.path().join("notes.txt");
    fs::write(&kept, "keep me").unwrap();
    let recorder = Recorder::default();

    let error = download(
        &fixture.context,
        &request(fixture.output.path(), FormatKey::VideoBest),
        &recorder,
        &CancellationToken::new(),
    )
    .unwrap_err();

    assert!(error.is_network(), "unexpected error: {error}");
    assert!(!fixture.output.path().join("clip.mp4.part").exists());
    assert!(!fixture.output.path().join("clip.mp4.ytdl").exists());
    assert!(kept.exists());
    assert_eq!(recorder.phases().last(), Some(&JobPhase::Failed));
}

#[test]
fn other_failures_keep_partial_files() {
    let _guard = serial();
    let fixture = fixture(&format!(
        r#"{FIND_OUTPUT_DIR}
touch "$out/clip.mp4.part"
echo "ERROR: Requested format is not available" >&2
exit 1"#
    ));

    let error = download(
        &fixture.context,
        &request(fixture.output.path(), FormatKey::VideoBest),
        &(),
        &CancellationToken::new(),
    )
    .unwrap_err();

    assert!(matches!(error, DownloadError::Failed(_)), "unexpected error: {error}");
    assert!(fixture.output.path().join("clip.mp4.part").exists());
}

#[test]
fn cancelled_download_stops_tool_and_removes_partials() {
    let _guard = serial();
    let fixture = fixture(&format!(
        r#"{FIND_OUTPUT_DIR}
touch "$out/clip.webm.part"
printf '[download]   3.0%% of 80.00MiB at  2.00MiB/s ETA 00:39\n'
sleep 30"#
    ));
    let recorder = Arc::new(Recorder::default());
    let context = Arc::new(fixture.context.clone());

    let handle = spawn_download(
        context,
        request(fixture.output.path(), FormatKey::VideoBest),
        recorder.clone(),
    );
    let partial = fixture.output.path().join("clip.webm.part");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !partial.exists() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(partial.exists(), "fake yt-dlp never started");

    let cancelled_at = Instant::now();
    handle.cancel();
    let outcome = handle.join().unwrap();

    assert_eq!(outcome, DownloadOutcome::Cancelled { finalized: None });
    assert!(cancelled_at.elapsed() < Duration::from_secs(8));
    assert!(!partial.exists());
    let status = recorder.status.lock().unwrap();
    assert!(status.contains(&StatusEvent::Cancelling));
    assert_eq!(
        status.last(),
        Some(&StatusEvent::Phase {
            phase: JobPhase::Cancelled
        })
    );
}

#[test]
fn auxiliary_runner_force_kills_tools_that_ignore_term() {
    let _guard = serial();
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg("trap '' TERM; sleep 30")
        .process_group(0);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        trigger.cancel();
    });

    let started = Instant::now();
    let (code, marker) = run_cancellable(command, &cancel).unwrap();
    canceller.join().unwrap();

    assert_eq!(code, CANCELLED_EXIT_CODE);
    assert_eq!(marker, "cancelled");
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn cleanup_only_touches_files_from_the_current_job() {
    let dir = tempfile::tempdir().unwrap();
    let old_partial = dir.path().join("older.mp4.part");
    fs::write(&old_partial, b"old").unwrap();
    let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
    fs::File::options()
        .write(true)
        .open(&old_partial)
        .unwrap()
        .set_modified(an_hour_ago)
        .unwrap();

    let started = SystemTime::now();
    for name in [
        "clip.mp4.part",
        "clip.mp4.ytdl",
        "clip [abcdefghijk].webp",
        "clip [abcdefghijk].mp4",
    ] {
        fs::write(dir.path().join(name), b"new").unwrap();
    }
    let nested = dir.path().join("Playlist");
    fs::create_dir_all(&nested).unwrap();
    fs::write(nested.join("01 - track.m4a.part"), b"new").unwrap();

    assert_eq!(cleanup_cancel_artifacts(dir.path(), started, false), 3);
    assert!(old_partial.exists());
    assert!(dir.path().join("clip [abcdefghijk].mp4").exists());
    assert!(nested.join("01 - track.m4a.part").exists());

    assert_eq!(cleanup_cancel_artifacts(dir.path(), started, true), 1);
    assert_eq!(cleanup_cancel_artifacts(dir.path(), started, true), 0);
}

const FORMATS_JSON: &str = r#"{
  "title": "Sample clip",
  "formats": [
    {"format_id": "sb0", "vcodec": "none", "acodec": "none", "ext": "mhtml", "format_note": "storyboard"},
    {"format_id": "251", "vcodec": "none", "acodec": "opus", "ext": "webm", "abr": 130.2},
    {"format_id": "248", "vcodec": "vp9", "acodec": "none", "ext": "webm", "height": 1080, "tbr": 2500.0, "fps": 30},
    {"format_id": "137", "vcodec": "avc1.640028", "acodec": "none", "ext": "mp4", "height": 1080, "tbr": 4300.0, "fps": 30}
  ]
}"#;

#[test]
fn scan_lists_policy_keys_with_opus_preferred() {
    let _guard = serial();
    let json_dir = tempfile::tempdir().unwrap();
    let json_path = json_dir.path().join("formats.json");
    fs::write(&json_path, FORMATS_JSON).unwrap();
    let fixture = fixture(&format!("cat '{}'", json_path.display()));

    let outcome = scan_formats(
        &fixture.context,
        &ScanRequest {
            url: "https://www.youtube.com/watch?v=abcdefghijk".to_string(),
            ..ScanRequest::default()
        },
    )
    .unwrap();

    match outcome {
        ScanOutcome::Ready {
            title,
            keys,
            overrides,
            preferred_index,
            capabilities,
            playlist,
            suggest_playlist,
        } => {
            assert_eq!(title, "Sample clip");
            assert_eq!(
                keys,
                vec![
                    FormatKey::Video1080p,
                    FormatKey::AudioOpus,
                    FormatKey::VideoOnlyMkv1080,
                    FormatKey::VideoOnlyMp41080,
                ]
            );
            assert!(overrides.is_empty());
            assert_eq!(preferred_index, 1);
            assert_eq!(capabilities.max_height, 1080);
            assert!(playlist.is_none());
            assert!(!suggest_playlist);
        }
        other => panic!("unexpected scan outcome: {other:?}"),
    }
}

/// Reports the webp thumbnail as the larger image regardless of file size.
const SIZING_FFPROBE: &str = r#"case "$*" in
  *.webp) echo 1280x720 ;;
  *) echo 320x180 ;;
esac"#;

#[test]
fn m4a_download_embeds_largest_cover_and_removes_thumbnails() {
    let _guard = serial();
    let fixture = fixture_with(
        &format!(
            r#"{FIND_OUTPUT_DIR}
printf 'audio' > "$out/song [abcdefghijk].m4a"
printf 'a much larger jpeg payload' > "$out/song [abcdefghijk].jpg"
printf 'webp' > "$out/song [abcdefghijk].webp"
echo "$out/song [abcdefghijk].m4a""#
        ),
        RECORDING_FFMPEG,
        Some(SIZING_FFPROBE),
    );
    let recorder = Recorder::default();

    let outcome = download(
        &fixture.context,
        &request(fixture.output.path(), FormatKey::AudioM4a),
        &recorder,
        &CancellationToken::new(),
    )
    .unwrap();

    let media = fixture.output_file("song [abcdefghijk].m4a");
    assert_eq!(outcome, DownloadOutcome::Completed { path: media.clone() });
    assert_eq!(fs::read_to_string(&media).unwrap(), "muxed");

    let calls = fixture.ffmpeg_calls();
    assert_eq!(calls.lines().count(), 1);
    assert!(calls.contains("attached_pic"));
    assert!(calls.contains("song [abcdefghijk].webp"));
    assert!(calls.contains(".__cover_tmp__.m4a"));

    let leftovers: Vec<String> = fs::read_dir(fixture.output.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(leftovers, vec!["song [abcdefghijk].m4a".to_string()]);

    let status = recorder.status.lock().unwrap();
    assert!(status.contains(&StatusEvent::AddingCover));
    assert!(status.contains(&StatusEvent::Phase {
        phase: JobPhase::PostProcessing
    }));
}

#[test]
fn opus_download_remuxes_and_drops_the_source() {
    let _guard = serial();
    let fixture = fixture_with(
        &format!(
            r#"{FIND_OUTPUT_DIR}
printf 'audio' > "$out/song [abcdefghijk].webm"
printf 'cover' > "$out/song [abcdefghijk].jpg"
echo "$out/song [abcdefghijk].webm""#
        ),
        RECORDING_FFMPEG,
        Some(SIZING_FFPROBE),
    );
    let recorder = Recorder::default();

    let outcome = download(
        &fixture.context,
        &request(fixture.output.path(), FormatKey::AudioOpus),
        &recorder,
        &CancellationToken::new(),
    )
    .unwrap();

    let opus = fixture.output_file("song [abcdefghijk].opus");
    assert_eq!(outcome, DownloadOutcome::Completed { path: opus.clone() });
    assert_eq!(fs::read_to_string(&opus).unwrap(), "muxed");
    assert!(!fixture.output.path().join("song [abcdefghijk].webm").exists());
    assert!(!fixture.output.path().join("song [abcdefghijk].jpg").exists());

    let calls = fixture.ffmpeg_calls();
    assert!(calls.contains("-c:a copy"));
    assert!(calls.contains("song [abcdefghijk].webm"));
    assert!(recorder
        .status
        .lock()
        .unwrap()
        .contains(&StatusEvent::AddingCover));
}

#[test]
fn cancelled_audio_run_still_finalizes_reported_files() {
    let _guard = serial();
    let fixture = fixture_with(
        &format!(
            r#"{FIND_OUTPUT_DIR}
printf 'audio' > "$out/song [abcdefghijk].m4a"
printf 'cover' > "$out/song [abcdefghijk].jpg"
echo "$out/song [abcdefghijk].m4a"
touch "$out/ready.flag"
sleep 30"#
        ),
        RECORDING_FFMPEG,
        Some(SIZING_FFPROBE),
    );
    let recorder = Arc::new(Recorder::default());

    let handle = spawn_download(
        Arc::new(fixture.context.clone()),
        request(fixture.output.path(), FormatKey::AudioM4a),
        recorder.clone(),
    );
    let ready = fixture.output.path().join("ready.flag");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !ready.exists() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(ready.exists(), "fake yt-dlp never reported its file");
    thread::sleep(Duration::from_millis(400));

    handle.cancel();
    let outcome = handle.join().unwrap();

    let media = fixture.output_file("song [abcdefghijk].m4a");
    assert_eq!(
        outcome,
        DownloadOutcome::Cancelled {
            finalized: Some(media.clone())
        }
    );
    assert_eq!(fs::read_to_string(&media).unwrap(), "muxed");
    assert!(fixture.ffmpeg_calls().contains("attached_pic"));
    assert!(!fixture.output.path().join("song [abcdefghijk].jpg").exists());

    let status = recorder.status.lock().unwrap();
    assert!(status.contains(&StatusEvent::Cancelling));
    assert!(status.contains(&StatusEvent::FinalizingAfterCancel));
    assert_eq!(
        status.last(),
        Some(&StatusEvent::Phase {
            phase: JobPhase::Cancelled
        })
    );
}

#[test]
fn mp4_video_only_rejects_other_containers() {
    let _guard = serial();
    let fixture = fixture(&format!(
        r#"{FIND_OUTPUT_DIR}
touch "$out/clip [abcdefghijk].webm"
echo "$out/clip [abcdefghijk].webm""#
    ));

    let error = download(
        &fixture.context,
        &request(fixture.output.path(), FormatKey::VideoOnlyMp41080),
        &(),
        &CancellationToken::new(),
    )
    .unwrap_err();

    assert!(matches!(error, DownloadError::NoMp4VideoOnly), "unexpected error: {error}");
}

#[test]
fn m4a_format_rejects_non_m4a_audio() {
    let _guard = serial();
    let fixture = fixture_with(
        &format!(
            r#"{FIND_OUTPUT_DIR}
touch "$out/song [abcdefghijk].webm"
echo "$out/song [abcdefghijk].webm""#
        ),
        RECORDING_FFMPEG,
        None,
    );

    let error = download(
        &fixture.context,
        &request(fixture.output.path(), FormatKey::AudioM4a),
        &(),
        &CancellationToken::new(),
    )
    .unwrap_err();

    assert!(matches!(error, DownloadError::NoM4aAudio), "unexpected error: {error}");
    assert!(fixture.ffmpeg_calls().is_empty());
}
