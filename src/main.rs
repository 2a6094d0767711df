use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thiserror::Error;
use vidfetch_lib::{
    format_option, probe_playlist, scan_formats, selected_total, spawn_download,
    spawn_update_check, ChannelObserver, ConfigError, DownloadError, DownloadOutcome,
    DownloadRequest, FormatKey, JobEvent, JobPhase, PlaylistOrdinal, ProbeError, ProgressUpdate,
    ScanOutcome, ScanRequest, StatusEvent, ToolContext,
};

/// Probe and download videos with yt-dlp under a fixed format policy.
#[derive(Parser, Debug)]
#[command(name = "vidfetch", author, version, about)]
struct Cli {
    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// List the format keys the policy permits for a URL
    Scan {
        url: String,
        /// Treat the URL as a playlist
        #[arg(long)]
        playlist: bool,
        /// yt-dlp playlist item spec, e.g. "1:5,8"
        #[arg(long)]
        items: Option<String>,
    },
    /// Download a URL with one of the catalog format keys
    Download {
        url: String,
        #[arg(short, long)]
        format: FormatKey,
        /// Output directory (defaults to the configured download folder)
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        playlist: bool,
        #[arg(long)]
        items: Option<String>,
        /// Explicit yt-dlp selector replacing the catalog expression
        #[arg(long = "override")]
        selection_override: Option<String>,
    },
    /// Check for a newer managed yt-dlp
    Update {
        /// Ignore the check interval and the auto-update setting
        #[arg(long)]
        force: bool,
    },
    /// Show which external tools were resolved
    Status,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("Failed to install the Ctrl-C handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("yt-dlp update check did not complete")]
    Update,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli.command) {
        Ok(code) => code,
        Err(error) => {
            log::error!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: CliCommand) -> Result<ExitCode, CliError> {
    let context = ToolContext::from_system()?;
    match command {
        CliCommand::Scan {
            url,
            playlist,
            items,
        } => scan(
            &context,
            ScanRequest {
                url,
                playlist_mode: playlist,
                playlist_items: items,
            },
        ),
        CliCommand::Download {
            url,
            format,
            output,
            playlist,
            items,
            selection_override,
        } => {
            let output_dir = output.unwrap_or_else(|| context.default_download_dir());
            let request = DownloadRequest {
                url,
                output_dir,
                format_key: format,
                selection_override,
                playlist,
                playlist_items: items,
            };
            download(context, request)
        }
        CliCommand::Update { force } => {
            let report = spawn_update_check(Arc::new(context), force)
                .join()
                .ok()
                .flatten();
            match report {
                Some(report) if report.updated => {
                    println!(
                        "yt-dlp updated: {} -> {}",
                        report.old.as_deref().unwrap_or("(none)"),
                        report.new.as_deref().unwrap_or_default()
                    );
                    Ok(ExitCode::SUCCESS)
                }
                Some(report) => {
                    match report.new {
                        Some(latest) => println!("yt-dlp is up to date ({latest})"),
                        None => println!("yt-dlp update check skipped"),
                    }
                    Ok(ExitCode::SUCCESS)
                }
                None if force => Err(CliError::Update),
                None => Ok(ExitCode::SUCCESS),
            }
        }
        CliCommand::Status => {
            for status in context.status() {
                let state = if status.available { "ok" } else { "missing" };
                println!(
                    "{:<9} {:<8} {:<8} {}",
                    status.name,
                    state,
                    status.source,
                    status
                        .version
                        .or(status.path)
                        .or(status.message)
                        .unwrap_or_default()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn scan(context: &ToolContext, request: ScanRequest) -> Result<ExitCode, CliError> {
    match scan_formats(context, &request)? {
        ScanOutcome::Ready {
            title,
            keys,
            overrides,
            preferred_index,
            playlist,
            suggest_playlist,
            ..
        } => {
            if !title.is_empty() {
                println!("{title}");
            }
            if let Some(meta) = playlist.filter(|meta| meta.is_playlist) {
                println!("Playlist: {} ({} items)", meta.title, meta.count);
            }
            for (index, key) in keys.iter().enumerate() {
                let marker = if index == preferred_index { '*' } else { ' ' };
                let option = format_option(*key);
                match overrides.get(key) {
                    Some(selector) => println!("{marker} {key:<20} {} [{selector}]", option.label),
                    None => println!("{marker} {key:<20} {}", option.label),
                }
            }
            if suggest_playlist {
                println!("This video belongs to a playlist; pass --playlist to download all of it.");
            }
            Ok(ExitCode::SUCCESS)
        }
        ScanOutcome::PlaylistModeRequired { playlist } => {
            println!(
                "\"{}\" is a playlist link ({} items); rerun with --playlist.",
                playlist.title, playlist.count
            );
            Ok(ExitCode::from(2))
        }
        ScanOutcome::NoOptions { reason, .. } => {
            println!("{reason}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_progress(update: &ProgressUpdate, ordinal: &PlaylistOrdinal) {
    let mut line = format!("\r{:5.1}%", update.fraction * 100.0);
    if let Some(speed) = update.speed_mbps {
        line.push_str(&format!("  {speed:.1} Mbps"));
    }
    if let Some(eta) = update.eta.as_deref() {
        line.push_str(&format!("  ETA {eta}"));
    }
    line.push_str(&ordinal.suffix());
    let mut stdout = std::io::stdout().lock();
    let _ = write!(stdout, "{line:<48}");
    let _ = stdout.flush();
}

fn download(context: ToolContext, request: DownloadRequest) -> Result<ExitCode, CliError> {
    let context = Arc::new(context);
    let probe_count = if request.playlist {
        probe_playlist(&context, &request.url)
            .map(|meta| meta.count)
            .unwrap_or(0)
    } else {
        0
    };
    let mut ordinal = PlaylistOrdinal::new(selected_total(
        request.playlist_items.as_deref(),
        probe_count,
    ));

    let (observer, events) = ChannelObserver::new();
    let handle = spawn_download(Arc::clone(&context), request, Arc::new(observer));
    let token = handle.cancellation_token();
    ctrlc::set_handler(move || token.cancel())?;

    // The channel closes once the worker drops its observer.
    for event in events {
        match event {
            JobEvent::Progress(update) => print_progress(&update, &ordinal),
            JobEvent::Status(StatusEvent::PlaylistItem { index, total }) => {
                ordinal.observe(index, total);
            }
            JobEvent::Status(StatusEvent::Message { text }) => {
                println!();
                log::info!("{text}{}", ordinal.suffix());
            }
            JobEvent::Status(StatusEvent::AddingCover) => log::info!("Adding cover art"),
            JobEvent::Status(StatusEvent::Cancelling) => {
                println!();
                log::warn!("Cancelling...");
            }
            JobEvent::Status(StatusEvent::FinalizingAfterCancel) => {
                log::info!("Finalizing files finished before cancel");
            }
            JobEvent::Status(StatusEvent::Phase { phase }) => match phase {
                JobPhase::PostProcessing => log::info!("Post-processing"),
                phase => log::debug!("Phase: {phase:?}"),
            },
        }
    }
    println!();

    match handle.join()? {
        DownloadOutcome::Completed { path } => {
            println!("Saved to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        DownloadOutcome::Cancelled { finalized } => {
            match finalized {
                Some(path) => println!("Cancelled; finished items kept in {}", path.display()),
                None => println!("Cancelled"),
            }
            Ok(ExitCode::from(130))
        }
    }
}
