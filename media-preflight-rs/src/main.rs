//! Terminal pre-call check: list devices, meter the microphone and play a
//! test tone on the chosen speaker.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use media_preflight_rs::platform::CpalHost;
use media_preflight_rs::{
    logging, CaptureKind, DeviceKind, MediaEvent, MediaSessionManager, PlaybackOutcome,
    PreflightConfig,
};

#[derive(Parser, Debug)]
#[command(name = "media-preflight", version, about = "Check microphone and speakers before a call")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List capture and playback devices
    Devices,

    /// Meter the microphone, then play a test tone
    Check {
        /// Microphone id (default device when omitted)
        #[arg(long)]
        mic: Option<String>,

        /// Speaker id (default output when omitted)
        #[arg(long)]
        speaker: Option<String>,

        /// Seconds to meter the microphone
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },

    /// Play the test tone only
    Tone {
        #[arg(long)]
        speaker: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PreflightConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => PreflightConfig::default(),
    };
    logging::init(config.log_filter.as_deref());

    let manager = Arc::new(
        MediaSessionManager::new(Arc::new(CpalHost::new()), config)
            .context("invalid configuration")?,
    );
    manager.sync_permissions().await;
    manager
        .refresh_catalog()
        .await
        .context("enumerating devices")?;
    manager.watch_devices();

    let result = match cli.command.unwrap_or(Command::Check {
        mic: None,
        speaker: None,
        seconds: 5,
    }) {
        Command::Devices => {
            list_devices(&manager);
            Ok(())
        }
        Command::Check {
            mic,
            speaker,
            seconds,
        } => {
            tokio::select! {
                result = check(&manager, mic, speaker, seconds) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    Ok(())
                }
            }
        }
        Command::Tone { speaker } => play_tone(&manager, speaker.as_deref()).await,
    };

    manager.stop_watching().await;
    manager.teardown_all().await;
    result
}

fn list_devices(manager: &MediaSessionManager) {
    let catalog = manager.catalog();
    for kind in [DeviceKind::Camera, DeviceKind::Microphone, DeviceKind::Speaker] {
        println!("{kind}:");
        let devices = catalog.devices(kind);
        if devices.is_empty() {
            println!("  (none)");
        }
        for device in devices {
            println!("  {:<40} {}", device.display_name(), device.id);
        }
    }
}

async fn check(
    manager: &MediaSessionManager,
    mic: Option<String>,
    speaker: Option<String>,
    seconds: u64,
) -> Result<()> {
    let mut events = manager.subscribe_events();
    manager
        .select_device(DeviceKind::Microphone, mic.as_deref())
        .await
        .context("selecting microphone")?;
    manager
        .select_device(DeviceKind::Speaker, speaker.as_deref())
        .await
        .context("selecting speaker")?;

    let snapshot = manager
        .start_kind(CaptureKind::Audio)
        .await
        .context("opening microphone")?;
    if let Some(track) = &snapshot.audio {
        println!("Microphone: {}", track.label());
    }

    let mut readings = manager.level_readings();
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            changed = readings.changed() => {
                if changed.is_err() {
                    break;
                }
                let percent = readings.borrow_and_update().percent();
                let bar = "#".repeat((percent / 2.5) as usize);
                print!("\r[{bar:<40}] {percent:5.1}%");
                let _ = std::io::stdout().flush();
            }
            Ok(event) = events.recv() => {
                if let MediaEvent::SelectionCleared { kind, device_id } = event {
                    println!("\n{kind} {device_id} disconnected, using default");
                }
            }
        }
    }
    println!();

    manager.stop_kind(CaptureKind::Audio).await;
    play_tone(manager, None).await
}

async fn play_tone(manager: &MediaSessionManager, speaker: Option<&str>) -> Result<()> {
    let outcome = match speaker {
        Some(id) => manager.play_test_signal(Some(id)).await,
        None => manager.play_on_selected_output().await,
    }
    .context("playing test tone")?;

    match outcome {
        PlaybackOutcome::Routed { output_id } => println!("Played test tone on {output_id}"),
        PlaybackOutcome::DefaultOutput => println!("Played test tone on the default output"),
        PlaybackOutcome::FellBackToDefault { requested, reason } => {
            println!("Could not use {requested} ({reason}); played on the default output")
        }
    }
    Ok(())
}
