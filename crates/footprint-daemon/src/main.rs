mod alert;
mod ingest;
mod screenshot;
mod service;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use footprint_core::capture::ScreenCapturer;
use footprint_core::config::{init_logging, AppConfig};
use footprint_core::schema::{NewBookmark, PurgeWindow};
use footprint_core::{Recorder, StorageRoot};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::alert::DesktopAlert;
use crate::screenshot::{spawn_screenshot_worker, ChannelScreenshotSink, CommandCapturer};
use crate::service::{RecorderService, BUS_NAME, OBJECT_PATH};

#[derive(Parser)]
#[command(name = "footprint-daemon", about = "Footprint desktop activity recorder")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand given)
    Run,
    /// Pause recording
    Pause,
    /// Resume recording
    Resume,
    /// Show recorder status
    Status,
    /// Delete recorded history and media
    #[command(group(ArgGroup::new("scope").required(true).args(["minutes", "older_than_days", "all"])))]
    Purge {
        /// Forget the last N minutes
        #[arg(long)]
        minutes: Option<u64>,
        /// Delete everything older than N days
        #[arg(long)]
        older_than_days: Option<u64>,
        /// Delete everything
        #[arg(long)]
        all: bool,
    },
    /// Write CSV reports under the current storage root
    Export {
        /// Limit the activity report to these window ids
        #[arg(long = "window")]
        windows: Vec<i64>,
    },
    /// Leave a note on the timeline
    Bookmark {
        text: String,
        /// How far back the note refers to, e.g. "5 min ago"
        #[arg(long)]
        delay: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon().await,
        Command::Pause => dbus_client_call("Pause").await,
        Command::Resume => dbus_client_call("Resume").await,
        Command::Status => dbus_client_status().await,
        Command::Purge {
            minutes,
            older_than_days,
            all,
        } => {
            let (scope, minutes) = match (minutes, older_than_days, all) {
                (_, _, true) => ("all", 0),
                (Some(m), _, _) => ("recent", m),
                (_, Some(days), _) => ("older", days.saturating_mul(24 * 60)),
                _ => anyhow::bail!("choose --minutes, --older-than-days or --all"),
            };
            let reply = call("Purge", &(scope, minutes)).await?;
            let report: String = reply.body().deserialize()?;
            println!("{report}");
            Ok(())
        }
        Command::Export { windows } => {
            let reply = call("Export", &(windows,)).await?;
            let dir: String = reply.body().deserialize()?;
            println!("reports written to {dir}");
            Ok(())
        }
        Command::Bookmark { text, delay } => {
            let bookmark = NewBookmark {
                time: Utc::now(),
                text,
                audio_file: None,
                delay,
            };
            let reply = call("Bookmark", &(serde_json::to_string(&bookmark)?,)).await?;
            let id: i64 = reply.body().deserialize()?;
            println!("bookmark #{id} saved");
            Ok(())
        }
    }
}

async fn call<B>(method: &str, body: &B) -> anyhow::Result<zbus::Message>
where
    B: serde::Serialize + zbus::zvariant::DynamicType,
{
    let conn = zbus::Connection::session().await?;
    let reply = conn
        .call_method(Some(BUS_NAME), OBJECT_PATH, Some(BUS_NAME), method, body)
        .await?;
    Ok(reply)
}

async fn dbus_client_call(method: &str) -> anyhow::Result<()> {
    call(method, &()).await?;
    println!("{method} command sent successfully");
    Ok(())
}

async fn dbus_client_status() -> anyhow::Result<()> {
    let reply = call("GetStatus", &()).await?;
    let status_json: String = reply.body().deserialize()?;
    let status: serde_json::Value = serde_json::from_str(&status_json)?;

    // Pretty-print
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_daemon() -> anyhow::Result<()> {
    init_logging();

    let config = AppConfig::load()?;
    config.ensure_dirs()?;

    info!(
        screenshots = config.capture.screenshots,
        retention_days = config.storage.retention_days,
        "footprint-daemon starting"
    );

    let storage = StorageRoot::from_config(&config)?;
    info!(root = %storage.current().display(), removable = storage.is_removable(), "storage root selected");

    let (tx, rx) = mpsc::channel(1024);
    let (shot_tx, shot_rx) = mpsc::channel(4);

    let capturer: Arc<dyn ScreenCapturer> = Arc::new(CommandCapturer::new(
        config.capture.screenshot_command.clone(),
        config.capture.jpeg_quality,
    ));
    info!(backend = capturer.name(), "screenshot backend configured");

    let now = Utc::now();
    let mut recorder = Recorder::open(
        config.clone(),
        storage,
        Box::new(ChannelScreenshotSink::new(shot_tx)),
        Box::new(DesktopAlert),
        now,
    )?;

    if config.storage.retention_days > 0 {
        let cutoff = now - chrono::Duration::days(i64::from(config.storage.retention_days));
        let report = recorder.purge(PurgeWindow::OlderThan(cutoff), now)?;
        info!(
            rows = report.rows_deleted,
            files = report.files_deleted,
            "retention purge complete"
        );
    }

    let worker = spawn_screenshot_worker(capturer, shot_rx, tx.clone());
    let ingest = ingest::start_ingest(
        recorder,
        tx.clone(),
        rx,
        Duration::from_secs(config.storage.poll_interval_secs.max(1)),
    );
    info!("ingest loop started");

    // Register D-Bus service
    let dbus_conn = zbus::Connection::session().await?;
    let dbus_service = RecorderService {
        tx,
        is_recording: ingest.is_recording.clone(),
        start_time: Instant::now(),
    };
    dbus_conn.object_server().at(OBJECT_PATH, dbus_service).await?;
    dbus_conn.request_name(BUS_NAME).await?;
    info!("D-Bus service registered at {BUS_NAME}");

    // Wait for shutdown signal
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }

    // Graceful shutdown: nothing new comes in over D-Bus while the recorder
    // flushes and closes.
    if let Err(e) = dbus_conn.release_name(BUS_NAME).await {
        warn!(error = %e, "failed to release bus name");
    }
    ingest.shutdown().await;
    if tokio::time::timeout(Duration::from_secs(10), worker).await.is_err() {
        warn!("screenshot worker did not stop in time");
    }

    info!("footprint-daemon stopped");
    Ok(())
}
