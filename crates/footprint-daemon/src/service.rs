use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use footprint_core::event::{KeyInput, ScreenChange};
use footprint_core::schema::{NewBookmark, PurgeWindow};
use footprint_core::Preferences;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use zbus::interface;

use crate::ingest::IngestMessage;

pub const BUS_NAME: &str = "org.footprint.Recorder";
pub const OBJECT_PATH: &str = "/org/footprint/Recorder";

/// D-Bus service object for `org.footprint.Recorder`.
///
/// Input callbacks are fire-and-forget; control methods wait for the ingest
/// task to answer.
pub struct RecorderService {
    pub tx: mpsc::Sender<IngestMessage>,
    pub is_recording: Arc<AtomicBool>,
    pub start_time: Instant,
}

#[derive(Serialize)]
struct StatusReply {
    #[serde(flatten)]
    status: footprint_core::schema::RecorderStatus,
    screenshots: bool,
    screenshot_min_interval_ms: u64,
    screenshot_max_interval_secs: u64,
    uptime_seconds: u64,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

impl RecorderService {
    async fn send(&self, msg: IngestMessage) -> zbus::fdo::Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| failed("recorder is shutting down"))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> IngestMessage,
    ) -> zbus::fdo::Result<T> {
        let (reply, answer) = oneshot::channel();
        self.send(make(reply)).await?;
        answer.await.map_err(|_| failed("recorder dropped the request"))
    }

    async fn current_preferences(&self) -> zbus::fdo::Result<Preferences> {
        let (_, prefs) = self.request(|reply| IngestMessage::Status { reply }).await?;
        Ok(prefs)
    }
}

#[interface(name = "org.footprint.Recorder")]
impl RecorderService {
    /// Focused window plus every open app and window, as JSON.
    async fn report_screen_change(&self, change_json: &str) -> zbus::fdo::Result<()> {
        let change: ScreenChange = serde_json::from_str(change_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid screen change: {e}")))?;
        self.send(IngestMessage::ScreenChange {
            change,
            at: Utc::now(),
        })
        .await
    }

    async fn report_key(
        &self,
        keycode: u32,
        modifiers: Vec<String>,
        text: &str,
        is_repeat: bool,
    ) -> zbus::fdo::Result<()> {
        let input = KeyInput {
            keycode,
            modifiers,
            text: text.to_string(),
            is_repeat,
        };
        self.send(IngestMessage::Key {
            input,
            at: Utc::now(),
        })
        .await
    }

    async fn report_mouse_click(&self, button: u8, x: i32, y: i32) -> zbus::fdo::Result<()> {
        self.send(IngestMessage::Click {
            button,
            x,
            y,
            at: Utc::now(),
        })
        .await
    }

    async fn report_mouse_move(&self, x: i32, y: i32) -> zbus::fdo::Result<()> {
        // Moves are sampled at 10 Hz anyway; never queue behind a busy loop.
        let msg = IngestMessage::Move {
            x,
            y,
            at: Utc::now(),
        };
        if self.tx.try_send(msg).is_err() {
            debug!("ingest busy, dropping mouse move");
        }
        Ok(())
    }

    async fn pause(&self) -> zbus::fdo::Result<()> {
        if !self.is_recording.load(Ordering::SeqCst) {
            return Err(failed("not recording"));
        }
        info!("pause requested via D-Bus");
        self.request(|reply| IngestMessage::SetRecording {
            enabled: false,
            reply,
        })
        .await?
        .map_err(failed)
    }

    async fn resume(&self) -> zbus::fdo::Result<()> {
        if self.is_recording.load(Ordering::SeqCst) {
            return Err(failed("already recording"));
        }
        info!("resume requested via D-Bus");
        self.request(|reply| IngestMessage::SetRecording {
            enabled: true,
            reply,
        })
        .await?
        .map_err(failed)
    }

    async fn get_status(&self) -> zbus::fdo::Result<String> {
        let (status, prefs) = self.request(|reply| IngestMessage::Status { reply }).await?;
        let reply = StatusReply {
            status,
            screenshots: prefs.screenshots,
            screenshot_min_interval_ms: prefs.screenshot_min_interval.as_millis() as u64,
            screenshot_max_interval_secs: prefs.screenshot_max_interval.as_secs(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        };
        serde_json::to_string(&reply).map_err(|e| failed(format!("serialize error: {e}")))
    }

    async fn set_screenshot_intervals(&self, min_ms: u64, max_secs: u64) -> zbus::fdo::Result<()> {
        if max_secs == 0 || min_ms > max_secs.saturating_mul(1000) {
            return Err(zbus::fdo::Error::InvalidArgs(
                "minimum interval must not exceed the maximum".into(),
            ));
        }
        let prefs = Preferences {
            screenshot_min_interval: Duration::from_millis(min_ms),
            screenshot_max_interval: Duration::from_secs(max_secs),
            ..self.current_preferences().await?
        };
        info!(min_ms, max_secs, "screenshot intervals updated via D-Bus");
        self.send(IngestMessage::UpdatePreferences(prefs)).await
    }

    async fn set_screenshots_enabled(&self, enabled: bool) -> zbus::fdo::Result<()> {
        let prefs = Preferences {
            screenshots: enabled,
            ..self.current_preferences().await?
        };
        self.send(IngestMessage::UpdatePreferences(prefs)).await
    }

    /// `scope` is `recent` (the last `minutes`), `older` (before `minutes`
    /// ago) or `all`.
    async fn purge(&self, scope: &str, minutes: u64) -> zbus::fdo::Result<String> {
        // Keep the cutoff representable.
        let minutes = minutes.min(100 * 365 * 24 * 60) as i64;
        let cutoff = Utc::now() - chrono::Duration::minutes(minutes);
        let window = match scope {
            "recent" => PurgeWindow::Since(cutoff),
            "older" => PurgeWindow::OlderThan(cutoff),
            "all" => PurgeWindow::All,
            other => {
                return Err(zbus::fdo::Error::InvalidArgs(format!("unknown purge scope '{other}'")))
            }
        };
        info!(?window, "purge requested via D-Bus");
        let report = self
            .request(|reply| IngestMessage::Purge { window, reply })
            .await?
            .map_err(failed)?;
        serde_json::to_string(&report).map_err(|e| failed(format!("serialize error: {e}")))
    }

    async fn bookmark(&self, bookmark_json: &str) -> zbus::fdo::Result<i64> {
        let bookmark: NewBookmark = serde_json::from_str(bookmark_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid bookmark: {e}")))?;
        self.request(|reply| IngestMessage::Bookmark { bookmark, reply })
            .await?
            .map_err(failed)?
            .ok_or_else(|| failed("bookmark was not stored"))
    }

    /// Write the CSV reports; returns the output directory.
    async fn export(&self, window_ids: Vec<i64>) -> zbus::fdo::Result<String> {
        let dir = self
            .request(|reply| IngestMessage::Export { window_ids, reply })
            .await?
            .map_err(failed)?;
        Ok(dir.display().to_string())
    }

    #[zbus(property)]
    fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::SeqCst)
    }

    #[zbus(property)]
    async fn storage_root(&self) -> zbus::fdo::Result<String> {
        let (status, _) = self.request(|reply| IngestMessage::Status { reply }).await?;
        Ok(status.storage_root.display().to_string())
    }
}
