use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use footprint_core::capture::CaptureError;
use footprint_core::event::{KeyInput, ScreenChange};
use footprint_core::schema::{NewBookmark, PurgeReport, PurgeWindow, RecorderStatus};
use footprint_core::{CoreError, Preferences, Recorder};
use tokio::sync::{mpsc, oneshot};
use tokio::task::block_in_place;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Reply channel for requests that can fail; errors travel as text to the
/// D-Bus caller.
pub type Reply<T> = oneshot::Sender<Result<T, String>>;

/// Everything the ingest task can be asked to do.
pub enum IngestMessage {
    ScreenChange {
        change: ScreenChange,
        at: DateTime<Utc>,
    },
    Key {
        input: KeyInput,
        at: DateTime<Utc>,
    },
    Click {
        button: u8,
        x: i32,
        y: i32,
        at: DateTime<Utc>,
    },
    Move {
        x: i32,
        y: i32,
        at: DateTime<Utc>,
    },
    SetRecording {
        enabled: bool,
        reply: Reply<()>,
    },
    UpdatePreferences(Preferences),
    Bookmark {
        bookmark: NewBookmark,
        reply: Reply<Option<i64>>,
    },
    Purge {
        window: PurgeWindow,
        reply: Reply<PurgeReport>,
    },
    Export {
        window_ids: Vec<i64>,
        reply: Reply<PathBuf>,
    },
    Status {
        reply: oneshot::Sender<(RecorderStatus, Preferences)>,
    },
    ScreenshotFailed(CaptureError),
    Stop {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the running ingest task, used for shutdown.
pub struct IngestHandle {
    pub tx: mpsc::Sender<IngestMessage>,
    pub is_recording: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl IngestHandle {
    /// Flush, close everything tracked and wait for the recorder to finish.
    /// Waits up to 30 seconds.
    pub async fn shutdown(self) {
        info!("shutting down ingest");
        let (done, ack) = oneshot::channel();
        if self.tx.send(IngestMessage::Stop { done }).await.is_err() {
            warn!("ingest task already gone");
        }

        let timeout = Duration::from_secs(30);
        if tokio::time::timeout(timeout, async {
            let _ = ack.await;
            let _ = self.task.await;
        })
        .await
        .is_err()
        {
            warn!("ingest shutdown timed out");
        }
        info!("ingest shutdown complete");
    }
}

/// Move `recorder` onto its own task. Every callback, timer and control
/// request is handled there one at a time.
pub fn start_ingest(
    recorder: Recorder,
    tx: mpsc::Sender<IngestMessage>,
    rx: mpsc::Receiver<IngestMessage>,
    poll_every: Duration,
) -> IngestHandle {
    let is_recording = recorder.recording_flag();
    let task = tokio::spawn(run_ingest_loop(recorder, rx, poll_every));
    IngestHandle {
        tx,
        is_recording,
        task,
    }
}

async fn run_ingest_loop(
    mut recorder: Recorder,
    mut rx: mpsc::Receiver<IngestMessage>,
    poll_every: Duration,
) {
    let mut poll = tokio::time::interval(poll_every);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the root was just resolved.
    poll.tick().await;

    let idle = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!("ingest channel closed");
                    stop(&mut recorder);
                    break;
                };
                if !handle_message(&mut recorder, msg) {
                    break;
                }
            }
            () = &mut idle => {
                let next = block_in_place(|| recorder.on_idle_tick(Utc::now()));
                idle.as_mut().reset(Instant::now() + next);
            }
            _ = poll.tick() => {
                if let Err(e) = block_in_place(|| recorder.on_storage_poll(Utc::now())) {
                    warn!(error = %e, "storage poll failed");
                }
            }
        }
    }
}

/// Returns `false` once the loop should end.
fn handle_message(recorder: &mut Recorder, msg: IngestMessage) -> bool {
    match msg {
        IngestMessage::ScreenChange { change, at } => {
            if let Err(e) = block_in_place(|| recorder.on_screen_change(&change, at)) {
                record_failure(recorder, &e, "screen change");
            }
        }
        IngestMessage::Key { input, at } => {
            recorder.on_key(&input, at);
        }
        IngestMessage::Click { button, x, y, at } => {
            if let Err(e) = block_in_place(|| recorder.on_mouse_click(button, x, y, at)) {
                record_failure(recorder, &e, "click");
            }
        }
        IngestMessage::Move { x, y, at } => recorder.on_mouse_move(x, y, at),
        IngestMessage::SetRecording { enabled, reply } => {
            let result = block_in_place(|| recorder.set_recording(enabled, Utc::now()));
            let _ = reply.send(result.map_err(|e| e.to_string()));
        }
        IngestMessage::UpdatePreferences(prefs) => recorder.update_preferences(prefs),
        IngestMessage::Bookmark { bookmark, reply } => {
            let result = block_in_place(|| recorder.record_bookmark(&bookmark, Utc::now()));
            let _ = reply.send(result.map_err(|e| e.to_string()));
        }
        IngestMessage::Purge { window, reply } => {
            let result = block_in_place(|| recorder.purge(window, Utc::now()));
            let _ = reply.send(result.map_err(|e| e.to_string()));
        }
        IngestMessage::Export { window_ids, reply } => {
            let result = block_in_place(|| recorder.export_reports(&window_ids, Utc::now()));
            let _ = reply.send(result.map_err(|e| e.to_string()));
        }
        IngestMessage::Status { reply } => {
            let _ = reply.send((recorder.status(), recorder.preferences()));
        }
        IngestMessage::ScreenshotFailed(err) => {
            block_in_place(|| recorder.on_screenshot_failed(&err));
        }
        IngestMessage::Stop { done } => {
            stop(recorder);
            let _ = done.send(());
            return false;
        }
    }
    true
}

/// A row missing right after its insert means the store cannot be trusted;
/// capture stops until the user resumes it. Anything else costs one event.
fn record_failure(recorder: &mut Recorder, err: &CoreError, context: &str) {
    if matches!(err, CoreError::IdentityMissing { .. }) {
        error!(error = %err, context, "identity lookup failed after insert, disabling capture");
        block_in_place(|| recorder.disable_capture(&err.to_string()));
    } else {
        error!(error = %err, context, "event not recorded");
    }
}

fn stop(recorder: &mut Recorder) {
    if let Err(e) = block_in_place(|| recorder.stop(Utc::now())) {
        error!(error = %e, "graceful stop failed");
    }
}
