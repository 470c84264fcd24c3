//! The ingestion core: turns collaborator callbacks into stored activity.
//!
//! A `Recorder` owns the session buffer, the store and its writer, so every
//! callback and timer body runs on whichever single context owns it. Each
//! handler takes the event time explicitly.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::buffer::SessionBuffer;
use crate::capture::{screenshot_filename, CaptureError, ScreenshotSink};
use crate::compress::encode_batch;
use crate::config::{AppConfig, CaptureConfig};
use crate::db::Database;
use crate::error::Result;
use crate::event::{seconds_between, ActiveDisplay, KeyInput, MouseButton, ScreenChange};
use crate::report;
use crate::repository::ActivityRepository;
use crate::resolver::IdentityResolver;
use crate::schema::{
    LifecycleKind, LifecycleTarget, NewBookmark, NewClick, NewKeys, PurgeReport, PurgeWindow,
    RecorderStatus, RecordingState, UNKNOWN_PROCESS_ID,
};
use crate::storage::{RootChange, StorageRoot};
use crate::writer::{AlertSink, DurableWriter, RetryPolicy};

/// Screenshot preferences pushed in from the user-facing shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preferences {
    pub screenshots: bool,
    pub screenshot_min_interval: Duration,
    pub screenshot_max_interval: Duration,
}

impl Preferences {
    pub fn from_config(capture: &CaptureConfig) -> Self {
        Self {
            screenshots: capture.screenshots,
            screenshot_min_interval: Duration::from_millis(capture.screenshot_min_interval_ms),
            screenshot_max_interval: Duration::from_secs(capture.screenshot_max_interval_secs.max(1)),
        }
    }
}

/// What a screen-change notification did to the active display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Recording is off, the window is on the ignore list, or its
    /// identity could not be stored.
    Ignored,
    /// Same process and window as before.
    Unchanged,
    Switched {
        previous: Option<ActiveDisplay>,
        current: ActiveDisplay,
    },
}

pub struct Recorder {
    config: AppConfig,
    prefs: Preferences,
    db: Database,
    writer: DurableWriter,
    storage: StorageRoot,
    buffer: SessionBuffer,
    screenshots: Box<dyn ScreenshotSink>,
    recording: Arc<AtomicBool>,
    active_process: Option<i64>,
    active_window: Option<i64>,
    tracked_apps: BTreeMap<String, Option<i64>>,
    tracked_windows: BTreeSet<i64>,
    last_screenshot: Option<DateTime<Utc>>,
}

impl Recorder {
    /// Open the store under the current storage root and start recording if
    /// the config says so.
    pub fn open(
        config: AppConfig,
        storage: StorageRoot,
        screenshots: Box<dyn ScreenshotSink>,
        alerts: Box<dyn AlertSink>,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        storage.ensure_dirs()?;
        let db_path = storage.database_path(&config.storage.db_name);
        let db = Database::open(&db_path)?;
        info!(path = %db_path.display(), "database opened");

        let recording = Arc::new(AtomicBool::new(false));
        let writer = DurableWriter::new(
            RetryPolicy::from_config(&config.writer),
            recording.clone(),
            alerts,
        );

        let mut recorder = Self {
            prefs: Preferences::from_config(&config.capture),
            buffer: SessionBuffer::from_config(&config, at),
            config,
            db,
            writer,
            storage,
            screenshots,
            recording,
            active_process: None,
            active_window: None,
            tracked_apps: BTreeMap::new(),
            tracked_windows: BTreeSet::new(),
            last_screenshot: None,
        };
        if recorder.config.capture.enabled {
            recorder.set_recording(true, at)?;
        }
        Ok(recorder)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Shared view of the recording switch, for readers on other tasks.
    pub fn recording_flag(&self) -> Arc<AtomicBool> {
        self.recording.clone()
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn storage(&self) -> &StorageRoot {
        &self.storage
    }

    pub fn preferences(&self) -> Preferences {
        self.prefs
    }

    pub fn status(&self) -> RecorderStatus {
        RecorderStatus {
            is_recording: self.is_recording(),
            writer_disabled: self.writer.is_disabled(),
            storage_root: self.storage.current().to_path_buf(),
            removable_storage: self.storage.is_removable(),
            active_display: self.buffer.display(),
            pending_keys: self.buffer.pending_keys(),
            pending_mouse_samples: self.buffer.pending_mouse_samples(),
            tracked_apps: self.tracked_apps.len(),
            tracked_windows: self.tracked_windows.len(),
            last_screenshot: self.last_screenshot,
        }
    }

    // -- Collaborator callbacks --

    pub fn on_screen_change(&mut self, change: &ScreenChange, at: DateTime<Utc>) -> Result<Transition> {
        if !self.is_recording() {
            return Ok(Transition::Ignored);
        }
        if self
            .config
            .privacy
            .ignored_windows
            .iter()
            .any(|w| *w == change.window_title)
        {
            debug!(title = %change.window_title, "ignoring overlay window");
            return Ok(Transition::Ignored);
        }

        let mut resolver = IdentityResolver::new(&mut self.db, &mut self.writer);
        let Some(process_id) = resolver.find_or_create_process(&change.process_name, at)? else {
            return Ok(Transition::Ignored);
        };
        if self.active_process != Some(process_id) {
            self.commit_lifecycle(&[LifecycleTarget::Process(process_id)], LifecycleKind::Active, at)?;
            self.active_process = Some(process_id);
        }

        let mut resolver = IdentityResolver::new(&mut self.db, &mut self.writer);
        let Some(window_id) =
            resolver.find_or_create_window(&change.window_title, process_id, change.url(), at)?
        else {
            return Ok(Transition::Ignored);
        };
        if self.active_window != Some(window_id) {
            self.commit_lifecycle(&[LifecycleTarget::Window(window_id)], LifecycleKind::Active, at)?;
            self.active_window = Some(window_id);
        }

        let mut resolver = IdentityResolver::new(&mut self.db, &mut self.writer);
        let Some(geometry_id) = resolver.find_or_create_geometry(&change.geometry, at)? else {
            return Ok(Transition::Ignored);
        };

        let previous = self.buffer.display();
        let current = ActiveDisplay {
            process_id,
            window_id,
            geometry_id,
        };
        let switched = previous.map(|d| (d.process_id, d.window_id)) != Some((process_id, window_id));
        let transition = if switched {
            // Buffered input belongs to the window it was typed in.
            self.flush_keys(at)?;
            self.buffer.set_display(Some(current));
            self.maybe_screenshot(at);
            debug!(process_id, window_id, "active window changed");
            Transition::Switched { previous, current }
        } else {
            if previous.map(|d| d.geometry_id) != Some(geometry_id) {
                self.buffer.set_geometry(geometry_id);
            }
            Transition::Unchanged
        };

        self.diff_lifecycle(change, at)?;
        Ok(transition)
    }

    /// Returns whether the key entered the buffer.
    pub fn on_key(&mut self, input: &KeyInput, at: DateTime<Utc>) -> bool {
        if !self.is_recording() {
            return false;
        }
        let recorded = self
            .buffer
            .record_key(&input.text, &input.modifiers, input.is_repeat, at);
        if recorded {
            self.maybe_screenshot(at);
        }
        recorded
    }

    pub fn on_mouse_click(&mut self, button: u8, x: i32, y: i32, at: DateTime<Utc>) -> Result<()> {
        if !self.is_recording() {
            return Ok(());
        }
        let Some(parsed) = MouseButton::from_code(button) else {
            warn!(button, "unknown mouse button");
            return Ok(());
        };
        let Some(click) = self.buffer.record_click(parsed, x, y, at) else {
            return Ok(());
        };
        self.maybe_screenshot(at);

        let new = NewClick {
            button: click.button.code(),
            is_press: true,
            x: click.x,
            y: click.y,
            path: click.path,
            display: self.buffer.display(),
            created_at: at,
        };
        self.writer
            .commit(&mut self.db, |tx| ActivityRepository::new(tx).insert_click(&new))?;
        Ok(())
    }

    pub fn on_mouse_move(&mut self, x: i32, y: i32, at: DateTime<Utc>) {
        if self.is_recording() {
            self.buffer.record_mouse_move(x, y, at);
        }
    }

    // -- Timers --

    /// Request a screenshot unless one was requested too recently.
    pub fn maybe_screenshot(&mut self, at: DateTime<Utc>) -> bool {
        if !self.prefs.screenshots || !self.is_recording() {
            return false;
        }
        if let Some(last) = self.last_screenshot {
            if seconds_between(last, at) < self.prefs.screenshot_min_interval.as_secs_f64() {
                return false;
            }
        }
        let cursor = if self.config.capture.cursor_in_filename {
            self.buffer.last_cursor()
        } else {
            None
        };
        let path = self
            .storage
            .screenshots_dir()
            .join(screenshot_filename(at, cursor));
        self.screenshots.request(path);
        self.last_screenshot = Some(at);
        true
    }

    /// Idle-screenshot timer body. Returns how long to sleep before the next tick.
    pub fn on_idle_tick(&mut self, at: DateTime<Utc>) -> Duration {
        let max = self.prefs.screenshot_max_interval;
        let slack = Duration::from_millis(10);
        if let Some(last) = self.last_screenshot {
            let elapsed = seconds_between(last, at);
            if elapsed < max.as_secs_f64() {
                return Duration::from_secs_f64(max.as_secs_f64() - elapsed) + slack;
            }
        }
        self.maybe_screenshot(at);
        max + slack
    }

    /// Storage-poll timer body. On a root change the pending keys go to the
    /// old store and everything after that to the new one.
    pub fn on_storage_poll(&mut self, at: DateTime<Utc>) -> Result<Option<RootChange>> {
        let Some(change) = self.storage.poll() else {
            return Ok(None);
        };
        self.flush_keys(at)?;

        let db_path = self.storage.database_path(&self.config.storage.db_name);
        let reopened = self
            .storage
            .ensure_dirs()
            .and_then(|_| Database::open(&db_path));
        match reopened {
            Ok(db) => {
                self.db = db;
                self.reset_identity(at);
                if self.is_recording() {
                    self.commit_recording_state(RecordingState::On, at)?;
                }
                info!(path = %db_path.display(), "database reopened");
            }
            Err(e) => {
                error!(path = %db_path.display(), error = %e, "could not open store, keeping the previous one");
            }
        }
        Ok(Some(change))
    }

    /// Feedback from the screenshot worker.
    pub fn on_screenshot_failed(&mut self, err: &CaptureError) {
        if err.is_no_space() {
            self.writer
                .disable(&mut self.db, &format!("screenshot failed: {err}"));
        } else {
            warn!(error = %err, "screenshot skipped");
        }
    }

    /// Stop capture through the writer's failure policy: recording off, one
    /// alert, best-effort Off marker. Resuming re-arms it.
    pub fn disable_capture(&mut self, reason: &str) {
        self.writer.disable(&mut self.db, reason);
    }

    // -- Operational surface --

    pub fn set_recording(&mut self, enabled: bool, at: DateTime<Utc>) -> Result<()> {
        if enabled == self.is_recording() {
            return Ok(());
        }
        if enabled {
            self.writer.rearm();
            self.recording.store(true, Ordering::SeqCst);
            self.commit_recording_state(RecordingState::On, at)?;
            info!("recording on");
        } else {
            self.flush_keys(at)?;
            self.commit_recording_state(RecordingState::Off, at)?;
            self.recording.store(false, Ordering::SeqCst);
            // The next notification after resuming re-records focus.
            self.buffer.set_display(None);
            self.active_process = None;
            self.active_window = None;
            info!("recording off");
        }
        Ok(())
    }

    pub fn update_preferences(&mut self, prefs: Preferences) {
        debug!(?prefs, "preferences updated");
        self.prefs = prefs;
    }

    pub fn record_bookmark(&mut self, bookmark: &NewBookmark, at: DateTime<Utc>) -> Result<Option<i64>> {
        self.writer.commit(&mut self.db, |tx| {
            ActivityRepository::new(tx).insert_bookmark(bookmark, at)
        })
    }

    /// Remove stored history and media inside `window`.
    pub fn purge(&mut self, window: PurgeWindow, at: DateTime<Utc>) -> Result<PurgeReport> {
        self.flush_keys(at)?;
        let rows_deleted = self
            .writer
            .commit(&mut self.db, |tx| ActivityRepository::new(tx).purge(window))?
            .unwrap_or(0);
        let files_deleted = self.storage.purge_media(window)?;
        // Identity rows may be gone; resolve everything afresh.
        self.reset_identity(at);
        info!(rows_deleted, files_deleted, ?window, "purged history");
        Ok(PurgeReport {
            rows_deleted,
            files_deleted,
        })
    }

    /// Write the CSV reports under the current root. An empty selection
    /// reports on every window.
    pub fn export_reports(&mut self, window_ids: &[i64], at: DateTime<Utc>) -> Result<PathBuf> {
        report::export_reports(&mut self.db, &self.storage, window_ids, at)
    }

    /// Graceful-shutdown barrier: pending keys first, then final Close
    /// events and the recording-off marker in one commit.
    pub fn stop(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.flush_keys(at)?;

        let targets: Vec<LifecycleTarget> = self
            .tracked_apps
            .values()
            .map(|id| LifecycleTarget::Process(id.unwrap_or(UNKNOWN_PROCESS_ID)))
            .chain(self.tracked_windows.iter().map(|id| LifecycleTarget::Window(*id)))
            .collect();
        let was_recording = self.is_recording();
        self.writer.commit(&mut self.db, |tx| {
            let repo = ActivityRepository::new(tx);
            for target in &targets {
                repo.insert_lifecycle(*target, LifecycleKind::Close, at)?;
            }
            if was_recording {
                repo.insert_recording_event(RecordingState::Off, at)?;
            }
            Ok(())
        })?;

        self.recording.store(false, Ordering::SeqCst);
        self.tracked_apps.clear();
        self.tracked_windows.clear();
        self.buffer.set_display(None);
        info!(closed = targets.len(), "recorder stopped");
        Ok(())
    }

    // -- Internals --

    /// Persist the pending key batch against the display it was typed in.
    fn flush_keys(&mut self, at: DateTime<Utc>) -> Result<()> {
        let Some(batch) = self.buffer.take_key_batch(at) else {
            return Ok(());
        };
        let encoded = encode_batch(&batch.presses);
        let keys = NewKeys {
            key_tokens: encoded.key_tokens,
            timings: encoded.timings,
            nonrepeat_count: encoded.nonrepeat_count,
            started_at: batch.started_at,
            display: batch.display,
            created_at: at,
        };
        let stored = self
            .writer
            .commit(&mut self.db, |tx| ActivityRepository::new(tx).insert_keys(&keys))?;
        if stored.is_some() {
            debug!(tokens = keys.key_tokens.len(), "key batch flushed");
        }
        Ok(())
    }

    /// Compare the open apps and windows with what was tracked before and
    /// record Open/Close for the difference.
    fn diff_lifecycle(&mut self, change: &ScreenChange, at: DateTime<Utc>) -> Result<()> {
        let mut resolver = IdentityResolver::new(&mut self.db, &mut self.writer);

        let mut next_apps: BTreeMap<String, Option<i64>> = BTreeMap::new();
        let mut events: Vec<(LifecycleTarget, LifecycleKind)> = Vec::new();
        for name in &change.regular_apps {
            if next_apps.contains_key(name) {
                continue;
            }
            let id = match self.tracked_apps.get(name) {
                Some(known) => *known,
                None => {
                    let id = resolver.find_or_create_process(name, at)?;
                    if let Some(id) = id {
                        events.push((LifecycleTarget::Process(id), LifecycleKind::Open));
                    }
                    id
                }
            };
            next_apps.insert(name.clone(), id);
        }
        for (name, id) in &self.tracked_apps {
            if !next_apps.contains_key(name) {
                let id = id.unwrap_or(UNKNOWN_PROCESS_ID);
                events.push((LifecycleTarget::Process(id), LifecycleKind::Close));
            }
        }

        let mut next_windows = BTreeSet::new();
        for window in &change.regular_windows {
            let process_id = resolver
                .find_or_create_process(&window.process_name, at)?
                .unwrap_or(UNKNOWN_PROCESS_ID);
            let Some(window_id) =
                resolver.find_or_create_window(&window.title, process_id, window.url(), at)?
            else {
                continue;
            };
            resolver.find_or_create_geometry(&window.geometry, at)?;
            next_windows.insert(window_id);
        }
        for id in next_windows.difference(&self.tracked_windows) {
            events.push((LifecycleTarget::Window(*id), LifecycleKind::Open));
        }
        for id in self.tracked_windows.difference(&next_windows) {
            events.push((LifecycleTarget::Window(*id), LifecycleKind::Close));
        }

        if !events.is_empty() {
            let written = self.writer.commit(&mut self.db, |tx| {
                let repo = ActivityRepository::new(tx);
                for (target, kind) in &events {
                    repo.insert_lifecycle(*target, *kind, at)?;
                }
                Ok(())
            })?;
            if written.is_none() {
                // Keep the old sets so the next notification retries the diff.
                return Ok(());
            }
        }
        self.tracked_apps = next_apps;
        self.tracked_windows = next_windows;
        Ok(())
    }

    fn commit_lifecycle(
        &mut self,
        targets: &[LifecycleTarget],
        kind: LifecycleKind,
        at: DateTime<Utc>,
    ) -> Result<Option<()>> {
        self.writer.commit(&mut self.db, |tx| {
            let repo = ActivityRepository::new(tx);
            for target in targets {
                repo.insert_lifecycle(*target, kind, at)?;
            }
            Ok(())
        })
    }

    fn commit_recording_state(&mut self, state: RecordingState, at: DateTime<Utc>) -> Result<()> {
        self.writer.commit(&mut self.db, |tx| {
            ActivityRepository::new(tx).insert_recording_event(state, at)
        })?;
        Ok(())
    }

    fn reset_identity(&mut self, at: DateTime<Utc>) {
        self.active_process = None;
        self.active_window = None;
        self.tracked_apps.clear();
        self.tracked_windows.clear();
        self.buffer.reset(at);
    }
}
