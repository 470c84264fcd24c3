use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{ActiveDisplay, MouseSample};

/// Stored in `windows.browser_url` for windows without a URL.
pub const NO_URL: &str = "NO_URL";

/// Lifecycle target used when a process could never be resolved.
pub const UNKNOWN_PROCESS_ID: i64 = 0;

// -- Identity rows --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub id: i64,
    pub title: String,
    pub process_id: i64,
    pub browser_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub id: i64,
    pub xpos: i32,
    pub ypos: i32,
    pub width: i32,
    pub height: i32,
    pub created_at: DateTime<Utc>,
}

// -- Lifecycle --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleKind {
    Open,
    Active,
    Close,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleKind::Open => "Open",
            LifecycleKind::Active => "Active",
            LifecycleKind::Close => "Close",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Open" => Some(LifecycleKind::Open),
            "Active" => Some(LifecycleKind::Active),
            "Close" => Some(LifecycleKind::Close),
            _ => None,
        }
    }
}

/// Which lifecycle table an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleTarget {
    Process(i64),
    Window(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: i64,
    pub target_id: i64,
    pub kind: LifecycleKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingState {
    On,
    Off,
}

impl RecordingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingState::On => "On",
            RecordingState::Off => "Off",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "On" => RecordingState::On,
            _ => RecordingState::Off,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingEvent {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub state: RecordingState,
}

// -- Input records --

/// Insert DTO for a completed dwell on one window.
#[derive(Debug, Clone)]
pub struct NewKeys {
    pub key_tokens: Vec<String>,
    pub timings: Vec<f64>,
    pub nonrepeat_count: i64,
    pub started_at: DateTime<Utc>,
    pub display: Option<ActiveDisplay>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keys {
    pub id: i64,
    /// Always empty; typed text is never stored.
    pub text: String,
    pub key_tokens: Vec<String>,
    pub timings: Vec<f64>,
    pub nonrepeat_count: i64,
    pub started_at: DateTime<Utc>,
    pub process_id: Option<i64>,
    pub window_id: Option<i64>,
    pub geometry_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Insert DTO for a click and the mouse path leading up to it.
#[derive(Debug, Clone)]
pub struct NewClick {
    pub button: u8,
    pub is_press: bool,
    pub x: i32,
    pub y: i32,
    pub path: Vec<MouseSample>,
    pub display: Option<ActiveDisplay>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Click {
    pub id: i64,
    pub button: u8,
    pub is_press: bool,
    pub x: i32,
    pub y: i32,
    pub path_length: i64,
    pub path_xy: Vec<[i32; 2]>,
    pub path_timings: Vec<f64>,
    pub process_id: Option<i64>,
    pub window_id: Option<i64>,
    pub geometry_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

// -- Bookmarks --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBookmark {
    pub time: DateTime<Utc>,
    pub text: String,
    #[serde(default)]
    pub audio_file: Option<String>,
    /// How far back the note refers to, as picked by the user ("now", "5 min ago").
    #[serde(default)]
    pub delay: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub text: String,
    pub audio_file: Option<String>,
    pub delay: Option<String>,
    pub created_at: DateTime<Utc>,
}

// -- Reports --

/// One Active→(Active|Close) span of focus on a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationInterval {
    pub window_id: i64,
    pub process_id: i64,
    pub window_title: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredWindowActivation {
    pub id: i64,
    pub window_id: i64,
    pub process_id: i64,
    pub window_title: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

// -- Retention --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurgeWindow {
    /// Retention purge: drop everything recorded before the cutoff.
    OlderThan(DateTime<Utc>),
    /// "Forget the last N minutes": drop everything recorded after the cutoff.
    Since(DateTime<Utc>),
    All,
}

impl PurgeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        match self {
            PurgeWindow::OlderThan(cutoff) => at < *cutoff,
            PurgeWindow::Since(cutoff) => at > *cutoff,
            PurgeWindow::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub rows_deleted: u64,
    pub files_deleted: u64,
}

// -- Status --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderStatus {
    pub is_recording: bool,
    pub writer_disabled: bool,
    pub storage_root: PathBuf,
    pub removable_storage: bool,
    pub active_display: Option<ActiveDisplay>,
    pub pending_keys: usize,
    pub pending_mouse_samples: usize,
    pub tracked_apps: usize,
    pub tracked_windows: usize,
    pub last_screenshot: Option<DateTime<Utc>>,
}

/// Fixed-width UTC text form used for every stored timestamp, so that
/// lexicographic order matches time order.
pub fn to_db_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn from_db_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
