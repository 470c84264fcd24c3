use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::NO_URL;

/// Window bounding rectangle in screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// One regular (user-facing) window currently open on the desktop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowObservation {
    pub process_name: String,
    pub title: String,
    #[serde(default)]
    pub browser_url: Option<String>,
    pub geometry: Rect,
}

impl WindowObservation {
    pub fn url(&self) -> Option<&str> {
        normalize_url(self.browser_url.as_deref())
    }
}

/// Screen-state notification: the focused window plus everything open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenChange {
    pub process_name: String,
    pub window_title: String,
    pub geometry: Rect,
    #[serde(default)]
    pub browser_url: Option<String>,
    #[serde(default)]
    pub regular_apps: Vec<String>,
    #[serde(default)]
    pub regular_windows: Vec<WindowObservation>,
}

impl ScreenChange {
    pub fn url(&self) -> Option<&str> {
        normalize_url(self.browser_url.as_deref())
    }
}

/// Treats an empty string or the `NO_URL` sentinel as "no URL".
pub fn normalize_url(url: Option<&str>) -> Option<&str> {
    url.filter(|u| !u.is_empty() && *u != NO_URL)
}

/// Raw key notification from the input hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInput {
    pub keycode: u32,
    #[serde(default)]
    pub modifiers: Vec<String>,
    pub text: String,
    #[serde(default)]
    pub is_repeat: bool,
}

/// A buffered key press. `delay` is seconds since the previous press.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPress {
    pub token: String,
    pub at: DateTime<Utc>,
    pub delay: f64,
    pub is_repeat: bool,
}

/// A buffered mouse position. `delay` is seconds since the previous sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MouseSample {
    pub x: i32,
    pub y: i32,
    pub delay: f64,
}

/// The `(process, window, geometry)` triple currently in focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActiveDisplay {
    pub process_id: i64,
    pub window_id: i64,
    pub geometry_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
    ScrollUp,
    ScrollDown,
    ScrollLeft,
    ScrollRight,
}

impl MouseButton {
    /// Map the X11-style button number (1-7).
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MouseButton::Left),
            2 => Some(MouseButton::Middle),
            3 => Some(MouseButton::Right),
            4 => Some(MouseButton::ScrollUp),
            5 => Some(MouseButton::ScrollDown),
            6 => Some(MouseButton::ScrollLeft),
            7 => Some(MouseButton::ScrollRight),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            MouseButton::Left => 1,
            MouseButton::Middle => 2,
            MouseButton::Right => 3,
            MouseButton::ScrollUp => 4,
            MouseButton::ScrollDown => 5,
            MouseButton::ScrollLeft => 6,
            MouseButton::ScrollRight => 7,
        }
    }

    pub fn is_scroll(&self) -> bool {
        matches!(
            self,
            MouseButton::ScrollUp
                | MouseButton::ScrollDown
                | MouseButton::ScrollLeft
                | MouseButton::ScrollRight
        )
    }
}

/// Build the buffered token for a key press.
///
/// Chords other than plain Shift become `<[Ctrl Alt: x]>`, named keys become
/// `<[Return]>`, and single printable characters pass through as-is.
pub fn format_key_token(modifiers: &[String], text: &str) -> String {
    let chorded = modifiers.len() > 1 || (modifiers.len() == 1 && modifiers[0] != "Shift");
    if chorded {
        format!("<[{}: {}]>", modifiers.join(" "), text)
    } else if text.chars().count() > 1 {
        format!("<[{text}]>")
    } else {
        text.to_string()
    }
}

const NAMED_KEYS: &[&str] = &[
    "Return", "Tab", "ISO_Left_Tab", "BackSpace", "Delete", "Escape", "Insert", "Home", "End",
    "Left", "Right", "Up", "Down", "Page_Up", "Page_Down", "Prior", "Next", "Begin", "Menu",
    "Print", "Pause", "Break", "Sys_Req", "Scroll_Lock", "Num_Lock", "Caps_Lock", "Shift_L",
    "Shift_R", "Control_L", "Control_R", "Alt_L", "Alt_R", "Super_L", "Super_R", "Meta_L",
    "Meta_R", "Hyper_L", "Hyper_R", "ISO_Level3_Shift", "Mode_switch", "Multi_key", "KP_Enter",
    "KP_Home", "KP_End", "KP_Left", "KP_Right", "KP_Up", "KP_Down", "KP_Page_Up",
    "KP_Page_Down", "KP_Insert", "KP_Delete", "KP_Begin",
];

const MODIFIERS: &[&str] = &[
    "Shift", "Control", "Ctrl", "Alt", "AltGr", "Super", "Meta", "Hyper", "Mod1", "Mod2",
    "Mod3", "Mod4", "Mod5", "ISO_Level3_Shift",
];

/// Whether `name` is a keysym for a non-printing key. Anything else that
/// arrives as a multi-character token is typed text.
pub fn is_named_key(name: &str) -> bool {
    if NAMED_KEYS.contains(&name) || name.starts_with("XF86") {
        return true;
    }
    // Function keys F1..F35.
    name.strip_prefix('F')
        .and_then(|n| n.parse::<u8>().ok())
        .is_some_and(|n| (1..=35).contains(&n))
}

pub fn is_modifier_name(name: &str) -> bool {
    MODIFIERS.contains(&name)
}

/// Seconds between two instants as a float, never negative.
pub fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let micros = (later - earlier).num_microseconds().unwrap_or(i64::MAX);
    (micros.max(0) as f64) / 1_000_000.0
}
