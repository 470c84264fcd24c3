use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::AppConfig;
use crate::event::{format_key_token, seconds_between, ActiveDisplay, KeyPress, MouseButton, MouseSample};

/// Keys drained at a flush, ready to be encoded.
#[derive(Debug, Clone)]
pub struct KeyBatch {
    pub presses: Vec<KeyPress>,
    pub started_at: DateTime<Utc>,
    pub display: Option<ActiveDisplay>,
}

/// A click that survived scroll cooloff, with the path that led to it.
#[derive(Debug, Clone)]
pub struct RecordedClick {
    pub button: MouseButton,
    pub x: i32,
    pub y: i32,
    pub path: Vec<MouseSample>,
}

pub struct SessionBuffer {
    display: Option<ActiveDisplay>,
    key_presses: Vec<KeyPress>,
    mouse_path: Vec<MouseSample>,
    last_scroll: HashMap<MouseButton, DateTime<Utc>>,
    last_key_time: DateTime<Utc>,
    last_move_time: DateTime<Utc>,
    last_cursor: Option<(i32, i32)>,
    skip_keys: HashSet<String>,
    mouse_interval: Duration,
    scroll_cooloff: Duration,
}

impl SessionBuffer {
    pub fn new(
        skip_keys: impl IntoIterator<Item = String>,
        mouse_interval: Duration,
        scroll_cooloff: Duration,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            display: None,
            key_presses: Vec::new(),
            mouse_path: Vec::new(),
            last_scroll: HashMap::new(),
            last_key_time: at,
            last_move_time: at,
            last_cursor: None,
            skip_keys: skip_keys.into_iter().collect(),
            mouse_interval,
            scroll_cooloff,
        }
    }

    pub fn from_config(config: &AppConfig, at: DateTime<Utc>) -> Self {
        Self::new(
            config.privacy.skip_keys.iter().cloned(),
            config.capture.mouse_sample_interval(),
            Duration::from_secs(config.capture.scroll_cooloff_secs),
            at,
        )
    }

    pub fn display(&self) -> Option<ActiveDisplay> {
        self.display
    }

    pub fn set_display(&mut self, display: Option<ActiveDisplay>) {
        self.display = display;
    }

    pub fn set_geometry(&mut self, geometry_id: i64) {
        if let Some(display) = self.display.as_mut() {
            display.geometry_id = geometry_id;
        }
    }

    pub fn pending_keys(&self) -> usize {
        self.key_presses.len()
    }

    pub fn pending_mouse_samples(&self) -> usize {
        self.mouse_path.len()
    }

    pub fn last_cursor(&self) -> Option<(i32, i32)> {
        self.last_cursor
    }

    /// Queue a key press. Returns `false` for keys in the skip set.
    pub fn record_key(&mut self, text: &str, modifiers: &[String], is_repeat: bool, at: DateTime<Utc>) -> bool {
        if self.skip_keys.contains(text) {
            return false;
        }
        self.key_presses.push(KeyPress {
            token: format_key_token(modifiers, text),
            at,
            delay: seconds_between(self.last_key_time, at),
            is_repeat,
        });
        self.last_key_time = at;
        true
    }

    /// Queue a path sample, at most one per sampling interval.
    pub fn record_mouse_move(&mut self, x: i32, y: i32, at: DateTime<Utc>) -> bool {
        self.last_cursor = Some((x, y));
        let elapsed = seconds_between(self.last_move_time, at);
        if elapsed < self.mouse_interval.as_secs_f64() {
            return false;
        }
        self.mouse_path.push(MouseSample { x, y, delay: elapsed });
        self.last_move_time = at;
        true
    }

    /// Register a click. Scroll buttons inside their cooloff return `None`;
    /// anything recorded takes the accumulated mouse path with it.
    pub fn record_click(&mut self, button: MouseButton, x: i32, y: i32, at: DateTime<Utc>) -> Option<RecordedClick> {
        self.last_cursor = Some((x, y));
        if button.is_scroll() {
            if let Some(prev) = self.last_scroll.get(&button) {
                if seconds_between(*prev, at) < self.scroll_cooloff.as_secs_f64() {
                    return None;
                }
            }
            self.last_scroll.insert(button, at);
        }
        Some(RecordedClick {
            button,
            x,
            y,
            path: std::mem::take(&mut self.mouse_path),
        })
    }

    /// Drain the key queue. `None` when nothing was typed.
    pub fn take_key_batch(&mut self, at: DateTime<Utc>) -> Option<KeyBatch> {
        self.last_key_time = at;
        if self.key_presses.is_empty() {
            return None;
        }
        let presses = std::mem::take(&mut self.key_presses);
        Some(KeyBatch {
            started_at: presses[0].at,
            presses,
            display: self.display,
        })
    }

    /// Forget queued input and focus, e.g. after the store moved.
    pub fn reset(&mut self, at: DateTime<Utc>) {
        self.display = None;
        self.key_presses.clear();
        self.mouse_path.clear();
        self.last_key_time = at;
        self.last_move_time = at;
    }
}
