use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use footprint_core::capture::{CaptureError, ScreenshotSink};
use footprint_core::event::{KeyInput, Rect, ScreenChange, WindowObservation};
use footprint_core::schema::{LifecycleKind, PurgeWindow, RecordingState};
use footprint_core::storage::MountProbe;
use footprint_core::writer::AlertSink;
use footprint_core::{AppConfig, Database, Recorder, StorageRoot, Transition};

#[derive(Clone, Default)]
struct Shots(Arc<Mutex<Vec<PathBuf>>>);

impl ScreenshotSink for Shots {
    fn request(&mut self, path: PathBuf) {
        self.0.lock().unwrap().push(path);
    }
}

#[derive(Clone, Default)]
struct Alerts(Arc<Mutex<Vec<String>>>);

impl AlertSink for Alerts {
    fn alert(&self, message: &str) {
        self.0.lock().unwrap().push(message.to_string());
    }
}

struct FlagProbe(Arc<AtomicBool>);

impl MountProbe for FlagProbe {
    fn is_mount(&self, _path: &Path) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Harness {
    _tmp: tempfile::TempDir,
    local: PathBuf,
    stick: PathBuf,
    mounted: Arc<AtomicBool>,
    shots: Shots,
    alerts: Alerts,
    recorder: Recorder,
}

fn t(ms: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 10, 9, 30, 0).unwrap() + chrono::Duration::milliseconds(ms)
}

fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let local = tmp.path().join("local");
    let media = tmp.path().join("media");
    let stick = media.join("stick");
    fs::create_dir_all(&local).unwrap();
    fs::create_dir_all(&stick).unwrap();

    let mounted = Arc::new(AtomicBool::new(true));
    let storage = StorageRoot::new(
        local.clone(),
        vec![media],
        "footprint.cfg",
        Box::new(FlagProbe(mounted.clone())),
    );
    let shots = Shots::default();
    let alerts = Alerts::default();
    let recorder = Recorder::open(
        AppConfig::default(),
        storage,
        Box::new(shots.clone()),
        Box::new(alerts.clone()),
        t(0),
    )
    .unwrap();

    Harness {
        _tmp: tmp,
        local,
        stick,
        mounted,
        shots,
        alerts,
        recorder,
    }
}

fn screen(process: &str, title: &str) -> ScreenChange {
    ScreenChange {
        process_name: process.to_string(),
        window_title: title.to_string(),
        geometry: Rect {
            x: 0,
            y: 0,
            width: 1280,
            height: 800,
        },
        browser_url: None,
        regular_apps: vec![process.to_string()],
        regular_windows: vec![WindowObservation {
            process_name: process.to_string(),
            title: title.to_string(),
            browser_url: None,
            geometry: Rect {
                x: 0,
                y: 0,
                width: 1280,
                height: 800,
            },
        }],
    }
}

fn key(text: &str) -> KeyInput {
    KeyInput {
        keycode: 0,
        modifiers: vec![],
        text: text.to_string(),
        is_repeat: false,
    }
}

#[test]
fn repeated_notifications_reuse_identity_rows() {
    let mut h = harness();
    let first = h.recorder.on_screen_change(&screen("foot", "shell"), t(10)).unwrap();
    let second = h.recorder.on_screen_change(&screen("foot", "shell"), t(20)).unwrap();

    assert!(matches!(first, Transition::Switched { previous: None, .. }));
    assert_eq!(second, Transition::Unchanged);

    let db = h.recorder.database();
    assert_eq!(db.list_processes().unwrap().len(), 1);
    assert_eq!(db.list_windows().unwrap().len(), 1);
    assert_eq!(db.list_geometries().unwrap().len(), 1);

    // One Active per target, no repeats for the unchanged notification.
    let active: Vec<_> = db
        .process_events()
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == LifecycleKind::Active)
        .collect();
    assert_eq!(active.len(), 1);
}

#[test]
fn keys_are_flushed_to_the_window_they_were_typed_in() {
    let mut h = harness();
    h.recorder.on_screen_change(&screen("code", "main.rs"), t(0)).unwrap();
    for (i, text) in ["f", "n", "Return", "Return"].iter().enumerate() {
        h.recorder.on_key(&key(text), t(100 + i as i64 * 100));
    }

    let Transition::Switched { previous, current } =
        h.recorder.on_screen_change(&screen("firefox", "Docs"), t(1_000)).unwrap()
    else {
        panic!("expected a window switch");
    };
    h.recorder.on_key(&key("q"), t(1_100));

    let keys = h.recorder.database().keys_records().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].window_id, previous.map(|d| d.window_id));
    assert_eq!(keys[0].key_tokens, vec!["*", "*", "<[Return]x2>"]);
    assert_eq!(keys[0].key_tokens.len(), keys[0].timings.len());
    assert_eq!(keys[0].nonrepeat_count, 4);
    assert_eq!(keys[0].text, "");
    assert_eq!(keys[0].started_at, t(100));

    h.recorder.stop(t(2_000)).unwrap();
    let keys = h.recorder.database().keys_records().unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[1].window_id, Some(current.window_id));
    assert_eq!(keys[1].key_tokens, vec!["*"]);
}

#[test]
fn typed_text_never_reaches_stored_tokens() {
    let mut h = harness();
    h.recorder.on_screen_change(&screen("term", "a"), t(0)).unwrap();
    for (i, text) in ["hunter2", "qz", "ünï", "Tab"].iter().enumerate() {
        h.recorder.on_key(&key(text), t(100 + i as i64 * 100));
    }
    let mut chord = key("pw");
    chord.modifiers = vec!["Control".into()];
    h.recorder.on_key(&chord, t(500));
    h.recorder.on_screen_change(&screen("term", "b"), t(1_000)).unwrap();

    let keys = h.recorder.database().keys_records().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(
        keys[0].key_tokens,
        vec!["<[*]>", "<[*]>", "<[*]>", "<[Tab]>", "<[Control: *]>"]
    );
    for token in &keys[0].key_tokens {
        for secret in ["hunter2", "qz", "ünï", "pw"] {
            assert!(!token.contains(secret), "{token} leaks {secret}");
        }
    }
}

#[test]
fn geometry_change_keeps_the_batch_open() {
    let mut h = harness();
    h.recorder.on_screen_change(&screen("foot", "shell"), t(0)).unwrap();
    h.recorder.on_key(&key("a"), t(10));

    let mut moved = screen("foot", "shell");
    moved.geometry.x = 200;
    let transition = h.recorder.on_screen_change(&moved, t(20)).unwrap();

    assert_eq!(transition, Transition::Unchanged);
    assert!(h.recorder.database().keys_records().unwrap().is_empty());
    assert_eq!(h.recorder.status().pending_keys, 1);
    let geometry = h.recorder.status().active_display.unwrap().geometry_id;
    let stored: Vec<_> = h.recorder.database().list_geometries().unwrap();
    assert_eq!(stored.last().unwrap().id, geometry);
    assert_eq!(stored.last().unwrap().xpos, 200);
}

#[test]
fn ignored_windows_change_nothing() {
    let mut h = harness();
    let transition = h.recorder.on_screen_change(&screen("gnome-shell", "Focus Proxy"), t(0)).unwrap();
    assert_eq!(transition, Transition::Ignored);
    assert!(h.recorder.database().list_processes().unwrap().is_empty());
}

#[test]
fn scroll_within_cooloff_is_stored_once() {
    let mut h = harness();
    h.recorder.on_mouse_click(5, 10, 10, t(0)).unwrap();
    h.recorder.on_mouse_click(5, 10, 10, t(3_000)).unwrap();
    assert_eq!(h.recorder.database().clicks().unwrap().len(), 1);
}

#[test]
fn scroll_after_cooloff_is_stored_again() {
    let mut h = harness();
    h.recorder.on_mouse_click(5, 10, 10, t(0)).unwrap();
    h.recorder.on_mouse_click(5, 10, 10, t(11_000)).unwrap();
    assert_eq!(h.recorder.database().clicks().unwrap().len(), 2);
}

#[test]
fn mouse_path_is_capped_at_ten_hertz() {
    let mut h = harness();
    for i in 0..50 {
        h.recorder.on_mouse_move(300, 300, t(i * 4));
    }
    h.recorder.on_mouse_click(1, 300, 300, t(200)).unwrap();
    h.recorder.on_mouse_click(9, 300, 300, t(210)).unwrap();

    let clicks = h.recorder.database().clicks().unwrap();
    assert_eq!(clicks.len(), 1);
    assert!(clicks[0].path_length <= 2);
    assert_eq!(clicks[0].path_xy.len() as i64, clicks[0].path_length);
}

#[test]
fn app_set_changes_emit_open_and_close() {
    let mut h = harness();
    let mut change = screen("a", "A main");
    change.regular_apps = vec!["a".into(), "b".into()];
    change.regular_windows.clear();
    h.recorder.on_screen_change(&change, t(0)).unwrap();
    let before = h.recorder.database().process_events().unwrap().len();

    change.regular_apps = vec!["b".into(), "c".into()];
    h.recorder.on_screen_change(&change, t(1_000)).unwrap();

    let db = h.recorder.database();
    let id = |name: &str| {
        db.list_processes()
            .unwrap()
            .into_iter()
            .find(|p| p.name == name)
            .unwrap()
            .id
    };
    let new_events: Vec<_> = db.process_events().unwrap().into_iter().skip(before).collect();
    let opens: Vec<_> = new_events.iter().filter(|e| e.kind == LifecycleKind::Open).collect();
    let closes: Vec<_> = new_events.iter().filter(|e| e.kind == LifecycleKind::Close).collect();
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].target_id, id("c"));
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].target_id, id("a"));
    assert_eq!(h.recorder.status().tracked_apps, 2);
}

#[test]
fn window_set_changes_emit_open_and_close() {
    let mut h = harness();
    h.recorder.on_screen_change(&screen("foot", "one"), t(0)).unwrap();
    h.recorder.on_screen_change(&screen("foot", "two"), t(1_000)).unwrap();

    let db = h.recorder.database();
    let windows = db.list_windows().unwrap();
    let one = windows.iter().find(|w| w.title == "one").unwrap().id;
    let kinds: Vec<_> = db.window_events_for(one).unwrap().into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![LifecycleKind::Active, LifecycleKind::Open, LifecycleKind::Close]);
}

#[test]
fn stop_flushes_keys_then_closes_everything() {
    let mut h = harness();
    h.recorder.on_screen_change(&screen("foot", "shell"), t(0)).unwrap();
    h.recorder.on_key(&key("l"), t(100));
    h.recorder.on_key(&key("s"), t(200));

    // Log every insert from here on in write order.
    h.recorder
        .database()
        .conn()
        .execute_batch(
            "CREATE TEMP TABLE write_log (seq INTEGER PRIMARY KEY AUTOINCREMENT, tbl TEXT NOT NULL);
             CREATE TEMP TRIGGER log_keys AFTER INSERT ON main.keys
                 BEGIN INSERT INTO write_log (tbl) VALUES ('keys'); END;
             CREATE TEMP TRIGGER log_process_events AFTER INSERT ON main.process_events
                 BEGIN INSERT INTO write_log (tbl) VALUES ('process_events'); END;
             CREATE TEMP TRIGGER log_window_events AFTER INSERT ON main.window_events
                 BEGIN INSERT INTO write_log (tbl) VALUES ('window_events'); END;
             CREATE TEMP TRIGGER log_recording_events AFTER INSERT ON main.recording_events
                 BEGIN INSERT INTO write_log (tbl) VALUES ('recording_events'); END;",
        )
        .unwrap();

    h.recorder.stop(t(500)).unwrap();

    let db = h.recorder.database();
    let mut stmt = db.conn().prepare("SELECT tbl FROM write_log ORDER BY seq").unwrap();
    let order: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        order,
        vec!["keys", "process_events", "window_events", "recording_events"]
    );

    assert_eq!(db.keys_records().unwrap().len(), 1);
    let closes = db
        .process_events()
        .unwrap()
        .into_iter()
        .chain(db.window_events().unwrap())
        .filter(|e| e.kind == LifecycleKind::Close)
        .count();
    assert_eq!(closes, 2);
    let last = db.recording_events().unwrap().pop().unwrap();
    assert_eq!(last.state, RecordingState::Off);
    assert!(!h.recorder.is_recording());
    assert_eq!(h.recorder.status().tracked_windows, 0);
}

#[test]
fn full_disk_disables_capture_once() {
    let mut h = harness();
    h.recorder.on_screen_change(&screen("foot", "shell"), t(0)).unwrap();

    h.recorder.on_screenshot_failed(&CaptureError::NoSpace);
    h.recorder.on_screenshot_failed(&CaptureError::NoSpace);

    assert!(!h.recorder.is_recording());
    assert!(h.recorder.status().writer_disabled);
    assert_eq!(h.alerts.0.lock().unwrap().len(), 1);
    let offs = h
        .recorder
        .database()
        .recording_events()
        .unwrap()
        .into_iter()
        .filter(|e| e.state == RecordingState::Off)
        .count();
    assert_eq!(offs, 1);

    // Nothing is written while disabled.
    assert!(!h.recorder.on_key(&key("x"), t(10)));
    h.recorder.on_mouse_click(1, 0, 0, t(20)).unwrap();
    assert!(h.recorder.database().clicks().unwrap().is_empty());
    assert_eq!(
        h.recorder.on_screen_change(&screen("foot", "other"), t(30)).unwrap(),
        Transition::Ignored
    );

    h.recorder.set_recording(true, t(40)).unwrap();
    assert!(!h.recorder.status().writer_disabled);
    h.recorder.on_mouse_click(1, 0, 0, t(50)).unwrap();
    assert_eq!(h.recorder.database().clicks().unwrap().len(), 1);
}

#[test]
fn other_capture_failures_keep_recording() {
    let mut h = harness();
    h.recorder
        .on_screenshot_failed(&CaptureError::Backend("grim exited with 1".into()));
    assert!(h.recorder.is_recording());
    assert!(h.alerts.0.lock().unwrap().is_empty());
}

#[test]
fn screenshots_land_under_the_current_root() {
    let mut h = harness();
    h.recorder.on_screen_change(&screen("foot", "shell"), t(0)).unwrap();
    h.recorder.on_key(&key("a"), t(100));
    h.recorder.on_key(&key("b"), t(300));

    let shots = h.shots.0.lock().unwrap().clone();
    assert_eq!(shots.len(), 2);
    assert!(shots.iter().all(|p| p.starts_with(h.local.join("screenshots"))));
    assert_eq!(
        shots[0].file_name().unwrap().to_str().unwrap(),
        "240410-093000000000.jpg"
    );
}

#[test]
fn inserting_a_marked_medium_moves_the_store() {
    let mut h = harness();
    h.recorder.on_screen_change(&screen("foot", "shell"), t(0)).unwrap();
    h.recorder.on_key(&key("a"), t(100));

    fs::write(h.stick.join("footprint.cfg"), "").unwrap();
    let change = h.recorder.on_storage_poll(t(1_000)).unwrap().unwrap();
    assert_eq!(change.to, h.stick);
    assert_eq!(
        h.recorder.database().path(),
        Some(h.stick.join("footprint.sqlite").as_path())
    );

    // The pending batch went into the old store.
    let old = Database::open(&h.local.join("footprint.sqlite")).unwrap();
    assert_eq!(old.keys_records().unwrap().len(), 1);

    // Identity state is rebuilt against the new store.
    let transition = h.recorder.on_screen_change(&screen("foot", "shell"), t(2_000)).unwrap();
    assert!(matches!(transition, Transition::Switched { previous: None, .. }));
    assert_eq!(h.recorder.database().list_windows().unwrap().len(), 1);

    h.mounted.store(false, Ordering::SeqCst);
    let back = h.recorder.on_storage_poll(t(3_000)).unwrap().unwrap();
    assert_eq!(back.to, h.local);
    assert!(h.recorder.on_storage_poll(t(4_000)).unwrap().is_none());
}

#[test]
fn purging_recent_minutes_forgets_them() {
    let mut h = harness();
    h.recorder.on_screen_change(&screen("foot", "shell"), t(0)).unwrap();
    h.recorder.on_mouse_click(1, 0, 0, t(60_000)).unwrap();
    h.recorder.on_mouse_click(1, 0, 0, t(600_000)).unwrap();

    let report = h
        .recorder
        .purge(PurgeWindow::Since(t(300_000)), t(610_000))
        .unwrap();
    assert_eq!(report.rows_deleted, 1);
    assert_eq!(h.recorder.database().clicks().unwrap().len(), 1);
    // The early screenshot predates the window.
    assert_eq!(report.files_deleted, 0);
}
