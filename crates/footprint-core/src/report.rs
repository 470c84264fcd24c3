use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::capture::parse_media_timestamp;
use crate::db::Database;
use crate::error::{CoreError, Result};
use crate::event::seconds_between;
use crate::schema::{ActivationInterval, Keys};
use crate::storage::StorageRoot;

pub const BOOKMARK_CSV: &str = "bookmark.csv";
pub const CLICKS_CSV: &str = "clicks_per_minute.csv";
pub const KEYS_CSV: &str = "keys_per_minute.csv";
pub const ACTIVITY_CSV: &str = "activity_events.csv";

/// Write all four reports into `<root>/reports` and return that directory.
///
/// A non-empty `window_ids` limits the activity report to those windows and
/// rebuilds the filtered activation table to match. Time columns are seconds
/// since the earliest screenshot, or the earliest stored row when there are none.
pub fn export_reports(
    db: &mut Database,
    storage: &StorageRoot,
    window_ids: &[i64],
    at: DateTime<Utc>,
) -> Result<PathBuf> {
    let out_dir = storage.current().join("reports");
    fs::create_dir_all(&out_dir)?;

    let start = earliest_screenshot(&storage.screenshots_dir())
        .or(db.earliest_record()?)
        .unwrap_or(at);

    let intervals = if window_ids.is_empty() {
        db.activation_intervals()?
    } else {
        db.rebuild_filtered_activations(window_ids, at)?
    };

    write_report(&out_dir, BOOKMARK_CSV, &bookmarks_csv(db, start)?)?;
    write_report(&out_dir, CLICKS_CSV, &clicks_csv(db, start)?)?;
    write_report(&out_dir, KEYS_CSV, &keys_csv(db, start)?)?;
    write_report(&out_dir, ACTIVITY_CSV, &activity_csv(&intervals, start))?;

    info!(dir = %out_dir.display(), windows = intervals.len(), "reports exported");
    Ok(out_dir)
}

fn write_report(dir: &Path, name: &str, contents: &str) -> Result<()> {
    let path = dir.join(name);
    fs::write(&path, contents)
        .map_err(|e| CoreError::Export(format!("failed to write {}: {e}", path.display())))
}

fn earliest_screenshot(dir: &Path) -> Option<DateTime<Utc>> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(parse_media_timestamp))
        .min()
}

fn bookmarks_csv(db: &Database, start: DateTime<Utc>) -> Result<String> {
    let mut out = String::from("time,text,audio,delay\n");
    for b in db.bookmarks()? {
        let _ = writeln!(
            out,
            "{},{},{},{}",
            offset(start, b.time),
            quote(&b.text),
            quote(b.audio_file.as_deref().unwrap_or("")),
            quote(b.delay.as_deref().unwrap_or("")),
        );
    }
    Ok(out)
}

fn clicks_csv(db: &Database, start: DateTime<Utc>) -> Result<String> {
    let times: Vec<DateTime<Utc>> = db.clicks()?.into_iter().map(|c| c.created_at).collect();
    Ok(per_minute_csv("clicks", &times, start))
}

fn keys_csv(db: &Database, start: DateTime<Utc>) -> Result<String> {
    let mut times = Vec::new();
    for keys in db.keys_records()? {
        key_times(&keys, &mut times);
    }
    times.sort();
    Ok(per_minute_csv("keys", &times, start))
}

fn activity_csv(intervals: &[ActivationInterval], start: DateTime<Utc>) -> String {
    let mut out = String::from("window_id,process_id,window_name,open_time,close_time\n");
    for i in intervals {
        let _ = writeln!(
            out,
            "{},{},{},{},{}",
            i.window_id,
            i.process_id,
            quote(&i.window_title),
            offset(start, i.opened_at),
            offset(start, i.closed_at),
        );
    }
    out
}

/// Rebuild one timestamp per key press from a batch's start time and its
/// delays. A collapsed run counts once per press it stands for.
fn key_times(keys: &Keys, out: &mut Vec<DateTime<Utc>>) {
    let mut at = keys.started_at;
    for (i, token) in keys.key_tokens.iter().enumerate() {
        if i > 0 {
            let delay = keys.timings.get(i).copied().unwrap_or(0.0);
            at += chrono::Duration::microseconds((delay * 1_000_000.0) as i64);
        }
        for _ in 0..run_length(token) {
            out.push(at);
        }
    }
}

/// `"<[A]x3>"` stands for three presses.
fn run_length(token: &str) -> usize {
    token
        .strip_suffix('>')
        .and_then(|t| t.rsplit_once(']'))
        .and_then(|(_, n)| n.strip_prefix('x'))
        .and_then(|n| n.parse().ok())
        .unwrap_or(1)
}

/// Count `times` (sorted) into one-minute buckets from the first entry,
/// including empty minutes in between.
fn per_minute_csv(label: &str, times: &[DateTime<Utc>], start: DateTime<Utc>) -> String {
    let mut out = format!("time,{label}\n");
    let Some(first) = times.first().copied() else {
        return out;
    };
    let mut buckets: Vec<usize> = Vec::new();
    for at in times {
        let idx = (seconds_between(first, *at) / 60.0) as usize;
        if buckets.len() <= idx {
            buckets.resize(idx + 1, 0);
        }
        buckets[idx] += 1;
    }
    let base = signed_seconds(start, first);
    for (i, count) in buckets.iter().enumerate() {
        let _ = writeln!(out, "{:.3},{count}", base + 60.0 * i as f64);
    }
    out
}

fn signed_seconds(start: DateTime<Utc>, at: DateTime<Utc>) -> f64 {
    (at - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
}

fn offset(start: DateTime<Utc>, at: DateTime<Utc>) -> String {
    format!("{:.3}", signed_seconds(start, at))
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Rect;
    use crate::schema::{LifecycleKind, LifecycleTarget, NewBookmark, NewClick, NewKeys};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 2, 10, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_run_length() {
        assert_eq!(run_length("<[A]x3>"), 3);
        assert_eq!(run_length("<[Control: *]x12>"), 12);
        assert_eq!(run_length("<[x]>"), 1);
        assert_eq!(run_length("*"), 1);
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("a,b"), "\"a,b\"");
        assert_eq!(quote("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_key_times_expand_runs() {
        let keys = Keys {
            id: 1,
            text: String::new(),
            key_tokens: vec!["*".into(), "<[Left]x3>".into(), "*".into()],
            timings: vec![0.0, 1.0, 2.0],
            nonrepeat_count: 5,
            started_at: t(0),
            process_id: None,
            window_id: None,
            geometry_id: None,
            created_at: t(5),
        };
        let mut times = Vec::new();
        key_times(&keys, &mut times);
        assert_eq!(times, vec![t(0), t(1), t(1), t(1), t(3)]);
    }

    #[test]
    fn test_per_minute_includes_gaps() {
        let times = vec![t(10), t(20), t(130)];
        let csv = per_minute_csv("clicks", &times, t(0));
        assert_eq!(csv, "time,clicks\n10.000,2\n70.000,0\n130.000,1\n");
    }

    #[test]
    fn test_export_writes_all_reports() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageRoot::new(
            tmp.path().to_path_buf(),
            vec![],
            "footprint.cfg",
            Box::new(crate::storage::DeviceMountProbe),
        );
        storage.ensure_dirs().unwrap();
        fs::write(storage.screenshots_dir().join("240202-100000000000.jpg"), b"").unwrap();

        let mut db = Database::open_in_memory().unwrap();
        let repo = db.repository();
        repo.insert_process("foot", t(0)).unwrap();
        let pid = repo.find_process("foot").unwrap().unwrap();
        repo.insert_window("shell, main", pid, None, t(0)).unwrap();
        let wid = repo.find_window("shell, main", pid, None).unwrap().unwrap();
        repo.insert_geometry(&Rect::default(), t(0)).unwrap();
        repo.insert_lifecycle(LifecycleTarget::Window(wid), LifecycleKind::Active, t(5)).unwrap();
        repo.insert_lifecycle(LifecycleTarget::Window(wid), LifecycleKind::Close, t(65)).unwrap();
        repo.insert_bookmark(
            &NewBookmark {
                time: t(30),
                text: "standup".into(),
                audio_file: None,
                delay: Some("now".into()),
            },
            t(30),
        )
        .unwrap();
        repo.insert_click(&NewClick {
            button: 1,
            is_press: true,
            x: 0,
            y: 0,
            path: vec![],
            display: None,
            created_at: t(12),
        })
        .unwrap();
        repo.insert_keys(&NewKeys {
            key_tokens: vec!["*".into(), "*".into()],
            timings: vec![0.0, 0.5],
            nonrepeat_count: 2,
            started_at: t(20),
            display: None,
            created_at: t(21),
        })
        .unwrap();

        let dir = export_reports(&mut db, &storage, &[wid], t(100)).unwrap();
        let read = |name: &str| fs::read_to_string(dir.join(name)).unwrap();

        assert_eq!(read(BOOKMARK_CSV), "time,text,audio,delay\n30.000,standup,,now\n");
        assert_eq!(read(CLICKS_CSV), "time,clicks\n12.000,1\n");
        assert_eq!(read(KEYS_CSV), "time,keys\n20.000,2\n");
        assert_eq!(
            read(ACTIVITY_CSV),
            format!("window_id,process_id,window_name,open_time,close_time\n{wid},{pid},\"shell, main\",5.000,65.000\n")
        );
        assert_eq!(db.filtered_activations().unwrap().len(), 1);
    }
}
