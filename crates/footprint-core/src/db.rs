use crate::error::{CoreError, Result};
use crate::repository::{json_column, time_column, ActivityRepository};
use crate::schema::{
    ActivationInterval, Bookmark, Click, FilteredWindowActivation, Geometry, Keys, LifecycleEvent,
    LifecycleKind, Process, RecordingEvent, RecordingState, Window, NO_URL,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open a database at the given path, apply PRAGMAs and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        db.apply_pragmas()?;
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn, path: None };
        db.apply_pragmas()?;
        db.run_migrations()?;
        Ok(db)
    }

    fn apply_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA cache_size = -8000;",
        )?;
        Ok(())
    }

    fn run_migrations(&mut self) -> Result<()> {
        embedded::migrations::runner()
            .run(&mut self.conn)
            .map_err(|e| CoreError::Migration(e.to_string()))?;
        Ok(())
    }

    /// File backing this database, `None` when in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Start a transaction. Dropping it without commit rolls back.
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }

    /// Read-side repository over the bare connection.
    pub fn repository(&self) -> ActivityRepository<'_> {
        ActivityRepository::new(&self.conn)
    }

    // -- Identity rows --

    pub fn list_processes(&self) -> Result<Vec<Process>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, created_at FROM processes ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Process {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: time_column(row, 2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn list_windows(&self) -> Result<Vec<Window>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, process_id, browser_url, created_at FROM windows ORDER BY id",
        )?;
        let rows = stmt.query_map([], window_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn get_window(&self, id: i64) -> Result<Option<Window>> {
        let window = self
            .conn
            .query_row(
                "SELECT id, title, process_id, browser_url, created_at FROM windows WHERE id = ?1",
                params![id],
                window_from_row,
            )
            .optional()?;
        Ok(window)
    }

    pub fn list_geometries(&self) -> Result<Vec<Geometry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, xpos, ypos, width, height, created_at FROM geometries ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Geometry {
                id: row.get(0)?,
                xpos: row.get(1)?,
                ypos: row.get(2)?,
                width: row.get(3)?,
                height: row.get(4)?,
                created_at: time_column(row, 5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // -- Lifecycle --

    pub fn process_events(&self) -> Result<Vec<LifecycleEvent>> {
        self.lifecycle_events(
            "SELECT id, process_id, event_type, created_at FROM process_events
             ORDER BY created_at, id",
            None,
        )
    }

    pub fn window_events(&self) -> Result<Vec<LifecycleEvent>> {
        self.lifecycle_events(
            "SELECT id, window_id, event_type, created_at FROM window_events
             ORDER BY created_at, id",
            None,
        )
    }

    /// Lifecycle history of one window, oldest first.
    pub fn window_events_for(&self, window_id: i64) -> Result<Vec<LifecycleEvent>> {
        self.lifecycle_events(
            "SELECT id, window_id, event_type, created_at FROM window_events
             WHERE window_id = ?1 ORDER BY created_at, id",
            Some(window_id),
        )
    }

    fn lifecycle_events(&self, sql: &str, target: Option<i64>) -> Result<Vec<LifecycleEvent>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = match target {
            Some(id) => stmt.query_map(params![id], lifecycle_from_row)?,
            None => stmt.query_map([], lifecycle_from_row)?,
        };
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // -- Input records --

    pub fn keys_records(&self) -> Result<Vec<Keys>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, text, key_tokens, timings, nrkeys, started_at,
                    process_id, window_id, geometry_id, created_at
             FROM keys ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Keys {
                id: row.get(0)?,
                text: row.get(1)?,
                key_tokens: json_column(row, 2)?,
                timings: json_column(row, 3)?,
                nonrepeat_count: row.get(4)?,
                started_at: time_column(row, 5)?,
                process_id: row.get(6)?,
                window_id: row.get(7)?,
                geometry_id: row.get(8)?,
                created_at: time_column(row, 9)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn clicks(&self) -> Result<Vec<Click>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, button, is_press, x, y, path_length, path_xy, path_timings,
                    process_id, window_id, geometry_id, created_at
             FROM clicks ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Click {
                id: row.get(0)?,
                button: row.get(1)?,
                is_press: row.get(2)?,
                x: row.get(3)?,
                y: row.get(4)?,
                path_length: row.get(5)?,
                path_xy: json_column(row, 6)?,
                path_timings: json_column(row, 7)?,
                process_id: row.get(8)?,
                window_id: row.get(9)?,
                geometry_id: row.get(10)?,
                created_at: time_column(row, 11)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn recording_events(&self) -> Result<Vec<RecordingEvent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, time, state FROM recording_events ORDER BY time, id")?;
        let rows = stmt.query_map([], |row| {
            let state: String = row.get(2)?;
            Ok(RecordingEvent {
                id: row.get(0)?,
                time: time_column(row, 1)?,
                state: RecordingState::parse(&state),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn bookmarks(&self) -> Result<Vec<Bookmark>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, time, text, audio_file, delay, created_at FROM bookmarks ORDER BY time, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Bookmark {
                id: row.get(0)?,
                time: time_column(row, 1)?,
                text: row.get(2)?,
                audio_file: row.get(3)?,
                delay: row.get(4)?,
                created_at: time_column(row, 5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // -- Reports --

    /// Pair window events into focus spans.
    ///
    /// An `Active` event opens a span; the next `Active` on any window or a
    /// `Close` of the same window ends it. Spans still open at the end of
    /// history are dropped.
    pub fn activation_intervals(&self) -> Result<Vec<ActivationInterval>> {
        let mut stmt = self.conn.prepare(
            "SELECT we.window_id, we.event_type, we.created_at, w.process_id, w.title
             FROM window_events we
             JOIN windows w ON w.id = we.window_id
             ORDER BY we.created_at, we.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                lifecycle_kind(row, 1)?,
                time_column(row, 2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut intervals = Vec::new();
        let mut open: Option<ActivationInterval> = None;
        for row in rows {
            let (window_id, kind, at, process_id, title) = row?;
            match kind {
                LifecycleKind::Active => {
                    if let Some(mut span) = open.take() {
                        span.closed_at = at;
                        intervals.push(span);
                    }
                    open = Some(ActivationInterval {
                        window_id,
                        process_id,
                        window_title: title,
                        opened_at: at,
                        closed_at: at,
                    });
                }
                LifecycleKind::Close => {
                    if open.as_ref().is_some_and(|s| s.window_id == window_id) {
                        if let Some(mut span) = open.take() {
                            span.closed_at = at;
                            intervals.push(span);
                        }
                    }
                }
                LifecycleKind::Open => {}
            }
        }
        Ok(intervals)
    }

    /// Recompute the derived activation table for the selected windows.
    pub fn rebuild_filtered_activations(
        &mut self,
        selected: &[i64],
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<ActivationInterval>> {
        let intervals: Vec<ActivationInterval> = self
            .activation_intervals()?
            .into_iter()
            .filter(|i| selected.contains(&i.window_id))
            .collect();
        let tx = self.conn.transaction()?;
        ActivityRepository::new(&tx).replace_filtered_activations(&intervals, at)?;
        tx.commit()?;
        Ok(intervals)
    }

    pub fn filtered_activations(&self) -> Result<Vec<FilteredWindowActivation>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, window_id, process_id, window_title, opened_at, closed_at
             FROM filtered_window_activations ORDER BY opened_at, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FilteredWindowActivation {
                id: row.get(0)?,
                window_id: row.get(1)?,
                process_id: row.get(2)?,
                window_title: row.get(3)?,
                opened_at: time_column(row, 4)?,
                closed_at: time_column(row, 5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Earliest `created_at` across the recorded input tables, if any.
    pub fn earliest_record(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let raw: Option<String> = self.conn.query_row(
            "SELECT MIN(t) FROM (
                 SELECT MIN(created_at) AS t FROM keys
                 UNION ALL SELECT MIN(created_at) FROM clicks
                 UNION ALL SELECT MIN(created_at) FROM window_events
                 UNION ALL SELECT MIN(time) FROM bookmarks)",
            [],
            |row| row.get(0),
        )?;
        Ok(raw.as_deref().and_then(crate::schema::from_db_time))
    }
}

fn window_from_row(row: &Row<'_>) -> rusqlite::Result<Window> {
    let url: String = row.get(3)?;
    Ok(Window {
        id: row.get(0)?,
        title: row.get(1)?,
        process_id: row.get(2)?,
        browser_url: (url != NO_URL).then_some(url),
        created_at: time_column(row, 4)?,
    })
}

fn lifecycle_from_row(row: &Row<'_>) -> rusqlite::Result<LifecycleEvent> {
    Ok(LifecycleEvent {
        id: row.get(0)?,
        target_id: row.get(1)?,
        kind: lifecycle_kind(row, 2)?,
        created_at: time_column(row, 3)?,
    })
}

fn lifecycle_kind(row: &Row<'_>, idx: usize) -> rusqlite::Result<LifecycleKind> {
    let raw: String = row.get(idx)?;
    LifecycleKind::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown event type '{raw}'").into(),
        )
    })
}
