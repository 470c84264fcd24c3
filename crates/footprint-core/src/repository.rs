use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::event::Rect;
use crate::schema::{
    from_db_time, to_db_time, ActivationInterval, LifecycleKind, LifecycleTarget, NewBookmark,
    NewClick, NewKeys, PurgeWindow, RecordingState, NO_URL,
};

pub struct ActivityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ActivityRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    // -- Processes --

    pub fn find_process(&self, name: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM processes WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn insert_process(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO processes (name, created_at) VALUES (?1, ?2)",
            params![name, to_db_time(&at)],
        )?;
        Ok(())
    }

    // -- Windows --

    /// Look a window up by its natural key.
    ///
    /// Without a URL the lookup ignores `browser_url` and prefers the
    /// sentinel row, so one title never fans out into several windows.
    pub fn find_window(&self, title: &str, process_id: i64, url: Option<&str>) -> Result<Option<i64>> {
        let found = match url {
            None => self
                .conn
                .query_row(
                    "SELECT id FROM windows
                     WHERE title = ?1 AND process_id = ?2
                     ORDER BY (browser_url = ?3) DESC, id
                     LIMIT 1",
                    params![title, process_id, NO_URL],
                    |row| row.get(0),
                )
                .optional()?,
            Some(url) => self.find_window_exact(title, process_id, url)?,
        };
        Ok(found)
    }

    /// Exact natural-key lookup, with the sentinel spelled out.
    pub fn find_window_exact(&self, title: &str, process_id: i64, url: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM windows
                 WHERE title = ?1 AND process_id = ?2 AND browser_url = ?3",
                params![title, process_id, url],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn insert_window(
        &self,
        title: &str,
        process_id: i64,
        url: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO windows (title, process_id, browser_url, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![title, process_id, url.unwrap_or(NO_URL), to_db_time(&at)],
        )?;
        Ok(())
    }

    // -- Geometries --

    pub fn find_geometry(&self, rect: &Rect) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM geometries
                 WHERE xpos = ?1 AND ypos = ?2 AND width = ?3 AND height = ?4",
                params![rect.x, rect.y, rect.width, rect.height],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn insert_geometry(&self, rect: &Rect, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO geometries (xpos, ypos, width, height, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![rect.x, rect.y, rect.width, rect.height, to_db_time(&at)],
        )?;
        Ok(())
    }

    // -- Append-only records --

    pub fn insert_lifecycle(
        &self,
        target: LifecycleTarget,
        kind: LifecycleKind,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let sql = match target {
            LifecycleTarget::Process(_) => {
                "INSERT INTO process_events (process_id, event_type, created_at) VALUES (?1, ?2, ?3)"
            }
            LifecycleTarget::Window(_) => {
                "INSERT INTO window_events (window_id, event_type, created_at) VALUES (?1, ?2, ?3)"
            }
        };
        let target_id = match target {
            LifecycleTarget::Process(id) | LifecycleTarget::Window(id) => id,
        };
        self.conn
            .execute(sql, params![target_id, kind.as_str(), to_db_time(&at)])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_keys(&self, keys: &NewKeys) -> Result<i64> {
        let display = keys.display;
        self.conn.execute(
            "INSERT INTO keys (text, key_tokens, timings, nrkeys, started_at,
                               process_id, window_id, geometry_id, created_at)
             VALUES ('', ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                serde_json::to_string(&keys.key_tokens)?,
                serde_json::to_string(&keys.timings)?,
                keys.nonrepeat_count,
                to_db_time(&keys.started_at),
                display.map(|d| d.process_id),
                display.map(|d| d.window_id),
                display.map(|d| d.geometry_id),
                to_db_time(&keys.created_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_click(&self, click: &NewClick) -> Result<i64> {
        let path_xy: Vec<[i32; 2]> = click.path.iter().map(|s| [s.x, s.y]).collect();
        let path_timings: Vec<f64> = click.path.iter().map(|s| s.delay).collect();
        let display = click.display;
        self.conn.execute(
            "INSERT INTO clicks (button, is_press, x, y, path_length, path_xy, path_timings,
                                 process_id, window_id, geometry_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                click.button,
                click.is_press,
                click.x,
                click.y,
                click.path.len() as i64,
                serde_json::to_string(&path_xy)?,
                serde_json::to_string(&path_timings)?,
                display.map(|d| d.process_id),
                display.map(|d| d.window_id),
                display.map(|d| d.geometry_id),
                to_db_time(&click.created_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_recording_event(&self, state: RecordingState, at: DateTime<Utc>) -> Result<i64> {
        let ts = to_db_time(&at);
        self.conn.execute(
            "INSERT INTO recording_events (time, state, created_at) VALUES (?1, ?2, ?1)",
            params![ts, state.as_str()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_bookmark(&self, bookmark: &NewBookmark, at: DateTime<Utc>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO bookmarks (time, text, audio_file, delay, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                to_db_time(&bookmark.time),
                bookmark.text,
                bookmark.audio_file,
                bookmark.delay,
                to_db_time(&at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Clear the derived activation table and store `intervals` in its place.
    pub fn replace_filtered_activations(
        &self,
        intervals: &[ActivationInterval],
        at: DateTime<Utc>,
    ) -> Result<usize> {
        self.conn.execute("DELETE FROM filtered_window_activations", [])?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO filtered_window_activations
                 (window_id, process_id, window_title, opened_at, closed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        let created_at = to_db_time(&at);
        for interval in intervals {
            stmt.execute(params![
                interval.window_id,
                interval.process_id,
                interval.window_title,
                to_db_time(&interval.opened_at),
                to_db_time(&interval.closed_at),
                created_at,
            ])?;
        }
        Ok(intervals.len())
    }

    /// Delete every row recorded inside `window`. Returns the number of rows removed.
    ///
    /// Identity rows are only removed once nothing left in the store refers
    /// to them.
    pub fn purge(&self, window: PurgeWindow) -> Result<u64> {
        let (cmp, cutoff) = match window {
            PurgeWindow::OlderThan(cutoff) => ("<", to_db_time(&cutoff)),
            PurgeWindow::Since(cutoff) => (">", to_db_time(&cutoff)),
            // Every stored timestamp sorts above the empty string.
            PurgeWindow::All => (">", String::new()),
        };

        let mut deleted = 0u64;
        for table in [
            "keys",
            "clicks",
            "bookmarks",
            "process_events",
            "window_events",
            "recording_events",
            "filtered_window_activations",
        ] {
            deleted += self.conn.execute(
                &format!("DELETE FROM {table} WHERE created_at {cmp} ?1"),
                params![cutoff],
            )? as u64;
        }

        deleted += self.conn.execute(
            &format!(
                "DELETE FROM windows WHERE created_at {cmp} ?1 AND id NOT IN (
                     SELECT window_id FROM keys WHERE window_id IS NOT NULL
                     UNION SELECT window_id FROM clicks WHERE window_id IS NOT NULL
                     UNION SELECT window_id FROM window_events)"
            ),
            params![cutoff],
        )? as u64;

        deleted += self.conn.execute(
            &format!(
                "DELETE FROM geometries WHERE created_at {cmp} ?1 AND id NOT IN (
                     SELECT geometry_id FROM keys WHERE geometry_id IS NOT NULL
                     UNION SELECT geometry_id FROM clicks WHERE geometry_id IS NOT NULL)"
            ),
            params![cutoff],
        )? as u64;

        deleted += self.conn.execute(
            &format!(
                "DELETE FROM processes WHERE created_at {cmp} ?1 AND id NOT IN (
                     SELECT process_id FROM windows
                     UNION SELECT process_id FROM keys WHERE process_id IS NOT NULL
                     UNION SELECT process_id FROM clicks WHERE process_id IS NOT NULL
                     UNION SELECT process_id FROM process_events)"
            ),
            params![cutoff],
        )? as u64;

        Ok(deleted)
    }
}

/// Read a timestamp column written by [`to_db_time`].
pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    from_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp '{raw}'").into(),
        )
    })
}

/// Read a JSON-encoded list column.
pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
