use chrono::{DateTime, Utc};

use crate::db::Database;
use crate::error::{CoreError, Result};
use crate::event::Rect;
use crate::repository::ActivityRepository;
use crate::schema::NO_URL;
use crate::writer::DurableWriter;

/// Borrowed view over the store and its writer for one lookup batch.
///
/// Each method returns `Ok(None)` when the insert could not be written (the
/// writer dropped it or capture is disabled); callers skip the event.
pub struct IdentityResolver<'a> {
    db: &'a mut Database,
    writer: &'a mut DurableWriter,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(db: &'a mut Database, writer: &'a mut DurableWriter) -> Self {
        Self { db, writer }
    }

    pub fn find_or_create_process(&mut self, name: &str, at: DateTime<Utc>) -> Result<Option<i64>> {
        if let Some(id) = self.db.repository().find_process(name)? {
            return Ok(Some(id));
        }
        let written = self
            .writer
            .commit(self.db, |tx| ActivityRepository::new(tx).insert_process(name, at))?;
        if written.is_none() {
            return Ok(None);
        }
        match self.db.repository().find_process(name)? {
            Some(id) => Ok(Some(id)),
            None => Err(CoreError::IdentityMissing {
                kind: "process",
                key: name.to_string(),
            }),
        }
    }

    /// `url` of `None` matches any existing row for the title and prefers the
    /// URL-less one; a new row stores the sentinel.
    pub fn find_or_create_window(
        &mut self,
        title: &str,
        process_id: i64,
        url: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        if let Some(id) = self.db.repository().find_window(title, process_id, url)? {
            return Ok(Some(id));
        }
        let written = self.writer.commit(self.db, |tx| {
            ActivityRepository::new(tx).insert_window(title, process_id, url, at)
        })?;
        if written.is_none() {
            return Ok(None);
        }
        let stored_url = url.unwrap_or(NO_URL);
        match self
            .db
            .repository()
            .find_window_exact(title, process_id, stored_url)?
        {
            Some(id) => Ok(Some(id)),
            None => Err(CoreError::IdentityMissing {
                kind: "window",
                key: format!("{title} (process {process_id}, {stored_url})"),
            }),
        }
    }

    pub fn find_or_create_geometry(&mut self, rect: &Rect, at: DateTime<Utc>) -> Result<Option<i64>> {
        if let Some(id) = self.db.repository().find_geometry(rect)? {
            return Ok(Some(id));
        }
        let written = self
            .writer
            .commit(self.db, |tx| ActivityRepository::new(tx).insert_geometry(rect, at))?;
        if written.is_none() {
            return Ok(None);
        }
        match self.db.repository().find_geometry(rect)? {
            Some(id) => Ok(Some(id)),
            None => Err(CoreError::IdentityMissing {
                kind: "geometry",
                key: format!("{}x{}+{}+{}", rect.width, rect.height, rect.x, rect.y),
            }),
        }
    }
}
