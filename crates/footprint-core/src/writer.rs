use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Transaction;
use tracing::{debug, error, warn};

use crate::config::WriterConfig;
use crate::db::Database;
use crate::error::{CoreError, Result, StorageFailure};
use crate::repository::ActivityRepository;
use crate::schema::RecordingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WriterConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Sleep before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WriterConfig::default())
    }
}

/// Where user-visible alerts go when capture has to stop.
pub trait AlertSink: Send {
    fn alert(&self, message: &str);
}

/// Alert sink that only logs.
pub struct LogAlert;

impl AlertSink for LogAlert {
    fn alert(&self, message: &str) {
        error!("{message}");
    }
}

pub struct DurableWriter {
    policy: RetryPolicy,
    recording: Arc<AtomicBool>,
    alerts: Box<dyn AlertSink>,
    disabled: bool,
}

impl DurableWriter {
    pub fn new(policy: RetryPolicy, recording: Arc<AtomicBool>, alerts: Box<dyn AlertSink>) -> Self {
        Self {
            policy,
            recording,
            alerts,
            disabled: false,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Allow commits again after the user turns recording back on.
    pub fn rearm(&mut self) {
        if self.disabled {
            debug!("writer re-armed");
        }
        self.disabled = false;
    }

    /// Run `op` inside one transaction and commit it.
    ///
    /// Returns `Ok(None)` when nothing was written: the writer is disabled,
    /// the store ran out of space, or the failure was logged and dropped.
    /// Only a missing identity row after its insert surfaces as `Err`.
    pub fn commit<T, F>(&mut self, db: &mut Database, mut op: F) -> Result<Option<T>>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        if self.disabled {
            return Ok(None);
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match Self::try_once(db, &mut op) {
                Ok(value) => return Ok(Some(value)),
                Err(err) => err,
            };

            if matches!(err, CoreError::IdentityMissing { .. }) {
                return Err(err);
            }

            match err.storage_failure() {
                StorageFailure::Busy if attempt < self.policy.max_attempts => {
                    let wait = self.policy.backoff(attempt);
                    debug!(attempt, ?wait, "database busy, retrying");
                    std::thread::sleep(wait);
                }
                StorageFailure::Busy => {
                    self.disable(db, &format!("database stayed locked after {attempt} attempts"));
                    return Ok(None);
                }
                StorageFailure::Exhausted => {
                    self.disable(db, &err.to_string());
                    return Ok(None);
                }
                StorageFailure::Other => {
                    warn!(error = %err, "write dropped");
                    return Ok(None);
                }
            }
        }
    }

    fn try_once<T, F>(db: &mut Database, op: &mut F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        let tx = db.transaction()?;
        match op(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    debug!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Stop capturing. Idempotent: the alert fires once per outage.
    pub fn disable(&mut self, db: &mut Database, reason: &str) {
        self.recording.store(false, Ordering::SeqCst);
        if self.disabled {
            return;
        }
        self.disabled = true;
        self.alerts
            .alert(&format!("Recording stopped, storage unavailable: {reason}"));

        // Best effort; the store may be the thing that is broken.
        if let Err(e) =
            ActivityRepository::new(db.conn()).insert_recording_event(RecordingState::Off, Utc::now())
        {
            debug!(error = %e, "could not record recording-off marker");
        }
    }
}
