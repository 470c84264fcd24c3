use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no space left on device")]
    NoSpace,

    #[error("permission denied")]
    PermissionDenied,

    #[error("capture backend failed: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(io::Error),
}

impl CaptureError {
    /// ENOSPC and EDQUOT both mean the medium is full.
    pub fn from_io(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(28) | Some(122) => CaptureError::NoSpace,
            _ if err.kind() == io::ErrorKind::PermissionDenied => CaptureError::PermissionDenied,
            _ => CaptureError::Io(err),
        }
    }

    pub fn is_no_space(&self) -> bool {
        matches!(self, CaptureError::NoSpace)
    }
}

impl From<io::Error> for CaptureError {
    fn from(err: io::Error) -> Self {
        Self::from_io(err)
    }
}

/// Grabs the screen into `dest`.
pub trait ScreenCapturer: Send + Sync {
    fn name(&self) -> &str;
    fn capture_screenshot(&self, dest: &Path) -> Result<(), CaptureError>;
}

/// Receives screenshot requests from the recorder; the capture itself
/// happens elsewhere so ingestion never waits on encoding.
pub trait ScreenshotSink: Send {
    fn request(&mut self, path: PathBuf);
}

/// Sink that drops every request, for headless runs.
pub struct NoScreenshots;

impl ScreenshotSink for NoScreenshots {
    fn request(&mut self, _path: PathBuf) {}
}

/// `YYMMDD-HHMMSSffffff.jpg`, optionally with `_x_y` cursor coordinates.
pub fn screenshot_filename(at: DateTime<Utc>, cursor: Option<(i32, i32)>) -> String {
    let stamp = format!(
        "{}{:06}",
        at.format("%y%m%d-%H%M%S"),
        at.nanosecond() % 1_000_000_000 / 1_000
    );
    match cursor {
        Some((x, y)) => format!("{stamp}_{x}_{y}.jpg"),
        None => format!("{stamp}.jpg"),
    }
}

/// Recover the capture time from a media filename, ignoring any suffix.
pub fn parse_media_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let digits = |s: &str| -> Option<u32> {
        if s.bytes().all(|b| b.is_ascii_digit()) {
            s.parse().ok()
        } else {
            None
        }
    };

    let stamp = name.get(..19)?;
    if !stamp.is_ascii() || stamp.as_bytes()[6] != b'-' {
        return None;
    }
    let year = 2000 + digits(&stamp[0..2])? as i32;
    let month = digits(&stamp[2..4])?;
    let day = digits(&stamp[4..6])?;
    let hour = digits(&stamp[7..9])?;
    let minute = digits(&stamp[9..11])?;
    let second = digits(&stamp[11..13])?;
    let micros = digits(&stamp[13..19])?;

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_micro_opt(hour, minute, second, micros)?;
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 9, 14, 3, 5).unwrap() + Duration::microseconds(42_017)
    }

    #[test]
    fn test_filename_format() {
        assert_eq!(screenshot_filename(at(), None), "240709-140305042017.jpg");
        assert_eq!(
            screenshot_filename(at(), Some((640, -12))),
            "240709-140305042017_640_-12.jpg"
        );
    }

    #[test]
    fn test_parse_media_timestamp() {
        assert_eq!(parse_media_timestamp("240709-140305042017.jpg"), Some(at()));
        assert_eq!(parse_media_timestamp("240709-140305042017_1_2.jpg"), Some(at()));
        assert_eq!(parse_media_timestamp("240709-140305042017.m4a"), Some(at()));
        assert_eq!(parse_media_timestamp("notes.txt"), None);
        assert_eq!(parse_media_timestamp("241309-140305042017.jpg"), None);
    }

    #[test]
    fn test_io_errors_classified() {
        let full = io::Error::from_raw_os_error(28);
        assert!(CaptureError::from_io(full).is_no_space());
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(CaptureError::from(denied), CaptureError::PermissionDenied));
        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(matches!(CaptureError::from(other), CaptureError::Io(_)));
    }
}
