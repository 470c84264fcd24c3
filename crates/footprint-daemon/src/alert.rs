use std::process::{Command, Stdio};

use footprint_core::writer::AlertSink;
use tracing::{error, warn};

/// Logs the alert and raises a critical desktop notification.
pub struct DesktopAlert;

impl AlertSink for DesktopAlert {
    fn alert(&self, message: &str) {
        error!("{message}");
        let spawned = Command::new("notify-send")
            .args(["-u", "critical", "-a", "footprint", "Footprint stopped recording", message])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            warn!(error = %e, "could not show desktop notification");
        }
    }
}
