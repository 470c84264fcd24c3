use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub storage: StorageConfig,
    pub privacy: PrivacyConfig,
    pub writer: WriterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Whether recording is on when the daemon starts.
    pub enabled: bool,
    pub screenshots: bool,
    pub screenshot_min_interval_ms: u64,
    pub screenshot_max_interval_secs: u64,
    pub mouse_sample_hz: u32,
    pub scroll_cooloff_secs: u64,
    pub jpeg_quality: u8,
    /// Command used to grab the screen; `{path}` is replaced with the output file.
    pub screenshot_command: Vec<String>,
    pub cursor_in_filename: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub local_dir: String,
    /// Directories whose mounted children are checked for the marker file.
    pub removable_roots: Vec<String>,
    pub marker_file: String,
    pub poll_interval_secs: u64,
    pub db_name: String,
    /// 0 keeps everything.
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Key names that never enter the key buffer (pure modifiers).
    pub skip_keys: Vec<String>,
    /// Window titles whose focus changes are ignored.
    pub ignored_windows: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            screenshots: true,
            screenshot_min_interval_ms: 200,
            screenshot_max_interval_secs: 60,
            mouse_sample_hz: 10,
            scroll_cooloff_secs: 10,
            jpeg_quality: 70,
            screenshot_command: vec!["grim".to_string(), "{path}".to_string()],
            cursor_in_filename: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_dir: "~/.footprint".to_string(),
            removable_roots: vec![
                "/media/$USER".to_string(),
                "/run/media/$USER".to_string(),
                "/mnt".to_string(),
                "/Volumes".to_string(),
            ],
            marker_file: "footprint.cfg".to_string(),
            poll_interval_secs: 10,
            db_name: "footprint.sqlite".to_string(),
            retention_days: 0,
        }
    }
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            skip_keys: [
                "", "Shift_L", "Shift_R", "Control_L", "Control_R", "Super_L", "Super_R", "Alt_L",
                "[65027]",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ignored_windows: vec!["Focus Proxy".to_string(), "Clipboard".to_string()],
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 5,
            max_backoff_ms: 500,
        }
    }
}

impl CaptureConfig {
    pub fn mouse_sample_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.mouse_sample_hz.max(1)))
    }
}

impl AppConfig {
    /// Load config from `~/.footprint/config.toml`, creating defaults if missing.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_base_dir()?.join("config.toml");

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = AppConfig::default();
            config.ensure_dirs()?;
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| CoreError::Config(format!("failed to serialize config: {e}")))?;
            fs::write(&config_path, toml_str)?;
            Ok(config)
        }
    }

    /// Load config from a specific path (for testing or custom setups).
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("failed to read config: {e}")))?;
        let config: AppConfig = toml::from_str(&contents)
            .map_err(|e| CoreError::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Returns the default base directory (`~/.footprint`), where the config lives.
    pub fn default_base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))?;
        Ok(home.join(".footprint"))
    }

    /// The fallback storage root used when no removable medium is present.
    pub fn local_dir(&self) -> Result<PathBuf> {
        expand_path(&self.storage.local_dir)
    }

    /// Removable-medium search directories with `~` and `$USER` expanded.
    pub fn removable_roots(&self) -> Result<Vec<PathBuf>> {
        self.storage
            .removable_roots
            .iter()
            .map(|p| expand_path(p))
            .collect()
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(Self::default_base_dir()?)?;
        fs::create_dir_all(self.local_dir()?)?;
        Ok(())
    }
}

/// Expand a leading `~` and any `$USER` in a configured path.
pub fn expand_path(path: &str) -> Result<PathBuf> {
    let path = if path.contains("$USER") {
        let user = std::env::var("USER").unwrap_or_default();
        path.replace("$USER", &user)
    } else {
        path.to_string()
    };

    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))?;
        Ok(home.join(rest))
    } else if path == "~" {
        dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))
    } else {
        Ok(PathBuf::from(path))
    }
}

/// Initialize tracing/logging with env filter.
///
/// Respects `RUST_LOG` env var. Defaults to `info` level.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.capture.enabled);
        assert_eq!(config.capture.scroll_cooloff_secs, 10);
        assert_eq!(config.capture.mouse_sample_hz, 10);
        assert_eq!(config.storage.poll_interval_secs, 10);
        assert_eq!(config.storage.marker_file, "footprint.cfg");
        assert!(config.privacy.skip_keys.contains(&"Shift_L".to_string()));
        assert!(config.privacy.ignored_windows.contains(&"Focus Proxy".to_string()));
    }

    #[test]
    fn test_mouse_sample_interval() {
        let mut capture = CaptureConfig::default();
        assert_eq!(capture.mouse_sample_interval(), Duration::from_millis(100));
        capture.mouse_sample_hz = 0;
        assert_eq!(capture.mouse_sample_interval(), Duration::from_millis(1000));
    }

    #[test]
    fn test_load_from_toml() {
        let toml_content = r#"
[capture]
screenshots = false
screenshot_max_interval_secs = 30

[storage]
local_dir = "/tmp/test-footprint"
retention_days = 14

[writer]
max_attempts = 3
"#;
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(toml_content.as_bytes()).unwrap();

        let config = AppConfig::load_from(f.path()).unwrap();
        assert!(!config.capture.screenshots);
        assert_eq!(config.capture.screenshot_max_interval_secs, 30);
        assert_eq!(config.storage.retention_days, 14);
        assert_eq!(config.writer.max_attempts, 3);
        assert_eq!(config.local_dir().unwrap(), PathBuf::from("/tmp/test-footprint"));
        // defaults for fields not specified
        assert_eq!(config.capture.screenshot_min_interval_ms, 200);
        assert_eq!(config.writer.max_backoff_ms, 500);
        assert_eq!(config.storage.db_name, "footprint.sqlite");
    }

    #[test]
    fn test_expand_path_plain() {
        assert_eq!(expand_path("/mnt").unwrap(), PathBuf::from("/mnt"));
    }
}
