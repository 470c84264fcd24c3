use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::capture::parse_media_timestamp;
use crate::config::AppConfig;
use crate::error::Result;
use crate::schema::PurgeWindow;

/// Decides whether a directory is a mount point.
pub trait MountProbe: Send {
    fn is_mount(&self, path: &Path) -> bool;
}

/// A directory is a mount point when it sits on a different device than
/// its parent.
pub struct DeviceMountProbe;

impl MountProbe for DeviceMountProbe {
    #[cfg(unix)]
    fn is_mount(&self, path: &Path) -> bool {
        use std::os::unix::fs::MetadataExt;

        let Some(parent) = path.parent() else {
            return false;
        };
        match (fs::metadata(path), fs::metadata(parent)) {
            (Ok(own), Ok(up)) => own.is_dir() && own.dev() != up.dev(),
            _ => false,
        }
    }

    #[cfg(not(unix))]
    fn is_mount(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootChange {
    pub from: PathBuf,
    pub to: PathBuf,
}

pub struct StorageRoot {
    local_dir: PathBuf,
    search_dirs: Vec<PathBuf>,
    marker_file: String,
    removable: Option<PathBuf>,
    probe: Box<dyn MountProbe>,
}

impl StorageRoot {
    pub fn new(
        local_dir: PathBuf,
        search_dirs: Vec<PathBuf>,
        marker_file: impl Into<String>,
        probe: Box<dyn MountProbe>,
    ) -> Self {
        let mut root = Self {
            local_dir,
            search_dirs,
            marker_file: marker_file.into(),
            removable: None,
            probe,
        };
        root.removable = root.find_removable();
        if let Some(dir) = &root.removable {
            info!(dir = %dir.display(), "storing on removable medium");
        }
        root
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new(
            config.local_dir()?,
            config.removable_roots()?,
            config.storage.marker_file.clone(),
            Box::new(DeviceMountProbe),
        ))
    }

    /// The root in effect right now. Resolve paths through this at the
    /// moment of use; it changes when media come and go.
    pub fn current(&self) -> &Path {
        self.removable.as_deref().unwrap_or(&self.local_dir)
    }

    pub fn is_removable(&self) -> bool {
        self.removable.is_some()
    }

    /// Re-check the media. Returns the switch if the root moved.
    pub fn poll(&mut self) -> Option<RootChange> {
        let before = self.current().to_path_buf();

        if let Some(dir) = &self.removable {
            if !self.is_usable(dir) {
                warn!(dir = %dir.display(), "removable medium went away, falling back");
                self.removable = None;
            }
        }
        if self.removable.is_none() {
            self.removable = self.find_removable();
        }

        let after = self.current().to_path_buf();
        if before == after {
            return None;
        }
        info!(from = %before.display(), to = %after.display(), "storage root moved");
        Some(RootChange {
            from: before,
            to: after,
        })
    }

    fn is_usable(&self, dir: &Path) -> bool {
        self.probe.is_mount(dir) && dir.join(&self.marker_file).is_file()
    }

    fn find_removable(&self) -> Option<PathBuf> {
        for search in &self.search_dirs {
            let Ok(entries) = fs::read_dir(search) else {
                continue;
            };
            let mut candidates: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            candidates.sort();
            if let Some(found) = candidates.into_iter().find(|p| self.is_usable(p)) {
                return Some(found);
            }
        }
        None
    }

    // -- Paths under the current root --

    pub fn database_path(&self, db_name: &str) -> PathBuf {
        self.current().join(db_name)
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.current().join("screenshots")
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.current().join("audio")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.screenshots_dir())?;
        fs::create_dir_all(self.audio_dir())?;
        Ok(())
    }

    /// Delete screenshots and audio notes whose filename time falls in
    /// `window`. Files without a parsable timestamp are left alone.
    pub fn purge_media(&self, window: PurgeWindow) -> Result<u64> {
        let mut deleted = 0;
        for dir in [self.screenshots_dir(), self.audio_dir()] {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name();
                let Some(at) = name.to_str().and_then(parse_media_timestamp) else {
                    continue;
                };
                if window.contains(at) {
                    match fs::remove_file(entry.path()) {
                        Ok(()) => deleted += 1,
                        Err(e) => warn!(path = %entry.path().display(), error = %e, "could not delete media file"),
                    }
                }
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Every directory counts as mounted while the flag is set.
    struct FlagProbe(Arc<AtomicBool>);

    impl MountProbe for FlagProbe {
        fn is_mount(&self, _path: &Path) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn setup() -> (tempfile::TempDir, StorageRoot, Arc<AtomicBool>, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("local");
        let media = tmp.path().join("media");
        let stick = media.join("stick");
        fs::create_dir_all(&local).unwrap();
        fs::create_dir_all(&stick).unwrap();
        let mounted = Arc::new(AtomicBool::new(true));
        let root = StorageRoot::new(
            local,
            vec![media],
            "footprint.cfg",
            Box::new(FlagProbe(mounted.clone())),
        );
        (tmp, root, mounted, stick)
    }

    #[test]
    fn test_falls_back_to_local_without_marker() {
        let (tmp, root, _, _) = setup();
        assert!(!root.is_removable());
        assert_eq!(root.current(), tmp.path().join("local"));
        assert_eq!(
            root.database_path("footprint.sqlite"),
            tmp.path().join("local/footprint.sqlite")
        );
    }

    #[test]
    fn test_marker_selects_removable_then_unmount_falls_back() {
        let (tmp, mut root, mounted, stick) = setup();
        fs::write(stick.join("footprint.cfg"), "").unwrap();

        let change = root.poll().unwrap();
        assert_eq!(change.to, stick);
        assert!(root.is_removable());
        assert_eq!(root.screenshots_dir(), stick.join("screenshots"));
        assert!(root.poll().is_none());

        mounted.store(false, Ordering::SeqCst);
        let change = root.poll().unwrap();
        assert_eq!(change.from, stick);
        assert_eq!(change.to, tmp.path().join("local"));
    }

    #[test]
    fn test_missing_search_dirs_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let mut root = StorageRoot::new(
            tmp.path().to_path_buf(),
            vec![tmp.path().join("nope")],
            "footprint.cfg",
            Box::new(DeviceMountProbe),
        );
        assert!(root.poll().is_none());
        assert_eq!(root.current(), tmp.path());
    }

    #[test]
    fn test_purge_media_by_filename_time() {
        let (_tmp, root, _, _) = setup();
        root.ensure_dirs().unwrap();
        let shots = root.screenshots_dir();
        fs::write(shots.join("240101-080000000000.jpg"), b"old").unwrap();
        fs::write(shots.join("240101-120000000000_5_5.jpg"), b"new").unwrap();
        fs::write(shots.join("readme.txt"), b"keep").unwrap();
        fs::write(root.audio_dir().join("240101-070000000000.m4a"), b"old").unwrap();

        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let deleted = root.purge_media(PurgeWindow::OlderThan(cutoff)).unwrap();
        assert_eq!(deleted, 2);
        assert!(shots.join("240101-120000000000_5_5.jpg").exists());
        assert!(shots.join("readme.txt").exists());
    }
}
