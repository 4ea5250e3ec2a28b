//! Scoped temp-file registry
//!
//! Collects the ephemeral files and directories created during a run (job
//! scripts, markers, the work-item list) and deletes them when the scope is
//! closed or dropped. Setting `keep` preserves everything for debugging.
//!
//! Backed by a `DashSet` so runner workers can register concurrently.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashSet;
use tracing::{debug, warn};

/// Registry of temporary paths owned by one orchestration scope
#[derive(Debug, Default)]
pub struct TempFileRegistry {
    paths: DashSet<PathBuf>,
    keep: bool,
    closed: AtomicBool,
}

impl TempFileRegistry {
    /// Create a registry that deletes its paths on close
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry; `keep = true` preserves all paths on close
    pub fn with_keep(keep: bool) -> Self {
        Self {
            paths: DashSet::new(),
            keep,
            closed: AtomicBool::new(false),
        }
    }

    pub fn keep(&self) -> bool {
        self.keep
    }

    /// Register a path for deletion at scope exit
    pub fn add(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        debug!(path = %path.display(), "registered temp path");
        self.paths.insert(path);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Snapshot of the registered paths, sorted
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.paths.iter().map(|p| p.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Delete every registered path (unless `keep`) and close the scope.
    ///
    /// Idempotent: a second call (or the drop that follows) does nothing.
    /// Returns the number of paths removed.
    pub fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }

        if self.keep {
            debug!(count = self.paths.len(), "keeping temp files");
            return 0;
        }

        let mut removed = 0;
        for path in self.paths() {
            match remove_path(&path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temp path"),
            }
            self.paths.remove(&path);
        }
        debug!(removed, "temp files cleaned up");
        removed
    }
}

impl Drop for TempFileRegistry {
    fn drop(&mut self) {
        self.close();
    }
}

/// Remove a file or directory; `Ok(false)` when it was already gone
fn remove_path(path: &Path) -> std::io::Result<bool> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, "x").unwrap();
        p
    }

    #[test]
    fn close_removes_files_and_directories() {
        let dir = TempDir::new().unwrap();
        let file = touch(dir.path(), "script.sh");
        let sub = dir.path().join("scratch");
        std::fs::create_dir(&sub).unwrap();
        touch(&sub, "inner.txt");

        let registry = TempFileRegistry::new();
        registry.add(&file);
        registry.add(&sub);

        assert_eq!(registry.close(), 2);
        assert!(!file.exists());
        assert!(!sub.exists());
        assert!(registry.is_empty());
    }

    #[test]
    fn missing_paths_are_ignored() {
        let dir = TempDir::new().unwrap();
        let registry = TempFileRegistry::new();
        registry.add(dir.path().join("never-created.done"));
        assert_eq!(registry.close(), 0);
    }

    #[test]
    fn keep_preserves_everything() {
        let dir = TempDir::new().unwrap();
        let file = touch(dir.path(), "marker.done");

        let registry = TempFileRegistry::with_keep(true);
        registry.add(&file);
        assert_eq!(registry.close(), 0);
        drop(registry);

        assert!(file.exists());
    }

    #[test]
    fn with_keep_false_starts_open_and_empty() {
        let dir = TempDir::new().unwrap();
        let file = touch(dir.path(), "script.sh");

        let registry = TempFileRegistry::with_keep(false);
        assert!(!registry.keep());
        assert!(registry.is_empty());
        registry.add(&file);
        assert_eq!(registry.close(), 1);
        assert!(!file.exists());
    }

    #[test]
    fn drop_cleans_up() {
        let dir = TempDir::new().unwrap();
        let file = touch(dir.path(), "list.json");
        {
            let registry = TempFileRegistry::new();
            registry.add(&file);
        }
        assert!(!file.exists());
    }

    #[test]
    fn close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let file = touch(dir.path(), "a");
        let registry = TempFileRegistry::new();
        registry.add(&file);
        assert_eq!(registry.close(), 1);

        // Paths added after close are left alone
        let late = touch(dir.path(), "b");
        registry.add(&late);
        assert_eq!(registry.close(), 0);
        drop(registry);
        assert!(late.exists());
    }

    #[test]
    fn concurrent_adds_are_not_lost() {
        let registry = Arc::new(TempFileRegistry::with_keep(true));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        registry.add(format!("/tmp/batchpipe-{}-{}", t, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 800);
    }
}
