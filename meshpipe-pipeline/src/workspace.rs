//! Scratch directory scope for one request

use crate::error::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Exclusive scratch root for a single request.
///
/// The root is emptied on [`Workspace::acquire`] and again on release.
/// Dropping the value without calling [`Workspace::release`] clears it too,
/// so error paths cannot leave files behind.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    counter: AtomicU64,
    released: bool,
}

impl Workspace {
    /// Create the root if needed and remove everything inside it
    pub fn acquire(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let failed = clear_dir(&root);
        debug!(root = %root.display(), failed, "Workspace acquired");
        Ok(Self {
            root,
            counter: AtomicU64::new(0),
            released: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fresh path under the root; nothing is created
    pub fn temp_file(&self, suffix: &str) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!("tmp_{}_{n:04}{suffix}", std::process::id()))
    }

    /// Create (if needed) and return a subdirectory of the root
    pub fn subdir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Where the processing log is written before archiving
    pub fn log_file(&self) -> PathBuf {
        self.root.join("logs").join("processing.log")
    }

    /// Empty the root. Returns the number of entries that could not be removed.
    pub fn release(mut self) -> usize {
        self.released = true;
        let failed = clear_dir(&self.root);
        debug!(root = %self.root.display(), failed, "Workspace released");
        failed
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            clear_dir(&self.root);
        }
    }
}

fn clear_dir(root: &Path) -> usize {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "Cannot list workspace");
            return 1;
        }
    };
    let mut failed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let removed = match entry.file_type() {
            Ok(t) if t.is_dir() => std::fs::remove_dir_all(&path),
            _ => std::fs::remove_file(&path),
        };
        if let Err(e) = removed {
            warn!(path = %path.display(), error = %e, "Failed to remove workspace entry");
            failed += 1;
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_clears_previous_request() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("temp");
        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::write(root.join("stale.obj"), "v 0 0 0").unwrap();
        std::fs::write(root.join("nested").join("tex.png"), [0u8; 4]).unwrap();

        let ws = Workspace::acquire(&root).unwrap();
        assert_eq!(std::fs::read_dir(ws.root()).unwrap().count(), 0);
    }

    #[test]
    fn test_release_empties_root() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::acquire(dir.path().join("temp")).unwrap();
        let file = ws.temp_file(".obj");
        std::fs::write(&file, "v 0 0 0").unwrap();
        ws.subdir("input").unwrap();

        let root = ws.root().to_path_buf();
        assert_eq!(ws.release(), 0);
        assert!(root.is_dir());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn test_drop_clears_on_error_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("temp");
        let run = || -> Result<()> {
            let ws = Workspace::acquire(&root)?;
            std::fs::write(ws.temp_file(".glb"), [1u8, 2, 3])?;
            Err(crate::error::PipelineError::Exhausted("boom".into()))
        };
        assert!(run().is_err());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn test_temp_files_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::acquire(dir.path()).unwrap();
        let a = ws.temp_file(".done");
        let b = ws.temp_file(".done");
        assert_ne!(a, b);
        assert!(a.starts_with(ws.root()));
        assert_eq!(a.extension().and_then(|e| e.to_str()), Some("done"));
    }
}
