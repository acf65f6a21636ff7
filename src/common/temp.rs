//! Utilities for managing build work directories.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Prepare a work directory, removing it if it exists and creating it fresh.
pub fn prepare_work_dir(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)
            .with_context(|| format!("Failed to clear {}", path.display()))?;
    }
    fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(())
}

/// Remove a work directory tree. Missing directories are fine.
pub fn cleanup_work_dir(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_clears_previous_contents() {
        let temp = tempfile::TempDir::new().unwrap();
        let work = temp.path().join("work");
        fs::create_dir_all(work.join("stale")).unwrap();
        prepare_work_dir(&work).unwrap();
        assert!(work.is_dir());
        assert!(!work.join("stale").exists());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let temp = tempfile::TempDir::new().unwrap();
        let work = temp.path().join("work");
        fs::create_dir_all(&work).unwrap();
        cleanup_work_dir(&work);
        cleanup_work_dir(&work);
        assert!(!work.exists());
    }
}
