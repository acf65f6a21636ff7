//! Work directories of one build graph.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::common::{cleanup_work_dir, prepare_work_dir};
use crate::config::BuildConfig;
use crate::rootfs::edit::PRE_INCLUDE_SUFFIX;

/// Scratch space of one graph: the work dir, the target tree every chain
/// layer builds into, and a mount point for images.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub work_dir: PathBuf,
    pub tree: PathBuf,
    pub mount_dir: PathBuf,
    keep: bool,
}

impl Workspace {
    pub fn new(config: &BuildConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            tree: config.fs_work_dir.clone(),
            mount_dir: config.mount_dir(),
            keep: config.keep_workdir,
        }
    }

    /// Start from empty directories.
    pub fn prepare(&self) -> Result<()> {
        prepare_work_dir(&self.work_dir)?;
        if !self.tree.starts_with(&self.work_dir) {
            prepare_work_dir(&self.tree)?;
        } else {
            std::fs::create_dir_all(&self.tree)?;
        }
        tracing::debug!("Prepared workspace {}", self.work_dir.display());
        Ok(())
    }

    /// Tree moved aside by `FilesystemInclude`; only left behind when
    /// including failed part way.
    fn staged_tree(&self) -> PathBuf {
        let mut name = self.tree.as_os_str().to_owned();
        name.push(PRE_INCLUDE_SUFFIX);
        PathBuf::from(name)
    }

    /// Remove everything, unless the workspace is to be kept.
    pub fn cleanup(&self) {
        if self.keep {
            tracing::info!("Keeping workspace {}", self.work_dir.display());
            return;
        }
        for dir in [self.tree.clone(), self.staged_tree(), self.work_dir.clone()] {
            remove(&dir);
        }
    }
}

fn remove(dir: &Path) {
    if dir.exists() {
        cleanup_work_dir(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildOptions, Environment};
    use std::fs;
    use tempfile::TempDir;

    fn config(output: &Path, keep: bool) -> BuildConfig {
        let mut options = BuildOptions::new(output);
        options.keep_workdir = keep;
        BuildConfig::new(options, Environment::default()).unwrap()
    }

    #[test]
    fn test_prepare_and_cleanup() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(&config(temp.path(), false));
        ws.prepare().unwrap();
        assert!(ws.tree.is_dir());
        fs::write(ws.tree.join("leftover"), "x").unwrap();

        ws.cleanup();
        assert!(!ws.work_dir.exists());
    }

    #[test]
    fn test_kept_workspace_survives() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(&config(temp.path(), true));
        ws.prepare().unwrap();
        ws.cleanup();
        assert!(ws.tree.is_dir());
    }
}
