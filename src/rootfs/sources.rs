//! Temporary apt sources for the build.
//!
//! The tree's `sources.list` is moved aside and replaced with the layer's
//! mirrors while packages install. It is put back afterwards only if nothing
//! rewrote it in the meantime; a package or placement entry that changed it
//! on purpose keeps its version.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::{in_tree, sha256_file, write_file_with_dirs};
use crate::layer::MirrorEntry;

pub const SOURCES_LIST: &str = "/etc/apt/sources.list";
const BACKUP_SUFFIX: &str = ".backup";

/// Proof that the sources were rewritten, with the digest written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcesBackup {
    pub digest: String,
}

fn backup_path(list: &Path) -> PathBuf {
    let mut name = list.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Render mirrors as `sources.list` lines.
pub fn render(mirrors: &[MirrorEntry]) -> String {
    mirrors
        .iter()
        .map(|mirror| format!("{}\n", mirror.path()))
        .collect()
}

/// Replace the tree's sources with `mirrors`.
///
/// Trees without a sources list (non-Debian bases) are left untouched.
pub fn rewrite_sources(tree: &Path, mirrors: &[MirrorEntry]) -> Result<Option<SourcesBackup>> {
    let list = in_tree(tree, SOURCES_LIST);
    if !list.exists() {
        tracing::debug!("No {} in tree, not rewriting sources", SOURCES_LIST);
        return Ok(None);
    }

    fs::rename(&list, backup_path(&list))
        .with_context(|| format!("Failed to back up {}", list.display()))?;
    write_file_with_dirs(&list, render(mirrors))?;
    let digest = sha256_file(&list)?;
    tracing::info!("Rewrote apt sources with {} mirror(s)", mirrors.len());
    Ok(Some(SourcesBackup { digest }))
}

/// Put the original sources back if the rewritten list is unchanged.
pub fn restore_sources(tree: &Path, backup: &SourcesBackup) -> Result<bool> {
    let list = in_tree(tree, SOURCES_LIST);
    if !list.exists() {
        return Ok(false);
    }
    if sha256_file(&list)? != backup.digest {
        tracing::info!("Not restoring {}: modified since backup", SOURCES_LIST);
        return Ok(false);
    }
    fs::rename(backup_path(&list), &list)
        .with_context(|| format!("Failed to restore {}", list.display()))?;
    Ok(true)
}
