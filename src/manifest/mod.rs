//! Frozen manifests.
//!
//! After a layer is built, its document is merged onto the parent's frozen
//! manifest ([`merge::freeze`]) and written to the output directory. A copy
//! is published inside the tree so a later build extending this tree as an
//! image can find it.

pub mod merge;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::{in_tree, write_file_with_dirs};
pub use merge::{freeze, ParentManifest};

/// In-tree directory holding the published manifest.
pub const MANIFEST_DIR: &str = "/etc/layerfs/manifest";

/// Fixed name pointing at the freshest published manifest.
pub const MANIFEST_LINK: &str = "layerfs-rfs.MANIFEST.json";

pub fn manifest_file_name(output: &str) -> String {
    format!("{}.MANIFEST.json", output)
}

/// Pretty-printed with four-space indentation.
pub fn to_json(doc: &Map<String, Value>) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    doc.serialize(&mut serializer)
        .context("Failed to serialize manifest")?;
    buf.push(b'\n');
    String::from_utf8(buf).context("Manifest is not valid UTF-8")
}

pub fn write(doc: &Map<String, Value>, path: &Path) -> Result<()> {
    write_file_with_dirs(path, to_json(doc)?)
        .with_context(|| format!("Failed to write manifest {}", path.display()))?;
    tracing::info!("Wrote manifest {}", path.display());
    Ok(())
}

pub fn load(path: &Path) -> Result<Map<String, Value>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    match serde_json::from_str::<Value>(&text)
        .with_context(|| format!("Manifest {} is not valid JSON", path.display()))?
    {
        Value::Object(doc) => Ok(doc),
        _ => anyhow::bail!("Manifest {} is not a JSON object", path.display()),
    }
}

/// Copy `manifest` into the tree, replacing earlier published manifests,
/// and point [`MANIFEST_LINK`] at it.
pub fn publish(tree: &Path, manifest: &Path) -> Result<PathBuf> {
    let dir = in_tree(tree, MANIFEST_DIR);
    if dir.exists() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let removed = if path.is_dir() && !path.is_symlink() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let name = manifest
        .file_name()
        .with_context(|| format!("Manifest path {} has no file name", manifest.display()))?;
    let dest = dir.join(name);
    fs::copy(manifest, &dest)
        .with_context(|| format!("Failed to publish manifest into {}", dir.display()))?;
    std::os::unix::fs::symlink(name, dir.join(MANIFEST_LINK))
        .with_context(|| format!("Failed to link {}", MANIFEST_LINK))?;

    tracing::debug!("Published manifest at {}", dest.display());
    Ok(dest)
}

/// The manifest a prebuilt tree carries, if any.
///
/// Follows [`MANIFEST_LINK`] when present, else takes the first manifest by
/// name.
pub fn find_published(tree: &Path) -> Option<PathBuf> {
    let dir = in_tree(tree, MANIFEST_DIR);
    if let Ok(target) = fs::read_link(dir.join(MANIFEST_LINK)) {
        let resolved = match target.file_name() {
            Some(name) => dir.join(name),
            None => dir.join(target),
        };
        if resolved.is_file() {
            return Some(resolved);
        }
    }

    let mut candidates: Vec<PathBuf> = fs::read_dir(&dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && !path.is_symlink())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}
