//! File helpers shared by the rootfs, ledger and manifest code.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Write a file, creating parent directories as needed.
pub fn write_file_with_dirs<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Append to a file, creating it (and its parents) when missing.
pub fn append_file<P: AsRef<Path>>(path: P, content: &str) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to append to {}", path.display()))?;
    Ok(())
}

/// Map a target-absolute path (`/etc/fstab`) into the tree rooted at `root`.
///
/// `..` components are dropped so the result never escapes the tree.
pub fn in_tree(root: &Path, target_path: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in Path::new(target_path).components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

/// SHA-256 of a file's content, hex encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let content = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(format!("{:x}", Sha256::digest(&content)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_tree_strips_root_and_parent_components() {
        let root = Path::new("/work/targetfs");
        assert_eq!(in_tree(root, "/etc/fstab"), root.join("etc/fstab"));
        assert_eq!(in_tree(root, "../../etc/passwd"), root.join("etc/passwd"));
        assert_eq!(in_tree(root, "var/log/"), root.join("var/log"));
    }

    #[test]
    fn test_append_creates_missing_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("etc/fstab");
        append_file(&path, "a\n").unwrap();
        append_file(&path, "b\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    #[test]
    fn test_sha256_changes_with_content() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("sources.list");
        fs::write(&path, "deb http://a stable main\n").unwrap();
        let first = sha256_file(&path).unwrap();
        fs::write(&path, "deb http://b stable main\n").unwrap();
        assert_ne!(first, sha256_file(&path).unwrap());
        assert_eq!(first.len(), 64);
    }
}
