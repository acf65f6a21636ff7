//! Host-side operations on the target tree.
//!
//! Everything here works on a plain directory: extracting a prebuilt base
//! into it, editing files under `/etc`, filtering and cleaning paths, and
//! packing the result. Nothing in this module enters the chroot.

pub mod edit;
pub mod sources;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::capacity::image;
use crate::layer::base::TAR_PATTERN;
use crate::layer::BaseRef;
use crate::process::Cmd;

pub use edit::{append_mounts, apply_cleanup, apply_include, set_hostname};
pub use sources::{restore_sources, rewrite_sources, SourcesBackup};

/// Archive flags shared by extraction and compression.
const TAR_PRESERVE_ARGS: [&str; 4] = ["-p", "--same-owner", "--numeric-owner", "--xattrs"];

/// Suffix of the compressed tree output.
pub const TARBALL_SUFFIX: &str = ".tar.bz2";

/// Populate `tree` from a prebuilt base.
///
/// Layer bases are built by the builder, not extracted; they are a no-op here.
pub fn extract_base(base: &BaseRef, tree: &Path, mount_dir: &Path, work_dir: &Path) -> Result<()> {
    fs::create_dir_all(tree).with_context(|| format!("Failed to create {}", tree.display()))?;

    match base {
        BaseRef::Layer(_) => {}
        BaseRef::Directory(dir) => {
            tracing::info!("Copying base directory {}", dir.display());
            Cmd::new("cp")
                .arg("-a")
                .arg(format!("{}/.", dir.display()))
                .arg_path(tree)
                .error_msg(format!("Failed to copy base {}", dir.display()))
                .run()?;
        }
        BaseRef::Tarball(tarball) => {
            tracing::info!("Extracting base tarball {}", tarball.display());
            extract_tarball(tarball, tree, true)?;
        }
        BaseRef::Image(img) => {
            tracing::info!("Copying base image {}", img.display());
            let img = unpack_image(img, work_dir)?;
            image::extract_image(&img, tree, mount_dir)?;
        }
    }
    Ok(())
}

/// `tar -xf`, compression detected by tar.
fn extract_tarball(tarball: &Path, dest: &Path, preserve: bool) -> Result<()> {
    let mut cmd = Cmd::new("tar");
    if preserve {
        cmd = cmd.args(TAR_PRESERVE_ARGS);
    }
    cmd.arg("-xf")
        .arg_path(tarball)
        .arg("-C")
        .arg_path(dest)
        .error_msg(format!("Failed to extract {}", tarball.display()))
        .run()?;
    Ok(())
}

/// For `<name>.img.tar*` bases, unpack into `work_dir` and return the image path.
fn unpack_image(img: &Path, work_dir: &Path) -> Result<PathBuf> {
    let raw = img.to_string_lossy();
    if !TAR_PATTERN.is_match(&raw) {
        return Ok(img.to_path_buf());
    }

    fs::create_dir_all(work_dir)?;
    extract_tarball(img, work_dir, false)?;
    let name = img
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = match name.find(".tar") {
        Some(idx) => &name[..idx],
        None => name.as_str(),
    };
    Ok(work_dir.join(stem))
}

/// Pack the tree into `<output>.tar.bz2`.
pub fn compress_tree(tree: &Path, output: &Path) -> Result<PathBuf> {
    let dest = PathBuf::from(format!("{}{}", output.display(), TARBALL_SUFFIX));
    tracing::info!("Compressing {} to {}", tree.display(), dest.display());
    Cmd::new("tar")
        .args(TAR_PRESERVE_ARGS)
        .arg("-j")
        .arg("-C")
        .arg_path(tree)
        .arg("-cf")
        .arg_path(&dest)
        .arg(".")
        .error_msg("Failed to compress the target tree")
        .run()?;
    Ok(dest)
}

/// Apparent size of the tree in bytes, per `du`.
///
/// Only used to cross-check the ledger, so a failing `du` yields `None`.
pub fn measure_tree(tree: &Path) -> Option<u64> {
    let result = Cmd::new("du")
        .args(["-s", "--block-size=1"])
        .arg_path(tree)
        .advisory()
        .run()
        .ok()?;
    if !result.success() {
        return None;
    }
    parse_du(result.stdout_trimmed())
}

fn parse_du(output: &str) -> Option<u64> {
    output.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_du_output() {
        assert_eq!(parse_du("40960\t/w/targetfs"), Some(40960));
        assert_eq!(parse_du(""), None);
        assert_eq!(parse_du("du: cannot access"), None);
    }

    #[test]
    fn test_directory_base_is_copied() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("base");
        fs::create_dir_all(base.join("etc")).unwrap();
        fs::write(base.join("etc/os-release"), "ID=test\n").unwrap();
        let tree = temp.path().join("tree");

        extract_base(
            &BaseRef::Directory(base),
            &tree,
            &temp.path().join("mnt"),
            temp.path(),
        )
        .unwrap();
        assert_eq!(fs::read_to_string(tree.join("etc/os-release")).unwrap(), "ID=test\n");
    }

    #[test]
    fn test_layer_base_leaves_tree_alone() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("tree");
        extract_base(
            &BaseRef::Layer(temp.path().join("parent.json")),
            &tree,
            &temp.path().join("mnt"),
            temp.path(),
        )
        .unwrap();
        assert!(tree.is_dir());
        assert_eq!(fs::read_dir(&tree).unwrap().count(), 0);
    }

    #[test]
    fn test_plain_image_is_used_in_place() {
        let temp = TempDir::new().unwrap();
        let img = temp.path().join("base.img");
        assert_eq!(unpack_image(&img, temp.path()).unwrap(), img);
    }
}
