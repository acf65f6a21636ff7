//! Image creation and population with the host e2fsprogs.

use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use super::ImagePlan;
use crate::process::Cmd;

/// Disables checksums older target kernels cannot read.
const BACKWARDS_COMPAT_FEATURES: &str = "^metadata_csum";

/// Version reported by `e2fsck -V` (printed on stderr), if any.
pub fn e2fsprogs_version() -> Option<String> {
    match Cmd::new("e2fsck").arg("-V").advisory().run() {
        Ok(result) => parse_e2fsprogs_version(&result.stderr),
        Err(e) => {
            tracing::warn!("Could not query e2fsprogs version: {:#}", e);
            None
        }
    }
}

static E2FSPROGS_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"version\s*([0-9][0-9.]*)").expect("version pattern is valid"));

pub fn parse_e2fsprogs_version(output: &str) -> Option<String> {
    E2FSPROGS_VERSION
        .captures(output)
        .map(|caps| caps[1].trim_end_matches('.').to_string())
}

/// True when `version` is newer than 1.43, where metadata_csum became default.
pub fn needs_compat_features(version: &str) -> bool {
    let parts: Vec<u64> = version
        .split('.')
        .filter_map(|p| p.parse().ok())
        .collect();
    parts > vec![1, 43]
}

/// mke2fs arguments for `plan`, ending with the image path.
pub fn mke2fs_args(plan: &ImagePlan, image: &Path, e2fs_version: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-t".to_string(),
        "ext4".to_string(),
        "-i".to_string(),
        plan.category.inode_ratio.to_string(),
        "-J".to_string(),
        format!("size={}", plan.journal_size_mib()),
        "-I".to_string(),
        plan.category.inode_size.to_string(),
        "-b".to_string(),
        plan.block_size().to_string(),
        "-F".to_string(),
    ];
    if e2fs_version.is_some_and(needs_compat_features) {
        args.push("-O".to_string());
        args.push(BACKWARDS_COMPAT_FEATURES.to_string());
    }
    args.push(image.to_string_lossy().into_owned());
    args
}

/// Allocate the image and format it.
pub fn create_image(plan: &ImagePlan, image: &Path) -> Result<()> {
    tracing::info!(
        "Creating {} ({} blocks of {}B, category '{}')",
        image.display(),
        plan.total_blocks,
        plan.block_size(),
        plan.category.usage
    );

    Cmd::new("dd")
        .arg("if=/dev/zero")
        .arg(format!("of={}", image.display()))
        .arg(format!("bs={}", plan.block_size()))
        .arg(format!("count={}", plan.total_blocks))
        .error_msg("dd failed to allocate the image")
        .run()?;

    let version = e2fsprogs_version();
    if let Some(ref v) = version {
        tracing::info!("e2fsprogs version {}", v);
    }

    Cmd::new("mke2fs")
        .args(mke2fs_args(plan, image, version.as_deref()))
        .error_msg("mke2fs failed")
        .run()?;
    Ok(())
}

/// Copy `tree` into a formatted image through a loop mount.
pub fn populate_image(image: &Path, tree: &Path, mount_dir: &Path) -> Result<()> {
    fs::create_dir_all(mount_dir)
        .with_context(|| format!("Failed to create {}", mount_dir.display()))?;
    copy_through_mount(image, mount_dir, &format!("{}/.", tree.display()), &mount_dir.to_string_lossy())
}

/// Copy the content of a base image into `tree`.
pub fn extract_image(image: &Path, tree: &Path, mount_dir: &Path) -> Result<()> {
    fs::create_dir_all(mount_dir)
        .with_context(|| format!("Failed to create {}", mount_dir.display()))?;
    copy_through_mount(
        image,
        mount_dir,
        &format!("{}/.", mount_dir.display()),
        &tree.to_string_lossy(),
    )
}

fn copy_through_mount(image: &Path, mount_dir: &Path, from: &str, to: &str) -> Result<()> {
    Cmd::new("mount")
        .arg_path(image)
        .arg_path(mount_dir)
        .error_msg(format!("Failed to mount {}", image.display()))
        .run()?;

    let copied = Cmd::new("cp").args(["-a", from, to]).run();

    // Unmount even when the copy failed; the copy error wins.
    let unmounted = Cmd::new("umount").arg_path(mount_dir).run();
    copied?;
    unmounted?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::{plan, DEFAULT_RESERVE_PERCENT};
    use std::path::PathBuf;

    #[test]
    fn test_parse_version_from_e2fsck_banner() {
        let banner = "e2fsck 1.46.5 (30-Dec-2021)\n\tUsing EXT2FS Library version 1.46.5, 30-Dec-2021\n";
        assert_eq!(parse_e2fsprogs_version(banner).as_deref(), Some("1.46.5"));
        assert_eq!(parse_e2fsprogs_version("garbage"), None);
    }

    #[test]
    fn test_compat_features_only_after_1_43() {
        assert!(!needs_compat_features("1.42.9"));
        assert!(!needs_compat_features("1.43"));
        assert!(needs_compat_features("1.43.4"));
        assert!(needs_compat_features("1.47.0"));
    }

    #[test]
    fn test_mke2fs_args() {
        let plan = plan(1000, 1_073_741_824, DEFAULT_RESERVE_PERCENT).unwrap();
        let image = PathBuf::from("/out/rootfs.img");

        let args = mke2fs_args(&plan, &image, Some("1.46.5"));
        assert_eq!(
            args.join(" "),
            "-t ext4 -i 16384 -J size=32 -I 256 -b 4096 -F -O ^metadata_csum /out/rootfs.img"
        );

        let args = mke2fs_args(&plan, &image, None);
        assert_eq!(
            args.join(" "),
            "-t ext4 -i 16384 -J size=32 -I 256 -b 4096 -F /out/rootfs.img"
        );
    }
}
