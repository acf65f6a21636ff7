//! Edits applied to the tree after content is in place.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::common::{append_file, in_tree, write_file_with_dirs};
use crate::layer::{MountSpec, OrderedMap};

const HOSTNAME_FILE: &str = "/etc/hostname";
const HOSTS_FILE: &str = "/etc/hosts";
const FSTAB_FILE: &str = "/etc/fstab";
const LOCALHOST_IP: &str = "127.0.0.1";

/// Suffix of the pre-filter tree kept next to the tree while including.
pub const PRE_INCLUDE_SUFFIX: &str = ".pre_fs_include";

/// Set `/etc/hostname` and rewrite the loopback lines of `/etc/hosts`.
///
/// Loopback lines for `localhost` and the previous hostname are replaced;
/// every other line is kept in order.
pub fn set_hostname(tree: &Path, hostname: &str) -> Result<()> {
    let hostname_file = in_tree(tree, HOSTNAME_FILE);
    let old = fs::read_to_string(&hostname_file)
        .unwrap_or_default()
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    write_file_with_dirs(&hostname_file, format!("{}\n", hostname))?;

    let hosts_file = in_tree(tree, HOSTS_FILE);
    let entries = fs::read_to_string(&hosts_file).unwrap_or_default();
    let mut hosts = format!("{ip}\tlocalhost\n{ip}\t{hostname}\n", ip = LOCALHOST_IP);
    for line in entries.lines() {
        if !is_loopback_for(line, "localhost") && (old.is_empty() || !is_loopback_for(line, &old)) {
            hosts.push_str(line);
            hosts.push('\n');
        }
    }
    write_file_with_dirs(&hosts_file, hosts)?;

    tracing::info!("Hostname set to '{}'", hostname);
    Ok(())
}

fn is_loopback_for(line: &str, name: &str) -> bool {
    line.strip_prefix(LOCALHOST_IP)
        .map(|rest| rest.trim_start().starts_with(name))
        .unwrap_or(false)
}

/// Append one fstab line per mount, in declaration order.
pub fn append_mounts(tree: &Path, mounts: &OrderedMap<MountSpec>) -> Result<()> {
    if mounts.is_empty() {
        tracing::debug!("No mounts declared, fstab unchanged");
        return Ok(());
    }
    let mut entries = String::new();
    for (mount_point, spec) in mounts.iter() {
        entries.push_str(&format!(
            "\n{}\t{}\t{}\t{}\t0\t2",
            spec.device, mount_point, spec.fs_type, spec.mount_options
        ));
    }
    entries.push('\n');
    append_file(in_tree(tree, FSTAB_FILE), &entries)?;
    tracing::info!("Added {} mount(s) to {}", mounts.len(), FSTAB_FILE);
    Ok(())
}

/// Keep only the listed paths.
///
/// The tree is moved aside and the listed paths are hardlinked back, so
/// ownership and modes survive without copying data. The moved-aside tree
/// is removed once every path is back. Missing paths are an error.
pub fn apply_include(tree: &Path, paths: &[String]) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }

    let mut staged = tree.as_os_str().to_owned();
    staged.push(PRE_INCLUDE_SUFFIX);
    let staged = std::path::PathBuf::from(staged);
    if staged.exists() {
        fs::remove_dir_all(&staged)
            .with_context(|| format!("Failed to clear {}", staged.display()))?;
    }
    fs::rename(tree, &staged)
        .with_context(|| format!("Failed to move {} aside", tree.display()))?;
    fs::create_dir_all(tree)?;

    for path in paths {
        let source = in_tree(&staged, path);
        let dest = in_tree(tree, path);
        if fs::symlink_metadata(&source).is_err() {
            anyhow::bail!("FilesystemInclude path '{}' does not exist in the tree", path);
        }
        link_tree(&source, &dest)
            .with_context(|| format!("Failed to include '{}'", path))?;
    }

    fs::remove_dir_all(&staged)
        .with_context(|| format!("Failed to remove {}", staged.display()))?;
    tracing::info!("Kept {} included path(s)", paths.len());
    Ok(())
}

/// Recreate `source` at `dest`: directories made, files hardlinked,
/// symlinks copied as links.
fn link_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source)?;
        let target = if relative.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(relative)
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            let perms = entry.metadata()?.permissions();
            fs::set_permissions(&target, perms)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)?;
            }
            fs::hard_link(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Remove the listed paths. A trailing `/` removes recursively.
///
/// Failures are logged, not fatal.
pub fn apply_cleanup(tree: &Path, paths: &[String]) {
    for path in paths {
        let target = in_tree(tree, path);
        let removed = if path.ends_with('/') {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_file(&target)
        };
        match removed {
            Ok(()) => tracing::debug!("Removed {}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn test_hostname_rewrites_loopback_lines() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        write_file_with_dirs(in_tree(tree, HOSTNAME_FILE), "old-box\n").unwrap();
        write_file_with_dirs(
            in_tree(tree, HOSTS_FILE),
            "127.0.0.1 localhost\n127.0.0.1\told-box\n10.0.0.5 buildhost\n",
        )
        .unwrap();

        set_hostname(tree, "tegra").unwrap();

        assert_eq!(
            fs::read_to_string(in_tree(tree, HOSTNAME_FILE)).unwrap(),
            "tegra\n"
        );
        assert_eq!(
            fs::read_to_string(in_tree(tree, HOSTS_FILE)).unwrap(),
            "127.0.0.1\tlocalhost\n127.0.0.1\ttegra\n10.0.0.5 buildhost\n"
        );
    }

    #[test]
    fn test_fstab_lines_appended() {
        let temp = TempDir::new().unwrap();
        write_file_with_dirs(in_tree(temp.path(), FSTAB_FILE), "# static\n").unwrap();
        let mounts: OrderedMap<MountSpec> = serde_json::from_value(serde_json::json!({
            "/data": {"Device": "/dev/vdb1", "Type": "ext4", "MountOptions": "defaults"}
        }))
        .unwrap();

        append_mounts(temp.path(), &mounts).unwrap();
        assert_eq!(
            fs::read_to_string(in_tree(temp.path(), FSTAB_FILE)).unwrap(),
            "# static\n\n/dev/vdb1\t/data\text4\tdefaults\t0\t2\n"
        );
    }

    #[test]
    fn test_include_keeps_only_listed_paths() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("targetfs");
        write_file_with_dirs(tree.join("etc/keep.conf"), "k").unwrap();
        write_file_with_dirs(tree.join("usr/lib/libx.so"), "x").unwrap();
        write_file_with_dirs(tree.join("var/cache/junk"), "j").unwrap();
        std::os::unix::fs::symlink("libx.so", tree.join("usr/lib/libx.so.1")).unwrap();
        let original = fs::metadata(tree.join("etc/keep.conf")).unwrap();

        apply_include(&tree, &["/etc/keep.conf".into(), "/usr/lib/".into()]).unwrap();

        assert!(tree.join("etc/keep.conf").is_file());
        assert!(tree.join("usr/lib/libx.so").is_file());
        assert_eq!(
            fs::read_link(tree.join("usr/lib/libx.so.1")).unwrap(),
            std::path::PathBuf::from("libx.so")
        );
        assert!(!tree.join("var").exists());

        let kept = fs::metadata(tree.join("etc/keep.conf")).unwrap();
        assert_eq!(kept.ino(), original.ino());
        assert!(!temp.path().join("targetfs.pre_fs_include").exists());
    }

    #[test]
    fn test_include_missing_path_fails() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("targetfs");
        fs::create_dir_all(&tree).unwrap();
        assert!(apply_include(&tree, &["/nope".into()]).is_err());
    }

    #[test]
    fn test_cleanup_removes_files_and_trees() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path();
        write_file_with_dirs(tree.join("tmp/build.log"), "l").unwrap();
        write_file_with_dirs(tree.join("var/cache/apt/pkg.bin"), "p").unwrap();
        write_file_with_dirs(tree.join("etc/motd"), "m").unwrap();

        apply_cleanup(
            tree,
            &[
                "/tmp/build.log".into(),
                "/var/cache/apt/".into(),
                "/does/not/exist".into(),
            ],
        );

        assert!(!tree.join("tmp/build.log").exists());
        assert!(!tree.join("var/cache/apt").exists());
        assert!(tree.join("etc/motd").exists());
    }
}
