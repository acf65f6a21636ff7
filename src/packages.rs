//! Package manager adapter.
//!
//! Installation goes through two helper scripts run inside the target:
//! `generate_manifest.sh` pins the requested names to exact versions, and
//! `install_packages.sh` installs them, optionally writing a metadata
//! document with per-package size, dependencies and files.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::in_tree;
use crate::layer::IdValue;
use crate::target::Chroot;

pub const GENERATE_HELPER: &str = "generate_manifest.sh";
pub const INSTALL_HELPER: &str = "install_packages.sh";

const PKGLIST_CONFIG: &str = "/tmp/pkglist.debCONFIG";
const PKGLIST_MANIFEST: &str = "/tmp/pkglist.debMANIFEST";
const PACKAGE_RECORD: &str = "/tmp/debPackagesRecord.txt";

/// `dpkg-query` format producing `name=version` lines.
const QUERY_FORMAT: &str = "${Package}=${Version}\\n";

/// One installed package as reported by the install helper.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstalledPackage {
    /// Installed-Size in KiB, when dpkg reports one.
    #[serde(default)]
    pub size: Option<IdValue>,
    /// Raw `Depends:` field.
    #[serde(default)]
    pub depends: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl InstalledPackage {
    pub fn size_kib(&self) -> Option<u64> {
        self.size.as_ref().and_then(IdValue::as_number)
    }
}

/// Metadata document written by the install helper.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageMetadata {
    #[serde(default)]
    pub installed_packages: BTreeMap<String, InstalledPackage>,
    /// Packages already present in the base before this layer.
    #[serde(default)]
    pub base_packages: Vec<String>,
}

impl PackageMetadata {
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("Malformed package metadata document")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&text)
    }

    pub fn is_base(&self, name: &str) -> bool {
        self.base_packages.iter().any(|p| p == name)
    }
}

/// Parse `name=version` lines, skipping blanks.
pub fn parse_query(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn copy_helper(helpers_dir: &Path, name: &str, tree: &Path) -> Result<PathBuf> {
    let source = helpers_dir.join(name);
    let dest = in_tree(tree, "/tmp").join(name);
    fs::create_dir_all(in_tree(tree, "/tmp"))?;
    fs::copy(&source, &dest)
        .with_context(|| format!("Failed to copy helper {} into target", source.display()))?;
    Ok(dest)
}

/// Pin `names` to the versions the target's package sources would install.
pub fn generate_manifest(chroot: &mut Chroot, helpers_dir: &Path, names: &[&str]) -> Result<Vec<String>> {
    let tree = chroot.root().to_path_buf();
    let config = in_tree(&tree, PKGLIST_CONFIG);
    let mut listing = names.join("\n");
    listing.push('\n');
    crate::common::write_file_with_dirs(&config, listing)?;

    let helper = copy_helper(helpers_dir, GENERATE_HELPER, &tree)?;
    let script = format!("/tmp/{}", GENERATE_HELPER);
    chroot.run_interactive(&script, [PKGLIST_CONFIG])?;

    let manifest_path = in_tree(&tree, PKGLIST_MANIFEST);
    let text = fs::read_to_string(&manifest_path)
        .with_context(|| format!("{} did not produce {}", GENERATE_HELPER, PKGLIST_MANIFEST))?;
    let pinned = parse_query(&text);
    tracing::info!("Pinned {} packages", pinned.len());

    remove_quietly(&config);
    remove_quietly(&manifest_path);
    remove_quietly(&helper);
    Ok(pinned)
}

/// Install a pinned set from [`generate_manifest`].
///
/// With `record`, the helper also writes the metadata document, which is
/// returned parsed.
pub fn install(
    chroot: &mut Chroot,
    helpers_dir: &Path,
    pinned: &[String],
    record: bool,
) -> Result<Option<PackageMetadata>> {
    let tree = chroot.root().to_path_buf();
    let mut listing = pinned.join("\n");
    listing.push('\n');
    crate::common::write_file_with_dirs(&in_tree(&tree, PKGLIST_MANIFEST), listing)?;

    let helper = copy_helper(helpers_dir, INSTALL_HELPER, &tree)?;
    let script = format!("/tmp/{}", INSTALL_HELPER);

    let mut args = vec![PKGLIST_MANIFEST];
    if record {
        args.push(PACKAGE_RECORD);
    }
    chroot.run_interactive(&script, args)?;

    let metadata = if record {
        let record_path = in_tree(&tree, PACKAGE_RECORD);
        let metadata = PackageMetadata::load(&record_path)?;
        remove_quietly(&record_path);
        Some(metadata)
    } else {
        None
    };

    remove_quietly(&helper);
    remove_quietly(&in_tree(&tree, PKGLIST_MANIFEST));
    chroot.run("apt-get", ["clean"])?;
    Ok(metadata)
}

/// Installed packages as `name=version`, in dpkg order.
pub fn installed_packages(chroot: &mut Chroot) -> Result<Vec<String>> {
    let result = chroot.run("dpkg-query", ["-Wf", QUERY_FORMAT])?;
    Ok(parse_query(&result.stdout))
}

/// Write `dpkg -l` of the target to `dest`.
///
/// Skipped when the tree has no apt sources list: there is no package
/// database worth listing.
pub fn write_listing(chroot: &mut Chroot, dest: &Path) -> Result<bool> {
    if !in_tree(chroot.root(), "/etc/apt/sources.list").exists() {
        tracing::debug!("No apt sources in target, skipping package listing");
        return Ok(false);
    }
    let result = chroot.run("dpkg", ["-l"])?;
    crate::common::write_file_with_dirs(dest, &result.stdout)?;
    tracing::info!("Wrote package listing {}", dest.display());
    Ok(true)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
