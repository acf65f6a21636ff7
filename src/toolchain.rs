//! The builder's view of external collaborators.
//!
//! Everything that runs another program or needs root goes through
//! [`Toolchain`]: base extraction, chroot work, the placement tool, tar and
//! the image tools. [`HostToolchain`] is the real implementation. Tests
//! substitute a recording fake and exercise the builder's ordering without
//! mounts or package managers.

use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::accounts;
use crate::capacity::{image, ImagePlan};
use crate::common::in_tree;
use crate::config::ToolPaths;
use crate::layer::{BaseRef, LayerConfig};
use crate::packages::{self, PackageMetadata};
use crate::placement::PlacementInvocation;
use crate::rootfs;
use crate::scripts::{self, ScriptRun};
use crate::target::Chroot;

/// Present in any tree with a package database.
const DPKG_STATUS: &str = "/var/lib/dpkg/status";

pub trait Toolchain {
    /// Populate `tree` from a prebuilt base.
    fn extract_base(&mut self, base: &BaseRef, tree: &Path, mount_dir: &Path, work_dir: &Path) -> Result<()>;

    fn run_script(&mut self, script: &ScriptRun, tree: &Path, work_dir: &Path) -> Result<()>;

    /// Pin and install `names`. With `record`, return the package metadata
    /// the install helper wrote.
    fn install_packages(&mut self, tree: &Path, names: &[&str], record: bool) -> Result<Option<PackageMetadata>>;

    /// Installed set as `name=version`; empty for trees without a package database.
    fn installed_packages(&mut self, tree: &Path) -> Result<Vec<String>>;

    fn apply_accounts(&mut self, tree: &Path, config: &LayerConfig) -> Result<()>;

    fn place_content(&mut self, invocation: &PlacementInvocation) -> Result<()>;

    /// Write the human-readable package list. `false` when the tree has none.
    fn package_listing(&mut self, tree: &Path, dest: &Path) -> Result<bool>;

    fn compress_tree(&mut self, tree: &Path, output: &Path) -> Result<PathBuf>;

    fn create_image(&mut self, plan: &ImagePlan, image: &Path, tree: &Path, mount_dir: &Path) -> Result<()>;

    /// Independent size measurement, for cross-checking the ledger.
    fn measure_tree(&mut self, tree: &Path) -> Option<u64>;

    /// Undo whatever was set up for `tree` (bind mounts). Never fails.
    fn release_tree(&mut self, tree: &Path);
}

/// Runs the real tools on this host.
pub struct HostToolchain {
    tools: ToolPaths,
    chroots: HashMap<PathBuf, Chroot>,
}

impl HostToolchain {
    pub fn new(tools: ToolPaths) -> Self {
        Self {
            tools,
            chroots: HashMap::new(),
        }
    }

    fn chroot(&mut self, tree: &Path) -> &mut Chroot {
        let emulator = self.tools.emulator.clone();
        self.chroots
            .entry(tree.to_path_buf())
            .or_insert_with(|| Chroot::new(tree, emulator))
    }
}

impl Toolchain for HostToolchain {
    fn extract_base(&mut self, base: &BaseRef, tree: &Path, mount_dir: &Path, work_dir: &Path) -> Result<()> {
        rootfs::extract_base(base, tree, mount_dir, work_dir)
    }

    fn run_script(&mut self, script: &ScriptRun, tree: &Path, work_dir: &Path) -> Result<()> {
        scripts::run(self.chroot(tree), script, work_dir)
    }

    fn install_packages(&mut self, tree: &Path, names: &[&str], record: bool) -> Result<Option<PackageMetadata>> {
        let helpers_dir = self.tools.helpers_dir.clone();
        let chroot = self.chroot(tree);
        let pinned = packages::generate_manifest(chroot, &helpers_dir, names)?;
        packages::install(chroot, &helpers_dir, &pinned, record)
    }

    fn installed_packages(&mut self, tree: &Path) -> Result<Vec<String>> {
        if !in_tree(tree, DPKG_STATUS).exists() {
            return Ok(Vec::new());
        }
        packages::installed_packages(self.chroot(tree))
    }

    fn apply_accounts(&mut self, tree: &Path, config: &LayerConfig) -> Result<()> {
        accounts::apply(self.chroot(tree), config)
    }

    fn place_content(&mut self, invocation: &PlacementInvocation) -> Result<()> {
        invocation.run()
    }

    fn package_listing(&mut self, tree: &Path, dest: &Path) -> Result<bool> {
        packages::write_listing(self.chroot(tree), dest)
    }

    fn compress_tree(&mut self, tree: &Path, output: &Path) -> Result<PathBuf> {
        rootfs::compress_tree(tree, output)
    }

    fn create_image(&mut self, plan: &ImagePlan, image: &Path, tree: &Path, mount_dir: &Path) -> Result<()> {
        // Bind mounts would be copied into the image.
        self.release_tree(tree);
        image::create_image(plan, image)?;
        image::populate_image(image, tree, mount_dir)
    }

    fn measure_tree(&mut self, tree: &Path) -> Option<u64> {
        rootfs::measure_tree(tree)
    }

    fn release_tree(&mut self, tree: &Path) {
        if let Some(mut chroot) = self.chroots.remove(tree) {
            chroot.teardown();
        }
    }
}

impl Drop for HostToolchain {
    fn drop(&mut self) {
        for (_, mut chroot) in self.chroots.drain() {
            chroot.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PYTHON;

    fn tools() -> ToolPaths {
        ToolPaths {
            helpers_dir: PathBuf::from("/helpers"),
            placement_tool: PathBuf::from("/copytarget.py"),
            python: DEFAULT_PYTHON.to_string(),
            emulator: None,
        }
    }

    #[test]
    fn test_one_chroot_per_tree() {
        let mut toolchain = HostToolchain::new(tools());
        toolchain.chroot(Path::new("/w/a"));
        toolchain.chroot(Path::new("/w/a"));
        toolchain.chroot(Path::new("/w/b"));
        assert_eq!(toolchain.chroots.len(), 2);

        toolchain.release_tree(Path::new("/w/a"));
        assert_eq!(toolchain.chroots.len(), 1);
        // Releasing an unknown tree is harmless.
        toolchain.release_tree(Path::new("/w/none"));
    }
}
