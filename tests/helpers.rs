//! Shared test utilities for layerfs tests.

#![allow(dead_code)]

use anyhow::Result;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use layerfs::capacity::ImagePlan;
use layerfs::config::{BuildConfig, BuildOptions, Environment};
use layerfs::layer::{BaseRef, LayerConfig, LayerDocument};
use layerfs::manifest;
use layerfs::packages::PackageMetadata;
use layerfs::placement::PlacementInvocation;
use layerfs::scripts::ScriptRun;
use layerfs::toolchain::Toolchain;

/// Test environment with a config directory and an output directory.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Where layer configs are written
    pub config_dir: PathBuf,
    /// Build output directory
    pub output: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("configs");
        let output = temp_dir.path().join("out");
        fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        Self {
            _temp_dir: temp_dir,
            config_dir,
            output,
        }
    }

    pub fn root(&self) -> &Path {
        self._temp_dir.path()
    }

    /// Write a layer config as `<name>` in the config directory.
    pub fn write_layer(&self, name: &str, doc: Value) -> PathBuf {
        let path = self.config_dir.join(name);
        fs::write(&path, serde_json::to_string_pretty(&doc).expect("serialize"))
            .expect("Failed to write layer config");
        path
    }

    pub fn load(&self, name: &str) -> LayerDocument {
        LayerDocument::from_path(&self.config_dir.join(name)).expect("layer config should parse")
    }

    /// Build options rooted in this environment; images off, tarballs off.
    pub fn options(&self) -> BuildOptions {
        let mut options = BuildOptions::new(&self.output);
        options.create_image = false;
        options
    }

    pub fn config(&self, options: BuildOptions) -> BuildConfig {
        BuildConfig::new(options, Environment::default()).expect("valid build options")
    }

    pub fn output_file(&self, name: &str) -> PathBuf {
        self.output.join(name)
    }

    /// A prebuilt base directory with one file in it.
    pub fn prebuilt_dir(&self, name: &str) -> PathBuf {
        let dir = self.root().join(name);
        fs::create_dir_all(dir.join("etc")).expect("Failed to create base dir");
        fs::write(dir.join("etc/os-release"), "ID=base\n").expect("Failed to write base file");
        dir
    }
}

/// What the builder asked the toolchain to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ExtractBase(PathBuf),
    Script(PathBuf),
    Install { names: Vec<String>, record: bool },
    Accounts(String),
    Place(PathBuf),
    Compress(PathBuf),
    Image(PathBuf),
    Listing(PathBuf),
    Release,
}

/// Records calls and writes just enough into the tree to look real.
#[derive(Default)]
pub struct FakeToolchain {
    pub calls: Vec<Call>,
    /// Returned from recording installs.
    pub metadata: Option<PackageMetadata>,
    /// Reported by `installed_packages`.
    pub installed: Vec<String>,
    /// Published into the tree on base extraction.
    pub base_manifest: Option<PathBuf>,
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn installs(&self) -> Vec<&Call> {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Install { .. }))
            .collect()
    }
}

impl Toolchain for FakeToolchain {
    fn extract_base(&mut self, base: &BaseRef, tree: &Path, _mount_dir: &Path, _work_dir: &Path) -> Result<()> {
        self.calls.push(Call::ExtractBase(base.path().to_path_buf()));
        fs::create_dir_all(tree.join("etc"))?;
        fs::write(tree.join("etc/os-release"), "ID=base\n")?;
        if let Some(ref manifest_path) = self.base_manifest {
            manifest::publish(tree, manifest_path)?;
        }
        Ok(())
    }

    fn run_script(&mut self, script: &ScriptRun, _tree: &Path, _work_dir: &Path) -> Result<()> {
        self.calls.push(Call::Script(script.path.clone()));
        Ok(())
    }

    fn install_packages(&mut self, tree: &Path, names: &[&str], record: bool) -> Result<Option<PackageMetadata>> {
        self.calls.push(Call::Install {
            names: names.iter().map(|n| n.to_string()).collect(),
            record,
        });
        fs::create_dir_all(tree.join("var/lib/dpkg"))?;
        fs::write(tree.join("var/lib/dpkg/status"), names.join("\n"))?;
        Ok(if record { self.metadata.clone() } else { None })
    }

    fn installed_packages(&mut self, _tree: &Path) -> Result<Vec<String>> {
        Ok(self.installed.clone())
    }

    fn apply_accounts(&mut self, _tree: &Path, config: &LayerConfig) -> Result<()> {
        self.calls.push(Call::Accounts(config.output.clone()));
        Ok(())
    }

    fn place_content(&mut self, invocation: &PlacementInvocation) -> Result<()> {
        let manifest = match invocation {
            PlacementInvocation::Tool { manifest, .. } => manifest.clone(),
            PlacementInvocation::Script { script, .. } => script.clone(),
        };
        self.calls.push(Call::Place(manifest));
        Ok(())
    }

    fn package_listing(&mut self, _tree: &Path, dest: &Path) -> Result<bool> {
        self.calls.push(Call::Listing(dest.to_path_buf()));
        Ok(false)
    }

    fn compress_tree(&mut self, _tree: &Path, output: &Path) -> Result<PathBuf> {
        let mut name = output.as_os_str().to_owned();
        name.push(".tar.bz2");
        let tarball = PathBuf::from(name);
        fs::write(&tarball, b"")?;
        self.calls.push(Call::Compress(tarball.clone()));
        Ok(tarball)
    }

    fn create_image(&mut self, _plan: &ImagePlan, image: &Path, _tree: &Path, _mount_dir: &Path) -> Result<()> {
        fs::write(image, b"")?;
        self.calls.push(Call::Image(image.to_path_buf()));
        Ok(())
    }

    fn measure_tree(&mut self, _tree: &Path) -> Option<u64> {
        None
    }

    fn release_tree(&mut self, _tree: &Path) {
        self.calls.push(Call::Release);
    }
}

/// Assert that a file contains expected content.
pub fn assert_file_contains(path: &Path, expected: &str) {
    let content = fs::read_to_string(path).unwrap_or_else(|_| panic!("Failed to read file: {}", path.display()));
    assert!(
        content.contains(expected),
        "File {} does not contain expected content.\nExpected to find: {}\nActual content: {}",
        path.display(),
        expected,
        content
    );
}

/// Assert that a file exists.
pub fn assert_file_exists(path: &Path) {
    assert!(path.exists(), "Expected file to exist: {}", path.display());
}
