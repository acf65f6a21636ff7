//! Layer configuration documents.
//!
//! A layer config is a JSON object. The typed view ([`LayerConfig`]) is what
//! the builder acts on; the raw object is kept alongside so the frozen
//! manifest carries unknown fields through untouched.

pub mod base;
pub mod entries;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::capacity::DEFAULT_IMAGE_SIZE;
use crate::config::Environment;
use crate::error::BuildError;

pub use base::BaseRef;
pub use entries::{
    ArgEdits, CopyTargetEntry, GroupEntry, GroupSpec, IdValue, MirrorEntry, MountSpec,
    OrderedMap, PackageEntry, Password, ScriptLocation, UserEntry, UserSpec, DEBIAN_MIRROR,
};

/// Placement tool filesystem type when a layer names none.
pub const DEFAULT_FILESYSTEM_TYPE: &str = "standard";

/// Where a layer document came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerOrigin {
    File(PathBuf),
    /// Read from stdin; relative paths cannot be anchored.
    Stream,
}

impl LayerOrigin {
    pub fn describe(&self) -> String {
        match self {
            LayerOrigin::File(path) => path.display().to_string(),
            LayerOrigin::Stream => "<stdin>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerConfig {
    pub output: String,
    #[serde(rename = "OS")]
    pub os: String,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub filesystem_type: Option<String>,
    #[serde(default)]
    pub image_size: Option<IdValue>,
    #[serde(default)]
    pub distro: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub mirrors: Vec<MirrorEntry>,
    #[serde(default)]
    pub debian_packages: Vec<PackageEntry>,
    #[serde(default)]
    pub copy_targets: Vec<CopyTargetEntry>,
    #[serde(default)]
    pub pre_installs: OrderedMap<ScriptLocation>,
    #[serde(default)]
    pub post_installs: OrderedMap<ScriptLocation>,
    #[serde(default)]
    pub users: OrderedMap<UserEntry>,
    #[serde(default)]
    pub groups: OrderedMap<GroupEntry>,
    #[serde(default)]
    pub memberships: OrderedMap<Vec<String>>,
    #[serde(default)]
    pub mounts: OrderedMap<MountSpec>,
    #[serde(default)]
    pub filesystem_cleanup: Vec<String>,
    #[serde(default)]
    pub filesystem_include: Vec<String>,
    #[serde(default)]
    pub associated_filesystems: Vec<String>,
}

impl LayerConfig {
    pub fn filesystem_type(&self) -> &str {
        self.filesystem_type
            .as_deref()
            .unwrap_or(DEFAULT_FILESYSTEM_TYPE)
    }

    /// Declared final image size in bytes.
    pub fn image_size(&self) -> Result<u64> {
        match &self.image_size {
            None => Ok(DEFAULT_IMAGE_SIZE),
            Some(value) => value.as_number().ok_or_else(|| {
                BuildError::config(format!(
                    "ImageSize '{}' of '{}' is not a byte count",
                    value, self.output
                ))
                .into()
            }),
        }
    }

    /// Packages to install, in declaration order.
    pub fn package_names(&self) -> Vec<&str> {
        self.debian_packages.iter().map(PackageEntry::package).collect()
    }
}

/// A parsed layer config plus the raw JSON it came from.
#[derive(Debug, Clone)]
pub struct LayerDocument {
    pub config: LayerConfig,
    pub raw: serde_json::Map<String, serde_json::Value>,
    pub origin: LayerOrigin,
}

impl LayerDocument {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read layer config {}", path.display()))?;
        Self::parse(&text, LayerOrigin::File(path.to_path_buf()))
    }

    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .context("Failed to read layer config from stdin")?;
        Self::parse(&text, LayerOrigin::Stream)
    }

    pub fn parse(text: &str, origin: LayerOrigin) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
            BuildError::config(format!("{} is not valid JSON: {}", origin.describe(), e))
        })?;
        let serde_json::Value::Object(raw) = value else {
            return Err(BuildError::config(format!(
                "{} must be a JSON object",
                origin.describe()
            ))
            .into());
        };
        let config: LayerConfig =
            serde_json::from_value(serde_json::Value::Object(raw.clone())).map_err(|e| {
                BuildError::config(format!("Invalid layer config {}: {}", origin.describe(), e))
            })?;

        let doc = Self {
            config,
            raw,
            origin,
        };
        doc.validate()?;
        Ok(doc)
    }

    fn validate(&self) -> Result<()> {
        let config = &self.config;
        let source = self.origin.describe();

        if config.output.trim().is_empty() {
            return Err(BuildError::config(format!("Output is empty in {}", source)).into());
        }
        if !config.os.eq_ignore_ascii_case("linux") {
            return Err(BuildError::config(format!(
                "OS '{}' in {} is not supported; only Linux targets can be built",
                config.os, source
            ))
            .into());
        }
        config.image_size()?;

        if let Some(mirror) = config.mirrors.iter().find(|m| m.kind() != DEBIAN_MIRROR) {
            return Err(BuildError::config(format!(
                "Mirror type '{}' in {} is not supported",
                mirror.kind(),
                source
            ))
            .into());
        }
        Ok(())
    }

    pub fn output(&self) -> &str {
        &self.config.output
    }

    /// Resolve `Base`, if any.
    pub fn base(&self, env: &Environment) -> Result<Option<BaseRef>> {
        self.config
            .base
            .as_deref()
            .map(|raw| BaseRef::resolve(raw, &self.origin, env))
            .transpose()
            .with_context(|| format!("Failed to resolve Base of '{}'", self.output()))
    }

    /// Resolve each `AssociatedFilesystems` entry to a config path.
    pub fn associated_paths(&self, env: &Environment) -> Result<Vec<PathBuf>> {
        self.config
            .associated_filesystems
            .iter()
            .map(|raw| base::resolve_relative(&env.expand(raw), &self.origin, "AssociatedFilesystems"))
            .collect()
    }

    /// Resolve a host-side path declared in this config (script, copy target manifest).
    pub fn resolve_path(&self, raw: &str, env: &Environment, field: &str) -> Result<PathBuf> {
        base::resolve_relative(&env.expand(raw), &self.origin, field)
    }
}
