//! Size limits policy.
//!
//! ```yaml
//! maxFSSize:
//!   rootfs: 2147483648 bytes
//!   others: 1073741824 bytes
//! modules:
//!   core: +536870912 bytes
//!   net:
//!     rootfs: 104857600B
//! ```
//!
//! Every value carries a byte unit. A leading `+` marks a size relative to
//! the base image, which layers extending a base must use for modules.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::error::BuildError;

pub const ACCEPTED_UNITS: [&str; 3] = ["bytes", "byte", "B"];

/// Key matching every layer not listed by name.
pub const WILDCARD_LAYER: &str = "others";

/// One parsed limit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitValue {
    pub bytes: u64,
    /// Written with a leading `+`.
    pub relative: bool,
}

/// An optional `+`, a decimal byte count and one of [`ACCEPTED_UNITS`].
static LIMIT_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\+)?([0-9]+)\s*(bytes|byte|B)$").expect("limit value pattern is valid")
});

/// Parses `512 bytes`, `+512 bytes` or `4096B`.
///
/// Anything else is a policy error, including other units (`100MB`), signs
/// other than `+` and text between the count and the unit.
impl FromStr for LimitValue {
    type Err = BuildError;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let value = raw.trim();
        if !ACCEPTED_UNITS.iter().any(|unit| value.ends_with(unit)) {
            return Err(BuildError::policy(format!(
                "The value '{}' does not have a correct unit; it should be one of {:?}",
                value, ACCEPTED_UNITS
            )));
        }
        let caps = LIMIT_VALUE.captures(value).ok_or_else(|| {
            BuildError::policy(format!(
                "The value '{}' is not a byte count such as '512 bytes' or '+512 bytes'",
                value
            ))
        })?;
        let bytes = caps[2]
            .parse()
            .map_err(|_| BuildError::policy(format!("The value '{}' is out of range", value)))?;
        Ok(Self {
            bytes,
            relative: caps.get(1).is_some(),
        })
    }
}

/// A limit scalar as written, before unit parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLimit(pub String);

impl<'de> Deserialize<'de> for RawLimit {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Scalar {
            Number(i64),
            Text(String),
        }
        Ok(match Scalar::deserialize(deserializer)? {
            Scalar::Number(n) => RawLimit(n.to_string()),
            Scalar::Text(s) => RawLimit(s),
        })
    }
}

impl fmt::Display for RawLimit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A limit for every layer, or per layer with an `others` fallback.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LimitEntry {
    PerLayer(BTreeMap<String, RawLimit>),
    All(RawLimit),
}

impl LimitEntry {
    fn for_layer(&self, layer: &str) -> Option<&RawLimit> {
        match self {
            LimitEntry::All(value) => Some(value),
            LimitEntry::PerLayer(map) => map.get(layer).or_else(|| map.get(WILDCARD_LAYER)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitsSpec {
    #[serde(rename = "maxFSSize", default)]
    pub max_fs_size: Option<LimitEntry>,
    #[serde(default)]
    pub modules: Option<BTreeMap<String, LimitEntry>>,
}

impl LimitsSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read size limits {}", path.display()))?;
        Self::from_yaml(&text)
            .with_context(|| format!("Invalid size limits file {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
            .map_err(|e| BuildError::policy(format!("Malformed limits document: {}", e)).into())
    }

    /// Total size limit for `layer`.
    pub fn total_limit(&self, layer: &str) -> Result<LimitValue, BuildError> {
        let entry = self.max_fs_size.as_ref().ok_or_else(|| {
            BuildError::policy("The max size of filesystems is not defined (missing 'maxFSSize')")
        })?;
        let raw = entry.for_layer(layer).ok_or_else(|| {
            BuildError::policy(format!("The max size of '{}' filesystem is not defined", layer))
        })?;
        raw.0.parse()
    }

    /// Raw limit for `module` on `layer`; the relative marker is still visible.
    pub fn module_limit(&self, module: &str, layer: &str) -> Result<LimitValue, BuildError> {
        let modules = self.modules.as_ref().ok_or_else(|| {
            BuildError::policy("Module size limits are not defined (missing 'modules')")
        })?;
        let entry = modules
            .get(module)
            .or_else(|| {
                modules
                    .iter()
                    .find(|(name, _)| name.to_lowercase() == module)
                    .map(|(_, entry)| entry)
            })
            .ok_or_else(|| {
                BuildError::policy(format!("The max size of '{}' module is not defined", module))
            })?;
        let raw = entry.for_layer(layer).ok_or_else(|| {
            BuildError::policy(format!(
                "The max size of '{}' module for '{}' filesystem is not defined",
                module, layer
            ))
        })?;
        raw.0.parse()
    }
}
