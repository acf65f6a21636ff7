//! Size budget ledger.
//!
//! The ledger is a YAML file shared by every process that adds content to a
//! layer: the placement tool appends file records, package installation
//! appends package records, and enforcement reads it back at the end of the
//! layer. Access is read-modify-write with a single writer at a time.
//!
//! ```yaml
//! totalFSSize: 1048576
//! totalFSSizeLimit: unknown
//! totalNumberOfFiles: 1
//! totalNumberOfDebians: 0
//! modules:
//!   core:
//!     moduleSize: 1048576
//!     moduleSizeLimit: unknown
//!     numberOfFiles: 1
//!     numberOfDebians: 0
//!     debians: {}
//!     files:
//!       /usr/bin/app: 1048576
//! ```

pub mod attribution;
pub mod limits;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::config::OverrunSeverity;
use crate::error::BuildError;
use limits::LimitsSpec;

/// Module given to anything without an explicit owner.
pub const UNKNOWN_MODULE: &str = "unknown";

/// A recorded limit, or `unknown` before enforcement ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Limit {
    #[default]
    Unknown,
    Bytes(u64),
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Limit::Unknown => serializer.serialize_str("unknown"),
            Limit::Bytes(n) => serializer.serialize_u64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(u64),
            Text(String),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Bytes(n) => Limit::Bytes(n),
            Repr::Text(s) => s.trim().parse().map(Limit::Bytes).unwrap_or(Limit::Unknown),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleUsage {
    #[serde(default)]
    pub module_size: u64,
    #[serde(default)]
    pub module_size_limit: Limit,
    #[serde(default)]
    pub number_of_files: u64,
    #[serde(default)]
    pub number_of_debians: u64,
    #[serde(default)]
    pub debians: BTreeMap<String, u64>,
    #[serde(default)]
    pub files: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    #[serde(rename = "totalFSSize", default)]
    pub total_fs_size: u64,
    #[serde(rename = "totalFSSizeLimit", default)]
    pub total_fs_size_limit: Limit,
    #[serde(default)]
    pub total_number_of_files: u64,
    #[serde(default)]
    pub total_number_of_debians: u64,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleUsage>,
}

impl Ledger {
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("Malformed size ledger")
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize size ledger")
    }

    /// Read a ledger; a missing or empty file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text)
                .with_context(|| format!("Failed to parse ledger {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read ledger {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::common::write_file_with_dirs(path, self.to_yaml()?)
            .with_context(|| format!("Failed to write ledger {}", path.display()))
    }

    fn module_mut(&mut self, module: &str) -> &mut ModuleUsage {
        self.modules.entry(module.to_lowercase()).or_default()
    }

    /// Record a file, replacing any earlier record of the same path.
    pub fn record_file(&mut self, path: &str, module: &str, size: u64) {
        let path = normalize_path(path);
        self.remove_file(&path);

        let usage = self.module_mut(module);
        usage.module_size += size;
        usage.number_of_files += 1;
        usage.files.insert(path, size);
        self.total_fs_size += size;
        self.total_number_of_files += 1;
    }

    /// Drop a file record. Returns the removed size, if it was recorded.
    pub fn remove_file(&mut self, path: &str) -> Option<u64> {
        let path = normalize_path(path);
        let usage = self
            .modules
            .values_mut()
            .find(|usage| usage.files.contains_key(&path))?;
        let size = usage.files.remove(&path)?;
        usage.module_size = usage.module_size.saturating_sub(size);
        usage.number_of_files = usage.number_of_files.saturating_sub(1);
        self.total_fs_size = self.total_fs_size.saturating_sub(size);
        self.total_number_of_files = self.total_number_of_files.saturating_sub(1);
        Some(size)
    }

    /// Record a package, replacing any earlier record of the same name.
    pub fn record_package(&mut self, name: &str, module: &str, size: u64) {
        self.remove_package(name);

        let usage = self.module_mut(module);
        usage.module_size += size;
        usage.number_of_debians += 1;
        usage.debians.insert(name.to_string(), size);
        self.total_fs_size += size;
        self.total_number_of_debians += 1;
    }

    pub fn remove_package(&mut self, name: &str) -> Option<u64> {
        let usage = self
            .modules
            .values_mut()
            .find(|usage| usage.debians.contains_key(name))?;
        let size = usage.debians.remove(name)?;
        usage.module_size = usage.module_size.saturating_sub(size);
        usage.number_of_debians = usage.number_of_debians.saturating_sub(1);
        self.total_fs_size = self.total_fs_size.saturating_sub(size);
        self.total_number_of_debians = self.total_number_of_debians.saturating_sub(1);
        Some(size)
    }

    pub fn module(&self, name: &str) -> Option<&ModuleUsage> {
        self.modules.get(&name.to_lowercase())
    }

    pub fn module_sum(&self) -> u64 {
        self.modules.values().map(|m| m.module_size).sum()
    }
}

/// Lexically normalize an absolute path: collapse `//`, `.` and `..`.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().unwrap_or_default()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    format!("/{}", parts.join("/"))
}

/// Ledger file name for a chain sharing one ledger.
pub fn shared_ledger_name(leaf_output: &str) -> String {
    format!("fs_size_{}.yaml", leaf_output)
}

/// Ledger file name for a layer measuring only its own contribution.
pub fn layer_ledger_name(output: &str) -> String {
    format!("fs_layer_size_{}.yaml", output)
}

/// Handle to the ledger file of one layer.
///
/// Every operation is a no-op when budgeting is disabled.
#[derive(Debug, Clone)]
pub struct LedgerFile {
    path: Option<PathBuf>,
}

impl LedgerFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn load(&self) -> Result<Ledger> {
        match self.path {
            Some(ref path) => Ledger::load(path),
            None => Ok(Ledger::default()),
        }
    }

    /// Start over with an empty ledger.
    pub fn reset(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        tracing::info!("Resetting size ledger {}", path.display());
        Ledger::default().save(path)
    }

    /// Read, modify and write back.
    pub fn update<T>(&self, f: impl FnOnce(&mut Ledger) -> Result<T>) -> Result<Option<T>> {
        let Some(ref path) = self.path else {
            return Ok(None);
        };
        let mut ledger = Ledger::load(path)?;
        let value = f(&mut ledger)?;
        ledger.save(path)?;
        Ok(Some(value))
    }
}

/// A measured footprint over its limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overrun {
    /// `None` for the layer total.
    pub module: Option<String>,
    pub size: u64,
    pub limit: u64,
}

impl Overrun {
    pub fn describe(&self, layer: &str) -> String {
        match self.module {
            None => format!(
                "The size of '{}' filesystem ('{}' bytes) is more than the total permissible limit of '{}' bytes",
                layer, self.size, self.limit
            ),
            Some(ref module) => format!(
                "The size of '{}' module ('{}' bytes) is more than the permissible limit of '{}' bytes for '{}' filesystem",
                module, self.size, self.limit, layer
            ),
        }
    }
}

/// Record the limits for `layer` in the ledger and list what exceeds them.
///
/// Every policy problem is reported before any size is compared.
pub fn apply_limits(
    ledger: &mut Ledger,
    limits: &LimitsSpec,
    layer: &str,
    extends_base: bool,
) -> Result<Vec<Overrun>, BuildError> {
    let total_limit = limits.total_limit(layer)?.bytes;

    let mut module_limits = Vec::with_capacity(ledger.modules.len());
    for name in ledger.modules.keys() {
        let limit = limits.module_limit(name, layer)?;
        if extends_base && !limit.relative {
            return Err(BuildError::policy(format!(
                "'{}' extends a base image; the limit of '{}' module must be relative to the base and start with '+' (e.g. +512 bytes)",
                layer, name
            )));
        }
        module_limits.push((name.clone(), limit.bytes));
    }

    let mut overruns = Vec::new();
    ledger.total_fs_size_limit = Limit::Bytes(total_limit);
    if ledger.total_fs_size > total_limit {
        overruns.push(Overrun {
            module: None,
            size: ledger.total_fs_size,
            limit: total_limit,
        });
    }

    for (name, limit) in module_limits {
        let Some(usage) = ledger.modules.get_mut(&name) else {
            continue;
        };
        usage.module_size_limit = Limit::Bytes(limit);
        tracing::info!("'{}' module consumes '{}' bytes in '{}'", name, usage.module_size, layer);
        if usage.module_size > limit {
            overruns.push(Overrun {
                module: Some(name),
                size: usage.module_size,
                limit,
            });
        }
    }

    Ok(overruns)
}

/// Settle a layer's ledger total and check it against the limits document.
///
/// The ledger is written back with the limits recorded whatever the outcome
/// of the comparison. Without a limits document only the total is settled.
/// `measured` is an independent size of the tree, logged next to the ledger
/// total.
pub fn enforce(
    ledger_file: &LedgerFile,
    limits_path: Option<&Path>,
    layer: &str,
    extends_base: bool,
    severity: OverrunSeverity,
    measured: Option<u64>,
) -> Result<()> {
    let Some(path) = ledger_file.path() else {
        return Ok(());
    };
    let mut ledger = Ledger::load(path)?;

    ledger.total_fs_size = ledger.module_sum();
    tracing::info!(
        "The contents added to '{}' take up '{}' bytes",
        layer,
        ledger.total_fs_size
    );
    if let Some(measured) = measured {
        if measured != ledger.total_fs_size {
            tracing::info!(
                "Tree of '{}' measures '{}' bytes on disk ({} bytes recorded in the ledger)",
                layer,
                measured,
                ledger.total_fs_size
            );
        }
    }

    let Some(limits_path) = limits_path else {
        return ledger.save(path);
    };
    let limits = LimitsSpec::load(limits_path)?;
    let overruns = apply_limits(&mut ledger, &limits, layer, extends_base)
        .with_context(|| format!("Invalid size limits in {}", limits_path.display()))?;
    ledger.save(path)?;

    if overruns.is_empty() {
        tracing::info!("'{}' is within its size limits", layer);
        return Ok(());
    }

    let messages: Vec<String> = overruns.iter().map(|o| o.describe(layer)).collect();
    match severity {
        OverrunSeverity::Error => Err(BuildError::BudgetExceeded(messages.join("; ")).into()),
        OverrunSeverity::Warn => {
            for message in messages {
                tracing::warn!("{}", message);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rerecording_a_file_replaces_it() {
        let mut ledger = Ledger::default();
        ledger.record_file("/usr/bin/a", "modX", 100);
        ledger.record_file("/usr//bin/./a", "modX", 150);

        let usage = ledger.module("modx").unwrap();
        assert_eq!(usage.module_size, 150);
        assert_eq!(usage.number_of_files, 1);
        assert_eq!(ledger.total_fs_size, 150);
        assert_eq!(ledger.total_number_of_files, 1);
    }

    #[test]
    fn test_moving_a_file_between_modules() {
        let mut ledger = Ledger::default();
        ledger.record_file("/etc/app.conf", "core", 10);
        ledger.record_file("/etc/app.conf", "net", 12);
        assert_eq!(ledger.module("core").unwrap().module_size, 0);
        assert_eq!(ledger.module("net").unwrap().module_size, 12);
        assert_eq!(ledger.total_fs_size, 12);
    }

    #[test]
    fn test_rerecording_a_package_replaces_it() {
        let mut ledger = Ledger::default();
        ledger.record_package("bash", "core", 1024);
        ledger.record_package("bash", "core", 2048);
        assert_eq!(ledger.total_number_of_debians, 1);
        assert_eq!(ledger.module_sum(), 2048);
    }

    #[test]
    fn test_missing_and_empty_files_are_empty_ledgers() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("fs_size_x.yaml");
        assert_eq!(Ledger::load(&missing).unwrap(), Ledger::default());

        std::fs::write(&missing, "").unwrap();
        assert_eq!(Ledger::load(&missing).unwrap(), Ledger::default());
    }

    #[test]
    fn test_limit_serializes_as_unknown_or_number() {
        let mut ledger = Ledger::default();
        ledger.record_file("/a", "core", 1);
        let yaml = ledger.to_yaml().unwrap();
        assert!(yaml.contains("totalFSSizeLimit: unknown"), "{}", yaml);
        assert!(yaml.contains("moduleSizeLimit: unknown"), "{}", yaml);

        ledger.total_fs_size_limit = Limit::Bytes(4096);
        let yaml = ledger.to_yaml().unwrap();
        assert!(yaml.contains("totalFSSizeLimit: 4096"), "{}", yaml);
    }

    #[test]
    fn test_reads_records_written_by_placement_tool() {
        // The placement tool writes neither debian counters nor debians.
        let ledger = Ledger::from_yaml(
            "\
totalFSSize: 5
totalFSSizeLimit: unknown
totalNumberOfFiles: 1
modules:
    core:
        moduleSize: 5
        moduleSizeLimit: unknown
        numberOfFiles: 1
        files:
            /opt/x: 5
",
        )
        .unwrap();
        assert_eq!(ledger.module("core").unwrap().files["/opt/x"], 5);
        assert_eq!(ledger.total_number_of_debians, 0);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a//b/./c/../d"), "/a/b/d");
        assert_eq!(normalize_path("a/b"), "/a/b");
    }

    #[test]
    fn test_disabled_ledger_is_noop() {
        let ledger = LedgerFile::disabled();
        ledger.reset().unwrap();
        let value = ledger
            .update(|l| {
                l.record_file("/x", "core", 1);
                Ok(())
            })
            .unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_ledger_names() {
        assert_eq!(shared_ledger_name("rootfs"), "fs_size_rootfs.yaml");
        assert_eq!(layer_ledger_name("app"), "fs_layer_size_app.yaml");
    }
}
