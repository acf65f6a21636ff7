//! Package ownership.
//!
//! Packages declared with an explicit module own their whole dependency
//! closure, first claim wins. Everything else installed by the layer lands
//! in [`UNKNOWN_MODULE`].

use anyhow::Result;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use super::{Ledger, UNKNOWN_MODULE};
use crate::common::in_tree;
use crate::packages::PackageMetadata;

static VERSION_CONSTRAINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^()]*\)").expect("version constraint pattern is valid"));

/// Split a `Depends:` field into package names.
///
/// Alternatives count as separate dependencies and version constraints
/// are dropped.
pub fn parse_depends(depends: &str) -> Vec<String> {
    let compact: String = depends.chars().filter(|c| !c.is_whitespace()).collect();
    let alternatives = compact.replace('|', ",");
    VERSION_CONSTRAINT
        .replace_all(&alternatives, "")
        .split(',')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Assign a module to every package reachable from `seeds`.
///
/// `seeds` are `(package, module)` in declaration order. The walk is
/// depth-first in dependency order; a package keeps the first module it
/// receives and is never expanded twice, so cycles terminate.
pub fn attribute(seeds: &[(String, String)], metadata: &PackageMetadata) -> HashMap<String, String> {
    let mut owners: HashMap<String, String> = HashMap::new();
    for (package, module) in seeds {
        owners
            .entry(package.clone())
            .or_insert_with(|| module.to_lowercase());
    }

    for (seed, _) in seeds {
        // Each frame holds a package's dependencies and the next one to visit.
        let mut stack: Vec<(String, Vec<String>, usize)> = Vec::new();
        if let Some(deps) = dependencies(seed, metadata) {
            stack.push((seed.clone(), deps, 0));
        }

        while let Some((package, deps, next)) = stack.last_mut() {
            let Some(dep) = deps.get(*next).cloned() else {
                stack.pop();
                continue;
            };
            *next += 1;
            if owners.contains_key(&dep) {
                continue;
            }
            let module = owners
                .get(package.as_str())
                .cloned()
                .unwrap_or_else(|| UNKNOWN_MODULE.to_string());
            owners.insert(dep.clone(), module);
            if let Some(dep_deps) = dependencies(&dep, metadata) {
                stack.push((dep, dep_deps, 0));
            }
        }
    }

    owners
}

fn dependencies(package: &str, metadata: &PackageMetadata) -> Option<Vec<String>> {
    let installed = metadata.installed_packages.get(package)?;
    installed.depends.as_deref().map(parse_depends)
}

/// Bytes a package occupies: its reported size, or the sum of its regular
/// files present in `tree`.
pub fn package_size(name: &str, metadata: &PackageMetadata, tree: &Path) -> u64 {
    let Some(installed) = metadata.installed_packages.get(name) else {
        return 0;
    };
    if let Some(kib) = installed.size_kib() {
        return kib * 1024;
    }
    installed
        .files
        .iter()
        .filter_map(|file| fs::symlink_metadata(in_tree(tree, file)).ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}

/// Record every installed package of the layer into `ledger`.
///
/// When the layer extends a base image, packages the base already had are
/// skipped. Returns how many packages were recorded.
pub fn record_packages(
    ledger: &mut Ledger,
    metadata: &PackageMetadata,
    seeds: &[(String, String)],
    tree: &Path,
    extends_base: bool,
) -> Result<usize> {
    let owners = attribute(seeds, metadata);
    let mut recorded = 0;

    for name in metadata.installed_packages.keys() {
        if extends_base && metadata.is_base(name) {
            continue;
        }
        let module = owners.get(name).map(String::as_str).unwrap_or(UNKNOWN_MODULE);
        let size = package_size(name, metadata, tree);
        ledger.record_package(name, module, size);
        recorded += 1;
    }

    tracing::info!("Attributed {} packages to modules", recorded);
    Ok(recorded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::InstalledPackage;
    use crate::layer::IdValue;

    fn metadata(entries: &[(&str, &str)]) -> PackageMetadata {
        let mut meta = PackageMetadata::default();
        for (name, depends) in entries {
            meta.installed_packages.insert(
                name.to_string(),
                InstalledPackage {
                    size: Some(IdValue::Number(1)),
                    depends: Some(depends.to_string()),
                    files: Vec::new(),
                },
            );
        }
        meta
    }

    fn seeds(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(p, m)| (p.to_string(), m.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_depends() {
        assert_eq!(
            parse_depends("libc6 (>= 2.34), libtinfo6 (>= 6) | libncurses6, debianutils (>= 5.6-0.1)"),
            ["libc6", "libtinfo6", "libncurses6", "debianutils"]
        );
        assert!(parse_depends("").is_empty());
        assert_eq!(parse_depends("a,,b"), ["a", "b"]);
    }

    #[test]
    fn test_first_claim_wins() {
        let meta = metadata(&[("app", "shared"), ("tool", "shared"), ("shared", "")]);
        let owners = attribute(&seeds(&[("app", "Core"), ("tool", "net")]), &meta);
        assert_eq!(owners["shared"], "core");
        assert_eq!(owners["tool"], "net");
    }

    #[test]
    fn test_depth_first_order() {
        // a -> b, c ; b -> c. c is reached through b before a's own c edge.
        let meta = metadata(&[("a", "b, c"), ("b", "c"), ("c", "")]);
        let owners = attribute(&seeds(&[("a", "x")]), &meta);
        assert_eq!(owners.len(), 3);
        assert!(owners.values().all(|m| m == "x"));
    }

    #[test]
    fn test_unreported_size_sums_regular_files() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("usr/bin")).unwrap();
        std::fs::write(temp.path().join("usr/bin/tool"), vec![0u8; 300]).unwrap();
        std::os::unix::fs::symlink("tool", temp.path().join("usr/bin/alias")).unwrap();

        let mut meta = PackageMetadata::default();
        meta.installed_packages.insert(
            "tool".to_string(),
            InstalledPackage {
                size: None,
                depends: None,
                files: vec![
                    "/usr/bin".to_string(),
                    "/usr/bin/tool".to_string(),
                    "/usr/bin/alias".to_string(),
                    "/usr/bin/missing".to_string(),
                ],
            },
        );
        assert_eq!(package_size("tool", &meta, temp.path()), 300);
    }

    #[test]
    fn test_base_packages_skipped_when_extending() {
        let mut meta = metadata(&[("libc6", ""), ("app", "libc6")]);
        meta.base_packages.push("libc6".to_string());
        let tree = Path::new("/nonexistent");

        let mut ledger = Ledger::default();
        let count = record_packages(&mut ledger, &meta, &seeds(&[("app", "core")]), tree, true).unwrap();
        assert_eq!(count, 1);
        assert!(ledger.module("core").unwrap().debians.contains_key("app"));

        let mut ledger = Ledger::default();
        let count = record_packages(&mut ledger, &meta, &seeds(&[("app", "core")]), tree, false).unwrap();
        assert_eq!(count, 2);
    }
}
