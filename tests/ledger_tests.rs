//! Size budget ledger: recording, package ownership, limits enforcement.

mod helpers;

use layerfs::config::OverrunSeverity;
use layerfs::error::{classify, BuildError};
use layerfs::ledger::attribution::{attribute, record_packages};
use layerfs::ledger::{self, Ledger, LedgerFile, Limit, UNKNOWN_MODULE};
use layerfs::packages::PackageMetadata;
use std::fs;
use tempfile::TempDir;

fn metadata(yaml: &str) -> PackageMetadata {
    PackageMetadata::from_yaml(yaml).expect("metadata should parse")
}

fn seeds(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(p, m)| (p.to_string(), m.to_string()))
        .collect()
}

#[test]
fn test_same_file_recorded_twice_counts_once() {
    let mut ledger = Ledger::default();
    ledger.record_file("/opt/app/bin/server", "modX", 100);
    ledger.record_file("/opt/app/bin/server", "modX", 150);

    let usage = ledger.module("modx").unwrap();
    assert_eq!(usage.module_size, 150);
    assert_eq!(usage.number_of_files, 1);
    assert_eq!(ledger.total_number_of_files, 1);
    assert_eq!(ledger.module_sum(), 150);
}

#[test]
fn test_closure_is_owned_by_the_seed_module() {
    let meta = metadata(
        "\
installed_packages:
  A:
    size: 1
    depends: B, C (>= 1.0)
  B:
    size: 2
  C:
    size: 4
    depends: D
  D:
    size: 8
  E:
    size: 16
",
    );
    let owners = attribute(&seeds(&[("A", "Core")]), &meta);
    for pkg in ["A", "B", "C", "D"] {
        assert_eq!(owners.get(pkg).map(String::as_str), Some("core"), "{}", pkg);
    }
    assert!(!owners.contains_key("E"));

    let temp = TempDir::new().unwrap();
    let mut ledger = Ledger::default();
    let recorded = record_packages(&mut ledger, &meta, &seeds(&[("A", "Core")]), temp.path(), false).unwrap();
    assert_eq!(recorded, 5);
    assert_eq!(ledger.module("core").unwrap().module_size, 15 * 1024);
    assert_eq!(ledger.module(UNKNOWN_MODULE).unwrap().module_size, 16 * 1024);
}

#[test]
fn test_dependency_cycle_terminates() {
    let meta = metadata(
        "\
installed_packages:
  A:
    depends: B
  B:
    depends: A
",
    );
    let owners = attribute(&seeds(&[("A", "m")]), &meta);
    assert_eq!(owners.len(), 2);
    assert_eq!(owners["B"], "m");
}

#[test]
fn test_first_seed_claims_shared_dependency() {
    let meta = metadata(
        "\
installed_packages:
  app:
    depends: libc6
  tool:
    depends: libc6
  libc6: {}
",
    );
    let owners = attribute(&seeds(&[("app", "core"), ("tool", "net")]), &meta);
    assert_eq!(owners["libc6"], "core");
    assert_eq!(owners["tool"], "net");
}

#[test]
fn test_base_packages_skipped_when_extending_a_base() {
    let meta = metadata(
        "\
installed_packages:
  bash:
    size: 1
  app:
    size: 2
base_packages: [bash]
",
    );
    let temp = TempDir::new().unwrap();
    let mut ledger = Ledger::default();
    record_packages(&mut ledger, &meta, &[], temp.path(), true).unwrap();
    assert_eq!(ledger.total_number_of_debians, 1);
    assert!(ledger.module(UNKNOWN_MODULE).unwrap().debians.contains_key("app"));
}

#[test]
fn test_package_size_falls_back_to_file_sizes() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("usr/bin")).unwrap();
    fs::write(temp.path().join("usr/bin/tool"), vec![0u8; 300]).unwrap();
    let meta = metadata(
        "\
installed_packages:
  tool:
    files: [/usr/bin/tool, /usr/bin, /usr/share/missing]
",
    );
    let mut ledger = Ledger::default();
    record_packages(&mut ledger, &meta, &[], temp.path(), false).unwrap();
    assert_eq!(ledger.total_fs_size, 300);
}

fn enforce_with(
    temp: &TempDir,
    modules: &[(&str, u64)],
    limits: &str,
    extends_base: bool,
    severity: OverrunSeverity,
) -> (anyhow::Result<()>, Ledger) {
    let ledger_path = temp.path().join(ledger::shared_ledger_name("rootfs"));
    let limits_path = temp.path().join("limits.yaml");
    fs::write(&limits_path, limits).unwrap();

    let mut ledger = Ledger::default();
    for (i, (module, size)) in modules.iter().enumerate() {
        ledger.record_file(&format!("/f{}", i), module, *size);
    }
    ledger.save(&ledger_path).unwrap();

    let file = LedgerFile::new(ledger_path.clone());
    let result = ledger::enforce(&file, Some(&limits_path), "rootfs", extends_base, severity, None);
    (result, Ledger::load(&ledger_path).unwrap())
}

#[test]
fn test_relative_module_limit_on_base_extension() {
    let limits = "maxFSSize: 1000000 bytes\nmodules:\n  core: +512 bytes\n";

    let temp = TempDir::new().unwrap();
    let (result, ledger) = enforce_with(&temp, &[("core", 600)], limits, true, OverrunSeverity::Error);
    let err = result.unwrap_err();
    assert!(matches!(classify(&err), Some(BuildError::BudgetExceeded(_))), "{:#}", err);
    assert!(format!("{:#}", err).contains("'core' module ('600' bytes)"));
    // Limits are recorded even when enforcement fails.
    assert_eq!(ledger.module("core").unwrap().module_size_limit, Limit::Bytes(512));

    let temp = TempDir::new().unwrap();
    let (result, ledger) = enforce_with(&temp, &[("core", 400)], limits, true, OverrunSeverity::Error);
    result.unwrap();
    assert_eq!(ledger.total_fs_size_limit, Limit::Bytes(1_000_000));
}

#[test]
fn test_absolute_module_limit_rejected_on_base_extension() {
    let temp = TempDir::new().unwrap();
    let (result, _) = enforce_with(
        &temp,
        &[("core", 1)],
        "maxFSSize: 1000 bytes\nmodules:\n  core: 512 bytes\n",
        true,
        OverrunSeverity::Warn,
    );
    let err = result.unwrap_err();
    // Policy errors fail even when overruns only warn.
    assert!(matches!(classify(&err), Some(BuildError::BudgetPolicy(_))), "{:#}", err);
}

#[test]
fn test_missing_module_entry_is_policy_error() {
    let temp = TempDir::new().unwrap();
    let (result, _) = enforce_with(
        &temp,
        &[("core", 1), ("extras", 1)],
        "maxFSSize: 1000 bytes\nmodules:\n  core: 512 bytes\n",
        false,
        OverrunSeverity::Error,
    );
    let err = result.unwrap_err();
    assert!(matches!(classify(&err), Some(BuildError::BudgetPolicy(_))));
    assert!(format!("{:#}", err).contains("'extras'"));
}

#[test]
fn test_overrun_only_warns_when_downgraded() {
    let temp = TempDir::new().unwrap();
    let (result, ledger) = enforce_with(
        &temp,
        &[("core", 2000)],
        "maxFSSize:\n  others: 1000 bytes\nmodules:\n  Core: 5000B\n",
        false,
        OverrunSeverity::Warn,
    );
    result.unwrap();
    assert_eq!(ledger.total_fs_size, 2000);
    assert_eq!(ledger.total_fs_size_limit, Limit::Bytes(1000));
    assert_eq!(ledger.module("core").unwrap().module_size_limit, Limit::Bytes(5000));
}

#[test]
fn test_enforce_without_limits_settles_total() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("fs_size_x.yaml");
    let mut ledger = Ledger::default();
    ledger.record_file("/a", "core", 10);
    ledger.record_package("bash", "net", 20);
    ledger.total_fs_size = 999;
    ledger.save(&path).unwrap();

    ledger::enforce(&LedgerFile::new(path.clone()), None, "x", false, OverrunSeverity::Error, Some(4096)).unwrap();
    let settled = Ledger::load(&path).unwrap();
    assert_eq!(settled.total_fs_size, 30);
    assert_eq!(settled.total_fs_size_limit, Limit::Unknown);
}

#[test]
fn test_ledger_file_round_trip_keeps_unknown_limits() {
    let temp = TempDir::new().unwrap();
    let file = LedgerFile::new(temp.path().join("fs_size_rootfs.yaml"));
    file.reset().unwrap();
    file.update(|l| {
        l.record_file("/etc/motd", "core", 12);
        Ok(())
    })
    .unwrap();

    let text = fs::read_to_string(file.path().unwrap()).unwrap();
    assert!(text.contains("totalFSSize: 12"), "{}", text);
    assert!(text.contains("moduleSizeLimit: unknown"), "{}", text);
    assert_eq!(file.load().unwrap().module("core").unwrap().files["/etc/motd"], 12);
}

#[test]
fn test_disabled_ledger_is_inert() {
    let file = LedgerFile::disabled();
    file.reset().unwrap();
    assert_eq!(file.update(|_| Ok(1)).unwrap(), None);
    ledger::enforce(&file, None, "x", false, OverrunSeverity::Error, None).unwrap();
}
