//! Build environment checks (collaborator files, output directory).

use std::fs;
use std::path::Path;

use crate::config::BuildConfig;
use crate::packages::{GENERATE_HELPER, INSTALL_HELPER};

use super::types::CheckResult;

pub fn check_build_environment(config: &BuildConfig) -> Vec<CheckResult> {
    let mut results = vec![check_output_dir(&config.output_dir)];

    for helper in [GENERATE_HELPER, INSTALL_HELPER] {
        let path = config.tools.helpers_dir.join(helper);
        results.push(check_file(helper, &path, false));
    }
    results.push(check_file(
        "placement tool",
        &config.tools.placement_tool,
        false,
    ));

    match config.tools.emulator {
        Some(ref emulator) => results.push(check_file("emulator", emulator, true)),
        None => results.push(CheckResult::skip("emulator")),
    }

    match config.size_limits_file {
        Some(ref limits) => results.push(check_file("size limits", limits, true)),
        None => results.push(CheckResult::skip("size limits")),
    }

    results
}

fn check_output_dir(dir: &Path) -> CheckResult {
    const NAME: &str = "output dir writable";
    if let Err(e) = fs::create_dir_all(dir) {
        return CheckResult::fail(NAME, format!("Cannot create {}: {}", dir.display(), e));
    }
    let probe = dir.join(".preflight-test");
    match fs::write(&probe, "test") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            CheckResult::pass(NAME, dir.display().to_string())
        }
        Err(e) => CheckResult::fail(NAME, format!("Cannot write to {}: {}", dir.display(), e)),
    }
}

fn check_file(name: &str, path: &Path, required: bool) -> CheckResult {
    if path.is_file() {
        CheckResult::pass(name, path.display().to_string())
    } else {
        CheckResult::missing(name, format!("{} not found", path.display()), required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildOptions, Environment, ENV_HELPERS_DIR};
    use crate::preflight::types::CheckStatus;
    use tempfile::TempDir;

    #[test]
    fn test_environment_checks() {
        let temp = TempDir::new().unwrap();
        let helpers = temp.path().join("helpers");
        fs::create_dir_all(&helpers).unwrap();
        fs::write(helpers.join(GENERATE_HELPER), "#!/bin/bash\n").unwrap();

        let env = Environment::from_pairs([(ENV_HELPERS_DIR, helpers.to_string_lossy())]);
        let config = BuildConfig::new(BuildOptions::new(temp.path().join("out")), env).unwrap();
        let results = check_build_environment(&config);

        let status = |name: &str| {
            results
                .iter()
                .find(|r| r.name == name)
                .map(|r| r.status)
                .unwrap()
        };
        assert_eq!(status("output dir writable"), CheckStatus::Pass);
        assert_eq!(status(GENERATE_HELPER), CheckStatus::Pass);
        assert_eq!(status(INSTALL_HELPER), CheckStatus::Warn);
        assert_eq!(status("emulator"), CheckStatus::Skip);
    }
}
