//! Preflight checks for layerfs.
//!
//! Validates host tools and external collaborators before a build.
//! Run with `layerfs preflight` to check everything is ready.

mod environment;
mod host_tools;
mod types;

use anyhow::{bail, Result};

use crate::config::BuildConfig;

pub use types::{CheckResult, CheckStatus, PreflightReport};

pub fn run_preflight(config: &BuildConfig) -> PreflightReport {
    let mut checks = Vec::new();

    tracing::info!("Checking host tools...");
    checks.extend(host_tools::check_host_tools(&config.tools.python));

    tracing::info!("Checking build environment...");
    checks.extend(environment::check_build_environment(config));

    PreflightReport { checks }
}

/// Run preflight and bail if any check fails.
pub fn run_preflight_or_fail(config: &BuildConfig) -> Result<()> {
    let report = run_preflight(config);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}
