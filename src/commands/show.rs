//! Show command - displays information.

use anyhow::Result;
use std::path::Path;

use crate::config::BuildConfig;
use crate::ledger::{Ledger, Limit};

/// Show target for the show command.
pub enum ShowTarget<'a> {
    /// Show configuration
    Config,
    /// Summarize a size ledger
    Ledger(&'a Path),
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &BuildConfig) -> Result<()> {
    match target {
        ShowTarget::Config => config.print(),
        ShowTarget::Ledger(path) => {
            if !path.exists() {
                anyhow::bail!("Ledger {} not found. Build with --generate-size-file yes first.", path.display());
            }
            print_ledger(&Ledger::load(path)?);
        }
    }
    Ok(())
}

fn limit(limit: &Limit) -> String {
    match limit {
        Limit::Unknown => "unknown".to_string(),
        Limit::Bytes(bytes) => bytes.to_string(),
    }
}

fn print_ledger(ledger: &Ledger) {
    println!(
        "Total: {} bytes (limit {}), {} files, {} packages",
        ledger.total_fs_size,
        limit(&ledger.total_fs_size_limit),
        ledger.total_number_of_files,
        ledger.total_number_of_debians
    );
    println!();
    println!("  {:<24} {:>14} {:>14} {:>8} {:>8}", "MODULE", "BYTES", "LIMIT", "FILES", "PKGS");
    for (name, usage) in &ledger.modules {
        println!(
            "  {:<24} {:>14} {:>14} {:>8} {:>8}",
            name,
            usage.module_size,
            limit(&usage.module_size_limit),
            usage.number_of_files,
            usage.number_of_debians
        );
    }
}
