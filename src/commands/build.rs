//! Build command - builds a layer and everything it depends on.

use anyhow::{Context, Result};
use std::path::Path;

use crate::builder;
use crate::config::BuildConfig;
use crate::layer::LayerDocument;
use crate::preflight;
use crate::timing::Timer;
use crate::toolchain::HostToolchain;

/// `-i STDIN` reads the layer config from standard input.
pub const STDIN_INPUT: &str = "STDIN";

pub fn load_document(input: &str) -> Result<LayerDocument> {
    if input == STDIN_INPUT {
        LayerDocument::from_reader(std::io::stdin().lock())
    } else {
        LayerDocument::from_path(Path::new(input))
    }
}

/// Execute the build command.
pub fn cmd_build(input: &str, config: &BuildConfig, skip_preflight: bool) -> Result<()> {
    let doc = load_document(input)?;
    config.print();
    println!();

    if !skip_preflight {
        preflight::run_preflight_or_fail(config)?;
    }

    let timer = Timer::start(format!("Build of '{}'", doc.output()));
    let mut toolchain = HostToolchain::new(config.tools.clone());
    let report = builder::build(config, &mut toolchain, doc)
        .with_context(|| format!("Build from {} failed", input))?;
    timer.finish();

    println!("\n=== Build Complete ===");
    for artifact in &report.artifacts {
        println!("  {}", artifact.display());
    }
    Ok(())
}
