//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Build a layer graph
//! - `plan` - Capacity plan for a tree
//! - `show` - Display configuration or a size ledger
//! - `preflight` - Run preflight checks

pub mod build;
mod plan;
mod preflight;
pub mod show;

pub use build::cmd_build;
pub use plan::cmd_plan;
pub use preflight::cmd_preflight;
pub use show::cmd_show;
