//! layerfs library exports.
//!
//! The binary in `main.rs` is a thin CLI over these modules; the
//! integration tests drive the builder through a fake [`toolchain::Toolchain`].

pub mod accounts;
pub mod builder;
pub mod capacity;
pub mod commands;
pub mod common;
pub mod config;
pub mod error;
pub mod layer;
pub mod ledger;
pub mod manifest;
pub mod packages;
pub mod placement;
pub mod preflight;
pub mod process;
pub mod rootfs;
pub mod scripts;
pub mod target;
pub mod timing;
pub mod toolchain;

pub use error::BuildError;
