//! Base reference resolution.
//!
//! `Base` may name another layer config (built first, into the same tree) or
//! prebuilt content to start from: a directory, a tarball, or an ext image
//! (optionally tarred).

use anyhow::Result;
use regex::Regex;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::LayerOrigin;
use crate::config::Environment;
use crate::error::BuildError;

/// Plain or compressed tarballs.
pub static TAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^ ]+\.tar(\.gz|\.Z|\.bz2|\.xz|\.lzma|)$").expect("tarball pattern is valid")
});
static IMG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^ ]+\.img($|\.tar)").expect("image pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseRef {
    /// Another layer configuration; built recursively.
    Layer(PathBuf),
    Directory(PathBuf),
    Tarball(PathBuf),
    /// An ext image, or a tarball holding one.
    Image(PathBuf),
}

impl BaseRef {
    /// Resolve a raw `Base` value relative to the config that declared it.
    pub fn resolve(raw: &str, origin: &LayerOrigin, env: &Environment) -> Result<Self> {
        let path = resolve_relative(&env.expand(raw), origin, "Base")?;
        Self::classify(&path)
    }

    pub fn classify(path: &Path) -> Result<Self> {
        if path.is_dir() {
            return Ok(Self::Directory(path.to_path_buf()));
        }
        if !path.exists() {
            return Err(BuildError::config(format!("Base '{}' does not exist", path.display())).into());
        }

        let name = path.to_string_lossy();
        if IMG_PATTERN.is_match(&name) {
            return Ok(Self::Image(path.to_path_buf()));
        }
        if TAR_PATTERN.is_match(&name) {
            return Ok(Self::Tarball(path.to_path_buf()));
        }
        if is_text(path) {
            return Ok(Self::Layer(path.to_path_buf()));
        }

        Err(BuildError::config(format!(
            "Unknown Base format '{}'; expected a layer config, directory, tarball or .img",
            path.display()
        ))
        .into())
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Layer(p) | Self::Directory(p) | Self::Tarball(p) | Self::Image(p) => p,
        }
    }

    /// True for prebuilt content, false for a parent layer config.
    pub fn is_prebuilt(&self) -> bool {
        !matches!(self, Self::Layer(_))
    }
}

/// Anchor a relative path at the declaring config's directory.
///
/// A config read from a stream has no directory, so relative paths there are
/// a configuration error.
pub fn resolve_relative(path: &str, origin: &LayerOrigin, field: &str) -> Result<PathBuf> {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        return Ok(candidate);
    }
    match origin {
        LayerOrigin::File(config) => {
            let dir = config.parent().unwrap_or_else(|| Path::new("."));
            Ok(dir.join(candidate))
        }
        LayerOrigin::Stream => Err(BuildError::config(format!(
            "{} '{}' cannot be a relative path when the config is read from a stream",
            field, path
        ))
        .into()),
    }
}

/// Heuristic: the first KiB has no NUL and is valid UTF-8.
fn is_text(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut buf = [0u8; 1024];
    let Ok(n) = file.read(&mut buf) else {
        return false;
    };
    let head = &buf[..n];
    !head.contains(&0) && std::str::from_utf8(head).is_ok()
}
