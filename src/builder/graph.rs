//! Resolution of the layer graph before anything is built.
//!
//! A requested layer expands into a chain (root first, requested layer last)
//! by following `Base` while it names another layer config. Associated
//! filesystems of every chain layer expand into their own graphs. All of it
//! is read and validated up front, so a broken reference anywhere fails the
//! run before a workspace is touched.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Environment;
use crate::error::BuildError;
use crate::layer::{BaseRef, LayerDocument, LayerOrigin};

/// One layer with its base already resolved.
#[derive(Debug, Clone)]
pub struct ResolvedLayer {
    pub doc: LayerDocument,
    pub base: Option<BaseRef>,
}

impl ResolvedLayer {
    pub fn output(&self) -> &str {
        self.doc.output()
    }

    /// Starts from prebuilt content rather than from nothing or a parent layer.
    pub fn starts_from_prebuilt(&self) -> bool {
        self.base.as_ref().map(BaseRef::is_prebuilt).unwrap_or(false)
    }

    /// No parent layer config.
    pub fn is_root(&self) -> bool {
        !matches!(self.base, Some(BaseRef::Layer(_)))
    }
}

/// A requested layer, its ancestors and its associated graphs.
#[derive(Debug, Clone)]
pub struct LayerGraph {
    /// Root first; the requested layer is last.
    pub chain: Vec<ResolvedLayer>,
    pub associated: Vec<LayerGraph>,
}

impl LayerGraph {
    pub fn resolve(doc: LayerDocument, env: &Environment) -> Result<Self> {
        let mut stack = Vec::new();
        resolve_graph(doc, env, &mut stack)
    }

    pub fn leaf(&self) -> &ResolvedLayer {
        // A graph always holds the requested layer.
        &self.chain[self.chain.len() - 1]
    }

    /// Any layer of the chain starts from prebuilt content. Every layer of
    /// such a chain extends that base, not only the one extracting it.
    pub fn uses_prebuilt_base(&self) -> bool {
        self.chain.iter().any(ResolvedLayer::starts_from_prebuilt)
    }

    /// Every layer in build order, associated graphs after the chain.
    pub fn layer_count(&self) -> usize {
        self.chain.len() + self.associated.iter().map(LayerGraph::layer_count).sum::<usize>()
    }
}

fn config_path(doc: &LayerDocument) -> Option<PathBuf> {
    match doc.origin {
        LayerOrigin::File(ref path) => Some(normalize(path)),
        LayerOrigin::Stream => None,
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn check_cycle(path: &Path, seen: &[PathBuf]) -> Result<()> {
    if seen.iter().any(|p| p == path) {
        return Err(BuildError::config(format!(
            "Layer config {} is referenced by one of its own descendants",
            path.display()
        ))
        .into());
    }
    Ok(())
}

/// Check what the build would otherwise only find mid-way.
fn validate_paths(doc: &LayerDocument, env: &Environment) -> Result<()> {
    for entry in &doc.config.copy_targets {
        doc.resolve_path(entry.manifest(), env, "CopyTargets")?;
    }
    Ok(())
}

fn resolve_graph(doc: LayerDocument, env: &Environment, stack: &mut Vec<PathBuf>) -> Result<LayerGraph> {
    let depth = stack.len();
    if let Some(path) = config_path(&doc) {
        check_cycle(&path, stack)?;
        stack.push(path);
    }

    let mut chain = Vec::new();
    let mut current = doc;
    loop {
        validate_paths(&current, env)?;
        let base = current.base(env)?;
        let parent = match base {
            Some(BaseRef::Layer(ref path)) => Some(path.clone()),
            _ => None,
        };
        chain.push(ResolvedLayer { doc: current, base });

        let Some(parent) = parent else {
            break;
        };
        let normalized = normalize(&parent);
        check_cycle(&normalized, stack)?;
        stack.push(normalized);
        current = LayerDocument::from_path(&parent)
            .with_context(|| format!("Failed to load parent layer {}", parent.display()))?;
    }
    chain.reverse();

    let mut associated = Vec::new();
    for layer in &chain {
        for path in layer.doc.associated_paths(env)? {
            let doc = LayerDocument::from_path(&path).with_context(|| {
                format!(
                    "Failed to load associated filesystem {} of '{}'",
                    path.display(),
                    layer.output()
                )
            })?;
            associated.push(resolve_graph(doc, env, stack)?);
        }
    }

    stack.truncate(depth);
    Ok(LayerGraph { chain, associated })
}
