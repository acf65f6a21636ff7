//! Layer graph builder.
//!
//! [`build`] resolves the requested layer's whole graph, then builds the
//! chain into one target tree. A layer whose `Base` is another layer config
//! builds that parent completely from inside its own `PRE_BUILD`, so phases
//! nest: the child's `PRE_BUILD` starts first and the parent reaches `DONE`
//! before the child enters `BUILD`.
//!
//! ```text
//! app   PRE_BUILD ─┐                                     ┌─ BUILD POST_BUILD OUTPUT DONE
//! base             └─ PRE_BUILD BUILD POST_BUILD [OUTPUT] DONE
//! ```
//!
//! Associated filesystems are built afterwards, each in its own workspace,
//! against their own ledgers and manifests.

pub mod graph;
pub mod phase;
pub mod workspace;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::capacity::{self, DEFAULT_RESERVE_PERCENT};
use crate::config::{BuildConfig, Environment};
use crate::layer::{BaseRef, LayerDocument, PackageEntry};
use crate::ledger::{self, attribution, LedgerFile};
use crate::manifest::{self, ParentManifest};
use crate::placement;
use crate::rootfs::{self, SourcesBackup};
use crate::scripts;
use crate::timing::Timer;
use crate::toolchain::Toolchain;

pub use graph::{LayerGraph, ResolvedLayer};
pub use phase::{Phase, PhaseTracker};
pub use workspace::Workspace;

/// Why a layer is being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The requested layer.
    Leaf,
    /// An ancestor of the requested layer, built on the way.
    Intermediate,
    /// The top layer of an associated filesystem graph.
    Associated,
}

impl Role {
    fn is_top(self) -> bool {
        !matches!(self, Role::Intermediate)
    }
}

/// One phase transition, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseEvent {
    pub layer: String,
    pub phase: Phase,
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub events: Vec<PhaseEvent>,
    /// Files written to the output directory.
    pub artifacts: Vec<PathBuf>,
}

impl BuildReport {
    /// Phases one layer went through.
    pub fn phases_of(&self, layer: &str) -> Vec<Phase> {
        self.events
            .iter()
            .filter(|e| e.layer == layer)
            .map(|e| e.phase)
            .collect()
    }
}

/// Build `doc` and everything it depends on.
pub fn build<T: Toolchain>(config: &BuildConfig, toolchain: &mut T, doc: LayerDocument) -> Result<BuildReport> {
    let graph = LayerGraph::resolve(doc, &config.env)?;
    tracing::info!(
        "Building '{}' ({} layer(s) in the graph)",
        graph.leaf().output(),
        graph.layer_count()
    );

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("Failed to create {}", config.output_dir.display()))?;

    let mut builder = Builder {
        toolchain,
        report: BuildReport::default(),
    };
    builder.build_graph(config, &graph, Role::Leaf)?;
    Ok(builder.report)
}

struct Builder<'a, T: Toolchain> {
    toolchain: &'a mut T,
    report: BuildReport,
}

/// State shared by the layers of one chain.
struct ChainContext<'c> {
    config: &'c BuildConfig,
    graph: &'c LayerGraph,
    workspace: Workspace,
    env: Environment,
    top_role: Role,
}

impl ChainContext<'_> {
    fn role(&self, index: usize) -> Role {
        if index + 1 == self.graph.chain.len() {
            self.top_role
        } else {
            Role::Intermediate
        }
    }

    fn ledger(&self, layer: &ResolvedLayer) -> LedgerFile {
        if !self.config.size_budget {
            return LedgerFile::disabled();
        }
        let name = if self.extends_base() {
            ledger::layer_ledger_name(layer.output())
        } else {
            ledger::shared_ledger_name(self.graph.leaf().output())
        };
        LedgerFile::new(self.config.output_path(&name))
    }

    /// Per-layer ledgers are all reset; a shared one only by the root.
    fn resets_ledger(&self, index: usize) -> bool {
        self.extends_base() || self.graph.chain[index].is_root()
    }

    /// Base packages are skipped and only relative limits apply, for every
    /// layer above prebuilt content.
    fn extends_base(&self) -> bool {
        self.graph.uses_prebuilt_base()
    }

    fn emits_output(&self, role: Role) -> bool {
        role.is_top() || self.config.generate_intermediate
    }
}

impl<T: Toolchain> Builder<'_, T> {
    fn build_graph(&mut self, config: &BuildConfig, graph: &LayerGraph, role: Role) -> Result<()> {
        let workspace = Workspace::new(config);
        workspace.prepare()?;

        let ctx = ChainContext {
            config,
            graph,
            env: scripts::script_env(&config.env, &workspace.work_dir, &workspace.tree),
            workspace,
            top_role: role,
        };

        let result = self.build_chain(&ctx);
        self.toolchain.release_tree(&ctx.workspace.tree);
        ctx.workspace.cleanup();
        result
    }

    fn build_chain(&mut self, ctx: &ChainContext) -> Result<()> {
        let top = ctx.graph.chain.len() - 1;
        self.build_layer(ctx, top)?;

        for (i, associated) in ctx.graph.associated.iter().enumerate() {
            tracing::info!(
                "Building associated filesystem '{}'",
                associated.leaf().output()
            );
            let config = ctx.config.for_associated(i);
            self.build_graph(&config, associated, Role::Associated)
                .with_context(|| {
                    format!("Associated filesystem '{}' failed", associated.leaf().output())
                })?;
        }
        Ok(())
    }

    fn enter(&mut self, tracker: &mut PhaseTracker, layer: &str, phase: Phase) -> Result<()> {
        tracker.enter(phase)?;
        self.report.events.push(PhaseEvent {
            layer: layer.to_string(),
            phase,
        });
        Ok(())
    }

    /// Build chain layer `index` through all its phases; returns its frozen manifest.
    fn build_layer(&mut self, ctx: &ChainContext, index: usize) -> Result<Map<String, Value>> {
        let layer = &ctx.graph.chain[index];
        let name = layer.output().to_string();
        let role = ctx.role(index);
        let output = ctx.emits_output(role);
        let ledger = ctx.ledger(layer);
        let timer = Timer::start(format!("Layer '{}'", name));
        let mut tracker = PhaseTracker::new(&name, !output);

        self.enter(&mut tracker, &name, Phase::PreBuild)?;
        let (parent, sources) = self
            .pre_build(ctx, index, &ledger)
            .with_context(|| format!("{} of '{}' failed", Phase::PreBuild, name))?;

        self.enter(&mut tracker, &name, Phase::Build)?;
        self.build_content(ctx, layer, &ledger)
            .with_context(|| format!("{} of '{}' failed", Phase::Build, name))?;

        self.enter(&mut tracker, &name, Phase::PostBuild)?;
        let frozen = self
            .post_build(ctx, layer, role, &ledger, parent.as_ref(), sources.as_ref())
            .with_context(|| format!("{} of '{}' failed", Phase::PostBuild, name))?;

        if output {
            self.enter(&mut tracker, &name, Phase::Output)?;
            self.emit_output(ctx, layer)
                .with_context(|| format!("{} of '{}' failed", Phase::Output, name))?;
        } else {
            tracing::info!("Skipping output of intermediate layer '{}'", name);
        }

        self.enter(&mut tracker, &name, Phase::Done)?;
        timer.finish();
        Ok(frozen)
    }

    fn pre_build(
        &mut self,
        ctx: &ChainContext,
        index: usize,
        ledger: &LedgerFile,
    ) -> Result<(Option<ParentManifest>, Option<SourcesBackup>)> {
        let layer = &ctx.graph.chain[index];
        let tree = &ctx.workspace.tree;

        if ctx.resets_ledger(index) {
            ledger.reset()?;
        }

        let parent = match layer.base {
            None => None,
            Some(BaseRef::Layer(_)) => {
                let parent_layer = &ctx.graph.chain[index - 1];
                tracing::info!("'{}' builds on layer '{}'", layer.output(), parent_layer.output());
                let doc = self.build_layer(ctx, index - 1)?;
                let reference = ctx
                    .config
                    .output_path(&manifest::manifest_file_name(parent_layer.output()));
                Some(ParentManifest {
                    doc,
                    reference: Some(reference.to_string_lossy().into_owned()),
                })
            }
            Some(ref base) => {
                self.toolchain
                    .extract_base(base, tree, &ctx.workspace.mount_dir, &ctx.workspace.work_dir)?;
                match manifest::find_published(tree) {
                    Some(path) => {
                        tracing::info!("Base carries manifest {}", path.display());
                        Some(ParentManifest {
                            doc: manifest::load(&path)?,
                            reference: None,
                        })
                    }
                    None => None,
                }
            }
        };

        let sources = if layer.doc.config.mirrors.is_empty() {
            None
        } else {
            rootfs::rewrite_sources(tree, &layer.doc.config.mirrors)?
        };

        for script in scripts::plan(&layer.doc.config.pre_installs, &ctx.env) {
            self.toolchain
                .run_script(&script, tree, &ctx.workspace.work_dir)?;
        }

        Ok((parent, sources))
    }

    fn build_content(&mut self, ctx: &ChainContext, layer: &ResolvedLayer, ledger: &LedgerFile) -> Result<()> {
        let tree = &ctx.workspace.tree;
        let config = &layer.doc.config;

        let names = config.package_names();
        if !names.is_empty() {
            let record = ledger.is_enabled() && ctx.config.package_budget;
            if ledger.is_enabled() && !ctx.config.package_budget {
                tracing::warn!("Package size budgeting is off; packages of '{}' are not attributed", layer.output());
            }
            if let Some(metadata) = self.toolchain.install_packages(tree, &names, record)? {
                let seeds: Vec<(String, String)> = config
                    .debian_packages
                    .iter()
                    .filter_map(|entry| match entry {
                        PackageEntry::Assigned { .. } => entry
                            .module()
                            .map(|module| (entry.package().to_string(), module)),
                        PackageEntry::Name(_) => None,
                    })
                    .collect();
                let extends_base = ctx.extends_base();
                ledger.update(|l| attribution::record_packages(l, &metadata, &seeds, tree, extends_base))?;
            }
        }

        self.toolchain.apply_accounts(tree, config)?;

        if let Some(ref hostname) = config.hostname {
            rootfs::set_hostname(tree, hostname)?;
        }

        for invocation in placement::plan(&layer.doc, ctx.config, &ctx.env, tree, ledger.path())? {
            self.toolchain.place_content(&invocation)?;
        }
        Ok(())
    }

    fn post_build(
        &mut self,
        ctx: &ChainContext,
        layer: &ResolvedLayer,
        role: Role,
        ledger: &LedgerFile,
        parent: Option<&ParentManifest>,
        sources: Option<&SourcesBackup>,
    ) -> Result<Map<String, Value>> {
        let tree = &ctx.workspace.tree;
        let config = &layer.doc.config;

        if let Some(backup) = sources {
            rootfs::restore_sources(tree, backup)?;
        }

        for script in scripts::plan(&config.post_installs, &ctx.env) {
            self.toolchain
                .run_script(&script, tree, &ctx.workspace.work_dir)?;
        }

        let packages = self.toolchain.installed_packages(tree)?;
        // Nothing below needs the chroot, and bind mounts must not end up in outputs.
        self.toolchain.release_tree(tree);

        let frozen = manifest::freeze(&layer.doc.raw, parent, &packages);
        let manifest_path = ctx
            .config
            .output_path(&manifest::manifest_file_name(layer.output()));
        manifest::write(&frozen, &manifest_path)?;
        manifest::publish(tree, &manifest_path)?;
        self.report.artifacts.push(manifest_path);

        rootfs::append_mounts(tree, &config.mounts)?;
        rootfs::apply_include(tree, &config.filesystem_include)?;
        rootfs::apply_cleanup(tree, &config.filesystem_cleanup);

        if ledger.is_enabled() && ctx.emits_output(role) {
            let measured = self.toolchain.measure_tree(tree);
            ledger::enforce(
                ledger,
                ctx.config.size_limits_file.as_deref(),
                layer.output(),
                ctx.extends_base(),
                ctx.config.overrun,
                measured,
            )?;
            if let Some(path) = ledger.path() {
                self.report.artifacts.push(path.to_path_buf());
            }
        }

        Ok(frozen)
    }

    fn emit_output(&mut self, ctx: &ChainContext, layer: &ResolvedLayer) -> Result<()> {
        let tree = &ctx.workspace.tree;
        let output = ctx.config.output_path(layer.output());

        if ctx.config.create_tar {
            let tarball = self.toolchain.compress_tree(tree, &output)?;
            self.report.artifacts.push(tarball);
        }

        if ctx.config.create_image {
            let image = with_suffix(&output, ".img");
            let declared = layer.doc.config.image_size()?;
            let block_size = capacity::select_category(declared)?.block_size;
            let blocks = capacity::tree_blocks(tree, block_size)?;
            let plan = capacity::plan(blocks, declared, DEFAULT_RESERVE_PERCENT)
                .with_context(|| format!("'{}' does not fit its ImageSize", layer.output()))?;
            tracing::info!(
                "'{}' needs {} of {} declared bytes",
                layer.output(),
                plan.required_bytes(),
                declared
            );
            self.toolchain
                .create_image(&plan, &image, tree, &ctx.workspace.mount_dir)?;
            self.report.artifacts.push(image);
        }

        let listing = with_suffix(&output, ".manifest");
        if self.toolchain.package_listing(tree, &listing)? {
            self.report.artifacts.push(listing);
        }
        self.toolchain.release_tree(tree);
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
