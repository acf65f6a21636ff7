//! Content placement tool invocations.
//!
//! Each `CopyTargets` entry names a placement manifest. YAML manifests are
//! handed to the placement tool together with the target tree, a workspace
//! and a source type; anything else is treated as a legacy shell script.
//!
//! The tool's options form an ordered map. An entry may add options (which
//! overwrite same-named ones) or delete them by name.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config::{BuildConfig, Environment};
use crate::layer::{CopyTargetEntry, LayerDocument};
use crate::process::Cmd;

const DEFAULT_SOURCE_TYPE: &str = "file";

/// Ordered option map; `None` marks a flag without value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementArgs(Vec<(String, Option<String>)>);

impl PlacementArgs {
    /// Parse `--opt value --flag` style tokens. Stray values are dropped.
    pub fn parse(text: &str) -> Self {
        let mut args = Self::default();
        args.add(text);
        args
    }

    pub fn set(&mut self, option: &str, value: Option<String>) {
        match self.0.iter_mut().find(|(k, _)| k == option) {
            Some(entry) => entry.1 = value,
            None => self.0.push((option.to_string(), value)),
        }
    }

    pub fn add(&mut self, text: &str) {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        for (i, token) in tokens.iter().enumerate() {
            if !token.starts_with('-') {
                continue;
            }
            let value = tokens
                .get(i + 1)
                .filter(|next| !next.starts_with('-'))
                .map(|next| next.to_string());
            self.set(token, value);
        }
    }

    /// Remove every option named in `text`.
    pub fn delete(&mut self, text: &str) {
        let names: Vec<&str> = text.split_whitespace().collect();
        self.0.retain(|(k, _)| !names.contains(&k.as_str()));
    }

    pub fn get(&self, option: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|(k, _)| k == option)
            .map(|(_, v)| v.as_deref())
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.0.len() * 2);
        for (option, value) in &self.0 {
            out.push(option.clone());
            if let Some(value) = value {
                out.push(value.clone());
            }
        }
        out
    }
}

/// Default options for every entry of a layer.
pub fn base_args(filesystem_type: &str, ledger: Option<&Path>) -> PlacementArgs {
    let mut args = PlacementArgs::default();
    args.set("--filesystem-type", Some(filesystem_type.to_string()));
    if let Some(ledger) = ledger {
        args.set(
            &format!("--target-size-file={}", ledger.display()),
            None,
        );
    }
    args
}

/// One resolved placement run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementInvocation {
    Tool {
        python: String,
        tool: PathBuf,
        tree: PathBuf,
        workspace: String,
        manifest: PathBuf,
        source_type: String,
        args: Vec<String>,
    },
    /// Non-YAML entries run as `bash <script> <tree>`.
    Script { script: PathBuf, tree: PathBuf },
}

impl PlacementInvocation {
    pub fn command(&self) -> Cmd {
        match self {
            PlacementInvocation::Tool {
                python,
                tool,
                tree,
                workspace,
                manifest,
                source_type,
                args,
            } => Cmd::new(python)
                .arg_path(tool)
                .arg_path(tree)
                .arg(workspace)
                .arg_path(manifest)
                .args(["--source-type", source_type.as_str()])
                .args(args)
                .error_msg(format!("Placement of {} failed", manifest.display())),
            PlacementInvocation::Script { script, tree } => Cmd::new("bash")
                .arg_path(script)
                .arg_path(tree)
                .error_msg(format!("Placement script {} failed", script.display())),
        }
    }

    pub fn run(&self) -> Result<()> {
        if let PlacementInvocation::Script { script, .. } = self {
            tracing::warn!(
                "Placement entry {} is a shell script; switch it to a YAML manifest",
                script.display()
            );
        }
        self.command().run_interactive()?;
        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    path.to_string_lossy().contains(".yaml")
}

/// Resolve every `CopyTargets` entry of `doc` into an invocation.
pub fn plan(
    doc: &LayerDocument,
    config: &BuildConfig,
    env: &Environment,
    tree: &Path,
    ledger: Option<&Path>,
) -> Result<Vec<PlacementInvocation>> {
    let defaults = base_args(doc.config.filesystem_type(), ledger);
    let default_workspace = config
        .workspace
        .as_ref()
        .map(|w| w.to_string_lossy().into_owned())
        .unwrap_or_default();
    let default_source = config
        .source_type
        .clone()
        .unwrap_or_else(|| DEFAULT_SOURCE_TYPE.to_string());

    let mut invocations = Vec::with_capacity(doc.config.copy_targets.len());
    for entry in &doc.config.copy_targets {
        let manifest = doc.resolve_path(entry.manifest(), env, "CopyTargets")?;
        if !is_yaml(&manifest) {
            invocations.push(PlacementInvocation::Script {
                script: manifest,
                tree: tree.to_path_buf(),
            });
            continue;
        }

        let mut args = defaults.clone();
        let (workspace, source_type) = match entry {
            CopyTargetEntry::Manifest(_) => (default_workspace.clone(), default_source.clone()),
            CopyTargetEntry::Detailed {
                workspace,
                source_type,
                args: edits,
                ..
            } => {
                if let Some(edits) = edits {
                    if let Some(ref add) = edits.add {
                        args.add(&env.expand(add));
                    }
                    if let Some(ref del) = edits.del {
                        args.delete(&env.expand(del));
                    }
                }
                (
                    workspace
                        .as_deref()
                        .map(|w| env.expand(w))
                        .unwrap_or_else(|| default_workspace.clone()),
                    source_type
                        .as_deref()
                        .map(|s| env.expand(s))
                        .unwrap_or_else(|| default_source.clone()),
                )
            }
        };

        invocations.push(PlacementInvocation::Tool {
            python: config.tools.python.clone(),
            tool: config.tools.placement_tool.clone(),
            tree: tree.to_path_buf(),
            workspace,
            manifest,
            source_type,
            args: args.to_args(),
        });
    }
    Ok(invocations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildOptions;
    use crate::layer::LayerOrigin;

    #[test]
    fn test_add_overrides_and_keeps_order() {
        let mut args = PlacementArgs::parse("--filesystem-type standard --verbose");
        args.add("--verbose --filesystem-type qnx --strip yes");
        assert_eq!(
            args.to_args(),
            ["--filesystem-type", "qnx", "--verbose", "--strip", "yes"]
        );
    }

    #[test]
    fn test_delete_by_name() {
        let mut args = base_args("standard", Some(Path::new("/out/fs_size_x.yaml")));
        assert_eq!(args.get("--target-size-file=/out/fs_size_x.yaml"), Some(None));
        args.delete("--target-size-file=/out/fs_size_x.yaml --missing");
        assert_eq!(args.to_args(), ["--filesystem-type", "standard"]);
    }

    #[test]
    fn test_plan_entries() {
        let doc = LayerDocument::parse(
            r#"{
                "Output": "app", "OS": "Linux",
                "CopyTargets": [
                    "/m/base.yaml",
                    {"Manifest": "/m/extra.yaml", "SourceType": "tarball",
                     "NvWorkspace": "$WS/extra", "Args": {"Add": "--strip", "Del": "--filesystem-type"}},
                    "/m/legacy.sh"
                ]
            }"#,
            LayerOrigin::Stream,
        )
        .unwrap();
        let mut options = BuildOptions::new("/out");
        options.workspace = Some(PathBuf::from("/ws"));
        let env = Environment::from_pairs([("WS", "/alt")]);
        let config = BuildConfig::new(options, env.clone()).unwrap();

        let runs = plan(&doc, &config, &env, Path::new("/t"), None).unwrap();
        assert_eq!(
            runs[0].command().describe(),
            "python3 /usr/share/layerfs/copytarget.py /t /ws /m/base.yaml --source-type file --filesystem-type standard"
        );
        assert_eq!(
            runs[1].command().describe(),
            "python3 /usr/share/layerfs/copytarget.py /t /alt/extra /m/extra.yaml --source-type tarball --strip"
        );
        assert_eq!(runs[2].command().describe(), "bash /m/legacy.sh /t");
    }
}
