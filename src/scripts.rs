//! Pre- and post-install scripts.
//!
//! Scripts are bash scripts. `WORK_DIR` and `FILESYSTEM_WORK_DIR` are both
//! available for expansion in the script path and exported to host scripts.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::in_tree;
use crate::config::Environment;
use crate::layer::{OrderedMap, ScriptLocation};
use crate::process::Cmd;
use crate::target::Chroot;

pub const WORK_DIR_VAR: &str = "WORK_DIR";
pub const FILESYSTEM_WORK_DIR_VAR: &str = "FILESYSTEM_WORK_DIR";

/// A script ready to run: path expanded, location known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRun {
    pub path: PathBuf,
    pub location: ScriptLocation,
}

/// Environment scripts are expanded against.
pub fn script_env(env: &Environment, work_dir: &Path, tree: &Path) -> Environment {
    env.with_var(WORK_DIR_VAR, work_dir.to_string_lossy())
        .with_var(FILESYSTEM_WORK_DIR_VAR, tree.to_string_lossy())
}

/// Expand the script paths of one section, in declaration order.
pub fn plan(scripts: &OrderedMap<ScriptLocation>, env: &Environment) -> Vec<ScriptRun> {
    scripts
        .iter()
        .map(|(script, location)| ScriptRun {
            path: PathBuf::from(env.expand(script)),
            location: *location,
        })
        .collect()
}

/// Run one script at its location.
pub fn run(chroot: &mut Chroot, script: &ScriptRun, work_dir: &Path) -> Result<()> {
    let path = script.path.to_string_lossy().into_owned();
    tracing::info!("Running {:?} script {}", script.location, path);

    match script.location {
        ScriptLocation::Host => {
            Cmd::new("bash")
                .arg(&path)
                .env(WORK_DIR_VAR, work_dir.to_string_lossy())
                .env(FILESYSTEM_WORK_DIR_VAR, chroot.root().to_string_lossy())
                .error_msg(format!("Host script {} failed", path))
                .run_interactive()?;
        }
        ScriptLocation::Target => {
            chroot
                .run_interactive("bash", [path.as_str()])
                .with_context(|| format!("Target script {} failed", path))?;
        }
        ScriptLocation::TargetCopy => {
            let name = script
                .path
                .file_name()
                .with_context(|| format!("Script path {} has no file name", path))?;
            let tmp = in_tree(chroot.root(), "/tmp");
            fs::create_dir_all(&tmp)?;
            let copied = tmp.join(name);
            fs::copy(&script.path, &copied)
                .with_context(|| format!("Failed to copy {} into the target", path))?;

            let inside = format!("/tmp/{}", name.to_string_lossy());
            let result = chroot
                .run_interactive("bash", [inside.as_str()])
                .with_context(|| format!("Copied script {} failed", path));
            fs::remove_file(&copied)
                .with_context(|| format!("Failed to remove {}", copied.display()))?;
            result?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_expands_build_locations() {
        let scripts: OrderedMap<ScriptLocation> = serde_json::from_value(json!({
            "$FILESYSTEM_WORK_DIR/opt/setup.sh": "target",
            "${SRC}/fix.sh": "host"
        }))
        .unwrap();
        let env = script_env(
            &Environment::from_pairs([("SRC", "/src")]),
            Path::new("/w"),
            Path::new("/w/targetfs"),
        );

        let runs = plan(&scripts, &env);
        assert_eq!(runs[0].path, PathBuf::from("/w/targetfs/opt/setup.sh"));
        assert_eq!(runs[0].location, ScriptLocation::Target);
        assert_eq!(runs[1].path, PathBuf::from("/src/fix.sh"));
    }

    #[test]
    fn test_host_script_sees_locations() {
        let temp = tempfile::TempDir::new().unwrap();
        let script = temp.path().join("record.sh");
        fs::write(
            &script,
            "echo \"$WORK_DIR $FILESYSTEM_WORK_DIR\" > \"$WORK_DIR/seen\"\n",
        )
        .unwrap();

        let mut chroot = Chroot::new(temp.path().join("tree"), None);
        let run_spec = ScriptRun {
            path: script,
            location: ScriptLocation::Host,
        };
        run(&mut chroot, &run_spec, temp.path()).unwrap();

        let seen = fs::read_to_string(temp.path().join("seen")).unwrap();
        assert_eq!(
            seen.trim(),
            format!("{} {}", temp.path().display(), temp.path().join("tree").display())
        );
        assert!(!chroot.is_prepared());
    }
}
