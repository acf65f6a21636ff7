//! Run configuration for layerfs.
//!
//! The process environment (and a `.env` file, via dotenvy) is read exactly
//! once, into [`Environment`]. Together with the command-line options it is
//! folded into an immutable [`BuildConfig`] that every component receives.
//! Nothing else in the crate looks at `std::env`.

use anyhow::Result;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::error::BuildError;

/// Default location of the package helper scripts.
pub const DEFAULT_HELPERS_DIR: &str = "/usr/share/layerfs/helpers";
/// Default content placement tool.
pub const DEFAULT_PLACEMENT_TOOL: &str = "/usr/share/layerfs/copytarget.py";
pub const DEFAULT_PYTHON: &str = "python3";

pub const ENV_KEEP_WORKDIR: &str = "LAYERFS_KEEP_WORKDIR";
pub const ENV_ERROR_ON_SIZE_LIMITS: &str = "LAYERFS_ERROR_ON_SIZE_LIMITS";
pub const ENV_CHECK_PACKAGE_SIZE_LIMITS: &str = "LAYERFS_CHECK_PACKAGE_SIZE_LIMITS";
pub const ENV_HELPERS_DIR: &str = "LAYERFS_HELPERS_DIR";
pub const ENV_PLACEMENT_TOOL: &str = "LAYERFS_PLACEMENT_TOOL";
pub const ENV_PYTHON: &str = "LAYERFS_PYTHON";
pub const ENV_EMULATOR: &str = "LAYERFS_EMULATOR";

/// Snapshot of environment variables taken at startup.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Load `.env` (if present) into the process environment, then snapshot it.
    ///
    /// Variables already set in the environment win over `.env`.
    pub fn capture() -> Self {
        dotenvy::dotenv().ok();
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// A copy with `key` set, for expansions that see build locations.
    pub fn with_var(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut vars = self.vars.clone();
        vars.insert(key.into(), value.into());
        Self { vars }
    }

    /// Expand `$VAR` and `${VAR}` references. Unknown variables are left as-is.
    pub fn expand(&self, input: &str) -> String {
        VAR_REFERENCE
            .replace_all(input, |caps: &regex::Captures| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match self.get(name) {
                    Some(value) => value.to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

/// `$VAR` or `${VAR}`.
static VAR_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("variable reference pattern is valid")
});

/// What happens when a measured footprint exceeds a valid limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrunSeverity {
    Error,
    Warn,
}

/// Locations of external collaborators.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    /// Directory holding `generate_manifest.sh` and `install_packages.sh`.
    pub helpers_dir: PathBuf,
    pub placement_tool: PathBuf,
    pub python: String,
    /// User-mode emulator copied into the target for foreign-arch chroots.
    pub emulator: Option<PathBuf>,
}

/// Options as given on the command line.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub output_dir: PathBuf,
    pub work_dir: Option<PathBuf>,
    pub fs_work_dir: Option<PathBuf>,
    pub generate_intermediate: bool,
    pub generate_size_file: bool,
    pub size_limits_file: Option<PathBuf>,
    pub create_tar: bool,
    pub create_image: bool,
    pub workspace: Option<PathBuf>,
    pub source_type: Option<String>,
    pub keep_workdir: bool,
}

impl BuildOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            work_dir: None,
            fs_work_dir: None,
            generate_intermediate: true,
            generate_size_file: false,
            size_limits_file: None,
            create_tar: false,
            create_image: true,
            workspace: None,
            source_type: None,
            keep_workdir: false,
        }
    }
}

/// Immutable configuration for one build run.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    /// Target tree every layer of a chain builds into.
    pub fs_work_dir: PathBuf,
    pub generate_intermediate: bool,
    /// Maintain the size ledger.
    pub size_budget: bool,
    pub size_limits_file: Option<PathBuf>,
    /// Attribute installed packages into the ledger.
    pub package_budget: bool,
    pub overrun: OverrunSeverity,
    pub create_tar: bool,
    pub create_image: bool,
    pub workspace: Option<PathBuf>,
    pub source_type: Option<String>,
    pub keep_workdir: bool,
    pub tools: ToolPaths,
    pub env: Environment,
}

impl BuildConfig {
    pub fn new(options: BuildOptions, env: Environment) -> Result<Self> {
        if options.size_limits_file.is_some() && !options.generate_size_file {
            return Err(BuildError::config(
                "--size-limits-file can only be used together with --generate-size-file",
            )
            .into());
        }

        let work_dir = options
            .work_dir
            .unwrap_or_else(|| options.output_dir.join("layerfs-work"));
        let fs_work_dir = options
            .fs_work_dir
            .unwrap_or_else(|| work_dir.join("targetfs"));

        let overrun = match env.get(ENV_ERROR_ON_SIZE_LIMITS) {
            Some("false") => OverrunSeverity::Warn,
            _ => OverrunSeverity::Error,
        };
        let package_budget = env.get(ENV_CHECK_PACKAGE_SIZE_LIMITS) != Some("no");
        let keep_workdir = options.keep_workdir || env.get(ENV_KEEP_WORKDIR) == Some("1");

        let tools = ToolPaths {
            helpers_dir: env
                .get(ENV_HELPERS_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HELPERS_DIR)),
            placement_tool: env
                .get(ENV_PLACEMENT_TOOL)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PLACEMENT_TOOL)),
            python: env.get(ENV_PYTHON).unwrap_or(DEFAULT_PYTHON).to_string(),
            emulator: env.get(ENV_EMULATOR).map(PathBuf::from),
        };

        Ok(Self {
            output_dir: options.output_dir,
            work_dir,
            fs_work_dir,
            generate_intermediate: options.generate_intermediate,
            size_budget: options.generate_size_file,
            size_limits_file: options.size_limits_file,
            package_budget,
            overrun,
            create_tar: options.create_tar,
            create_image: options.create_image,
            workspace: options.workspace,
            source_type: options.source_type,
            keep_workdir,
            tools,
            env,
        })
    }

    /// Configuration for the `index`-th associated filesystem build.
    ///
    /// Shares every option but gets its own workspace below this one.
    pub fn for_associated(&self, index: usize) -> Self {
        let work_dir = self
            .work_dir
            .join("AssociatedBuilds")
            .join(index.to_string());
        let fs_work_dir = work_dir.join("targetfs");
        Self {
            work_dir,
            fs_work_dir,
            ..self.clone()
        }
    }

    /// Scratch mount point for image population and image bases.
    pub fn mount_dir(&self) -> PathBuf {
        self.work_dir.join("rootfs_mount")
    }

    pub fn output_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }

    /// Print configuration for `show config`.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  Output dir:            {}", self.output_dir.display());
        println!("  Work dir:              {}", self.work_dir.display());
        println!("  Filesystem work dir:   {}", self.fs_work_dir.display());
        println!("  Intermediate outputs:  {}", yes_no(self.generate_intermediate));
        println!("  Size ledger:           {}", yes_no(self.size_budget));
        println!("  Package attribution:   {}", yes_no(self.package_budget));
        println!(
            "  Size limits file:      {}",
            display_opt(self.size_limits_file.as_deref())
        );
        println!(
            "  Overruns:              {}",
            match self.overrun {
                OverrunSeverity::Error => "error",
                OverrunSeverity::Warn => "warn",
            }
        );
        println!("  Tarball output:        {}", yes_no(self.create_tar));
        println!("  Image output:          {}", yes_no(self.create_image));
        println!("  Keep work dir:         {}", yes_no(self.keep_workdir));
        println!("  Helpers dir:           {}", self.tools.helpers_dir.display());
        println!("  Placement tool:        {}", self.tools.placement_tool.display());
        println!(
            "  Emulator:              {}",
            display_opt(self.tools.emulator.as_deref())
        );
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn display_opt(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_derive_from_output_dir() {
        let config =
            BuildConfig::new(BuildOptions::new("/out"), Environment::default()).unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/out/layerfs-work"));
        assert_eq!(config.fs_work_dir, PathBuf::from("/out/layerfs-work/targetfs"));
        assert_eq!(config.overrun, OverrunSeverity::Error);
        assert!(config.package_budget);
        assert!(config.create_image);
        assert!(!config.create_tar);
    }

    #[test]
    fn test_limits_without_ledger_rejected() {
        let mut options = BuildOptions::new("/out");
        options.size_limits_file = Some(PathBuf::from("/limits.yaml"));
        let err = BuildConfig::new(options, Environment::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Config(_))
        ));
    }

    #[test]
    fn test_environment_switches() {
        let env = Environment::from_pairs([
            (ENV_ERROR_ON_SIZE_LIMITS, "false"),
            (ENV_CHECK_PACKAGE_SIZE_LIMITS, "no"),
            (ENV_KEEP_WORKDIR, "1"),
        ]);
        let config = BuildConfig::new(BuildOptions::new("/out"), env).unwrap();
        assert_eq!(config.overrun, OverrunSeverity::Warn);
        assert!(!config.package_budget);
        assert!(config.keep_workdir);
    }

    #[test]
    fn test_associated_workspace_is_nested() {
        let config =
            BuildConfig::new(BuildOptions::new("/out"), Environment::default()).unwrap();
        let assoc = config.for_associated(1);
        assert_eq!(
            assoc.fs_work_dir,
            PathBuf::from("/out/layerfs-work/AssociatedBuilds/1/targetfs")
        );
        assert_eq!(assoc.output_dir, config.output_dir);
    }

    #[test]
    fn test_expand_variables() {
        let env = Environment::from_pairs([("TOP", "/src"), ("FLAVOR", "dev")]);
        assert_eq!(env.expand("$TOP/layers/${FLAVOR}.json"), "/src/layers/dev.json");
        assert_eq!(env.expand("$MISSING/x"), "$MISSING/x");
        assert_eq!(env.expand("plain"), "plain");
    }

    #[test]
    #[serial]
    fn test_capture_reads_process_environment() {
        std::env::set_var(ENV_PYTHON, "/opt/python3.11");
        let env = Environment::capture();
        std::env::remove_var(ENV_PYTHON);
        let config = BuildConfig::new(BuildOptions::new("/out"), env).unwrap();
        assert_eq!(config.tools.python, "/opt/python3.11");
    }
}
