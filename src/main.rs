//! layerfs - layered filesystem image builder.
//!
//! Builds ext4 images and tarballs for embedded targets from JSON layer
//! configs, stacking each layer on its base:
//! - parent layers are built first, into the same tree
//! - every layer leaves a frozen manifest next to its outputs
//! - optional per-module size budgets are checked at each layer

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use layerfs::capacity::DEFAULT_RESERVE_PERCENT;
use layerfs::commands;
use layerfs::config::{BuildConfig, BuildOptions, Environment};

#[derive(Parser)]
#[command(name = "layerfs")]
#[command(about = "Layered filesystem image builder")]
#[command(
    after_help = "QUICK START:\n  layerfs preflight -o out          Check host tools\n  layerfs build -i app.json -o out  Build a layer and its bases\n  layerfs show ledger out/fs_size_app.yaml"
)]
struct Cli {
    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    Yes,
    No,
}

impl Toggle {
    fn on(self) -> bool {
        matches!(self, Toggle::Yes)
    }
}

/// Options shared by every command that needs a build configuration.
#[derive(clap::Args)]
struct OutputArgs {
    /// Output directory for images, manifests and ledgers
    #[arg(short, long)]
    output: PathBuf,

    /// Working directory (default: <output>/layerfs-work)
    #[arg(long = "working-directory")]
    work_dir: Option<PathBuf>,

    /// Target tree directory (default: <working-directory>/targetfs)
    #[arg(short = 'f', long = "filesystem-working-directory")]
    fs_work_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a layer (and its base layers)
    Build {
        /// Layer config path, or STDIN
        #[arg(short, long)]
        input: String,

        #[command(flatten)]
        output: OutputArgs,

        /// Emit outputs for intermediate layers
        #[arg(long, value_enum, default_value = "yes")]
        generate_intermediate: Toggle,

        /// Maintain the per-module size ledger
        #[arg(long = "generate-size-file", value_enum, default_value = "no")]
        generate_size_file: Toggle,

        /// Size limits document (requires --generate-size-file yes)
        #[arg(long)]
        size_limits_file: Option<PathBuf>,

        /// Emit <output>.tar.bz2
        #[arg(long, value_enum, default_value = "no")]
        create_tar: Toggle,

        /// Emit <output>.img
        #[arg(long, value_enum, default_value = "yes")]
        create_image: Toggle,

        /// Default workspace for content placement entries
        #[arg(short = 'w', long = "nv-workspace")]
        workspace: Option<PathBuf>,

        /// Default source type for content placement entries
        #[arg(long = "copytarget-source-type")]
        source_type: Option<String>,

        /// Keep the working directory after the build
        #[arg(long)]
        keep_workdir: bool,

        /// Do not run preflight checks first
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Print the image capacity plan for an existing tree
    Plan {
        /// Content tree to measure
        #[arg(long)]
        tree: PathBuf,

        /// Declared image size in bytes
        #[arg(long)]
        image_size: u64,

        /// Reserve on top of the tree, in percent
        #[arg(long, default_value_t = DEFAULT_RESERVE_PERCENT)]
        reserve_percent: u64,
    },

    /// Run preflight checks (host tools and collaborators)
    Preflight {
        #[command(flatten)]
        output: OutputArgs,

        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show the effective configuration
    Config {
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Summarize a size ledger file
    Ledger { path: PathBuf },
}

fn options(args: OutputArgs) -> BuildOptions {
    let mut options = BuildOptions::new(args.output);
    options.work_dir = args.work_dir;
    options.fs_work_dir = args.fs_work_dir;
    options
}

fn run(cli: Cli, env: Environment) -> anyhow::Result<()> {
    match cli.command {
        Commands::Build {
            input,
            output,
            generate_intermediate,
            generate_size_file,
            size_limits_file,
            create_tar,
            create_image,
            workspace,
            source_type,
            keep_workdir,
            skip_preflight,
        } => {
            let mut options = options(output);
            options.generate_intermediate = generate_intermediate.on();
            options.generate_size_file = generate_size_file.on();
            options.size_limits_file = size_limits_file;
            options.create_tar = create_tar.on();
            options.create_image = create_image.on();
            options.workspace = workspace;
            options.source_type = source_type;
            options.keep_workdir = keep_workdir;
            let config = BuildConfig::new(options, env)?;
            commands::cmd_build(&input, &config, skip_preflight)?;
        }

        Commands::Plan {
            tree,
            image_size,
            reserve_percent,
        } => {
            commands::cmd_plan(&tree, image_size, reserve_percent)?;
        }

        Commands::Preflight { output, strict } => {
            let config = BuildConfig::new(options(output), env)?;
            commands::cmd_preflight(&config, strict)?;
        }

        Commands::Show { what } => match what {
            ShowTarget::Config { output } => {
                let config = BuildConfig::new(options(output), env)?;
                commands::cmd_show(commands::show::ShowTarget::Config, &config)?;
            }
            ShowTarget::Ledger { path } => {
                let config = BuildConfig::new(BuildOptions::new("."), env)?;
                commands::cmd_show(commands::show::ShowTarget::Ledger(&path), &config)?;
            }
        },
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let env = Environment::capture();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli, env) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
