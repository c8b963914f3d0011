// src/main.rs
//! smelt - LFS build orchestrator CLI entry point

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use smelt::{Config, ModeOverride};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

mod commands;

use commands::{cmd_build, cmd_extract, cmd_fetch, cmd_install, cmd_status, App};

// =============================================================================
// CLI Definitions
// =============================================================================

#[derive(Parser)]
#[command(name = "smelt")]
#[command(version)]
#[command(about = "Linux-From-Scratch build orchestrator", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/smelt/smelt.toml", global = true)]
    config: PathBuf,

    /// Override the recipe directory
    #[arg(long, global = true)]
    recipes: Option<PathBuf>,

    /// Override the orchestrator state root
    #[arg(long, global = true)]
    state_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch sources for packages into the cache
    Fetch {
        /// Packages to fetch (default: all)
        packages: Vec<String>,

        /// Fetch the whole fleet
        #[arg(long)]
        all: bool,

        /// Re-download even when cached artifacts verify
        #[arg(long)]
        update: bool,

        /// Refresh existing git checkouts
        #[arg(long)]
        git_update: bool,

        /// Scrub each package's source cache before fetching
        #[arg(long)]
        remove_cache: bool,

        /// Parallel fetch jobs
        #[arg(short, long, default_value_t = 4)]
        jobs: usize,
    },

    /// Materialize workspaces from cached sources
    Extract {
        /// Packages to extract
        packages: Vec<String>,

        /// Parallel extract jobs
        #[arg(short, long, default_value_t = 4)]
        jobs: usize,
    },

    /// Build packages through the full pipeline
    Build {
        /// Target packages (default: whole fleet); dependencies are pulled
        /// in automatically
        packages: Vec<String>,

        /// Skip packages already recorded ok
        #[arg(long = "continue")]
        resume: bool,

        /// Do not strip installed binaries this run
        #[arg(long)]
        no_strip: bool,

        /// Retries per phase
        #[arg(long)]
        retry: Option<u32>,

        /// Worker slots (default: host CPU count)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Execution mode override
        #[arg(long, value_enum)]
        mode: Option<CliMode>,
    },

    /// Install built artifacts into a target root
    Install {
        /// Packages to install
        packages: Vec<String>,

        /// Skip packages already recorded ok
        #[arg(long = "continue")]
        resume: bool,

        /// Verify artifacts against their checksums and stop
        #[arg(long)]
        verify_only: bool,

        /// Report without touching the target root
        #[arg(long)]
        dry_run: bool,

        /// Installation target root
        #[arg(short, long, default_value = "/")]
        root: PathBuf,

        /// Parallel install jobs
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,
    },

    /// Summarize per-package state
    Status,

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliMode {
    Auto,
    Direct,
    Fakeroot,
    Chroot,
}

impl From<CliMode> for ModeOverride {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Auto => ModeOverride::Auto,
            CliMode::Direct => ModeOverride::Direct,
            CliMode::Fakeroot => ModeOverride::Fakeroot,
            CliMode::Chroot => ModeOverride::Chroot,
        }
    }
}

// =============================================================================
// Signal handling
// =============================================================================

fn shutdown_flag() -> Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false))).clone()
}

extern "C" fn on_signal(_sig: libc::c_int) {
    shutdown_flag().store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    // Initialize the flag before the handler can fire.
    let _ = shutdown_flag();
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

// =============================================================================
// Entry point
// =============================================================================

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("SMELT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    install_signal_handlers();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    }
}

fn run() -> Result<bool> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        generate(*shell, &mut cmd, "smelt", &mut io::stdout());
        return Ok(true);
    }

    let mut config = Config::load_or_default(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    if let Some(root) = cli.state_root {
        config.root = root;
    }
    if let Some(recipes) = cli.recipes {
        config.recipes = recipes;
    }

    let app = App::new(config)?;

    match cli.command {
        Commands::Fetch {
            packages,
            all,
            update,
            git_update,
            remove_cache,
            jobs,
        } => cmd_fetch(
            &app,
            &commands::fetch::FetchArgs {
                packages,
                all,
                update,
                git_update,
                remove_cache,
                jobs,
            },
        ),

        Commands::Extract { packages, jobs } => {
            cmd_extract(&app, &commands::extract::ExtractArgs { packages, jobs })
        }

        Commands::Build {
            packages,
            resume,
            no_strip,
            retry,
            jobs,
            mode,
        } => cmd_build(
            &app,
            &commands::build::BuildArgs {
                packages,
                resume,
                no_strip,
                retry,
                jobs,
                mode: mode.map(Into::into),
            },
            shutdown_flag(),
        ),

        Commands::Install {
            packages,
            resume,
            verify_only,
            dry_run,
            root,
            jobs,
        } => cmd_install(
            &app,
            &commands::install::InstallArgs {
                packages,
                resume,
                verify_only,
                dry_run,
                target_root: root,
                jobs,
            },
        ),

        Commands::Status => cmd_status(&app),

        Commands::Completions { .. } => unreachable!("handled above"),
    }
}
