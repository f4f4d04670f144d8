//! Command-line surface.

use camino::Utf8PathBuf;
use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "sail", version, about = "Incremental build orchestrator")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Replay cached stdout and enable debug logging.
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build the selected packages' task graph.
    Build(BuildArgs),
    /// Enumerate workspaces, packages and release groups.
    Scan {
        /// Directory to discover from; defaults to the current directory.
        #[arg(long)]
        path: Option<Utf8PathBuf>,
    },
    /// Run repository policies.
    Policy {
        #[command(subcommand)]
        action: PolicyCommand,
    },
}

#[derive(Debug, ClapArgs)]
pub struct BuildArgs {
    /// Packages to build; empty means every package.
    pub packages: Vec<String>,

    /// Task(s) to run; may repeat.
    #[arg(long = "task", required = true)]
    pub tasks: Vec<String>,

    /// Shared cache directory override.
    #[arg(long = "cacheDir")]
    pub cache_dir: Option<Utf8PathBuf>,

    /// Read from the cache but never write to it.
    #[arg(long = "skip-cache-write")]
    pub skip_cache_write: bool,

    /// Disable the shared cache entirely.
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    /// Maximum concurrently running tasks; 0 means one per core.
    #[arg(long, default_value_t = 0)]
    pub concurrency: usize,

    /// Cancel queued tasks after the first failure.
    #[arg(long)]
    pub bail: bool,

    /// Write the task graph in DOT form to this file.
    #[arg(long)]
    pub graph: Option<Utf8PathBuf>,

    /// Directory to discover from; defaults to the current directory.
    #[arg(long)]
    pub path: Option<Utf8PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    /// Report policy violations; exit 1 when any are found.
    Check {
        #[arg(long)]
        path: Option<Utf8PathBuf>,
    },
    /// Apply resolvers, then re-check; exit 0 when nothing is left broken.
    Fix {
        #[arg(long)]
        path: Option<Utf8PathBuf>,
    },
}
