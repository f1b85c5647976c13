use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tsk",
    about = concat!("[>] tasksync v", env!("CARGO_PKG_VERSION"), " - multi-device task file sync"),
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Skip file locking (for filesystems without flock support)
    #[arg(long, global = true)]
    pub unlocked: bool,

    /// Remove a stale lock left by a crashed process before locking
    #[arg(long, global = true)]
    pub break_lock: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the object tree of a task file
    Show(ShowArgs),
    /// Print the per-device change table from the sidecar
    Changes(ChangesArgs),
    /// Merge on-disk changes from other devices and report conflicts
    Merge(MergeArgs),
    /// Create an empty task file (or re-save an existing one)
    Touch(TouchArgs),
}

#[derive(Args)]
pub struct ShowArgs {
    /// Task file to read
    pub file: PathBuf,
}

#[derive(Args)]
pub struct ChangesArgs {
    /// Task file whose sidecar to read
    pub file: PathBuf,
}

#[derive(Args)]
pub struct MergeArgs {
    /// Task file to merge and rewrite
    pub file: PathBuf,
}

#[derive(Args)]
pub struct TouchArgs {
    /// Task file to create or re-save
    pub file: PathBuf,
}
