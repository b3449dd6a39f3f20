pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(about = "Resumable migration of a document tree between two remote stores")]
pub struct Args {
    /// Path to the ferry state directory (defaults to ~/.ferry)
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
