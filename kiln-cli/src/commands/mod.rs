//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod artifact;
mod submit;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Queue a build task for the workers
    Submit {
        /// Object key of the source archive
        #[arg(short, long)]
        key: String,

        /// Build profile (export preset), e.g. "web"
        #[arg(short, long)]
        profile: String,
    },
    /// Upload a project archive to the object store
    Upload {
        /// Local archive to upload
        archive: PathBuf,

        /// Object key (defaults to the archive's file name)
        #[arg(short, long)]
        key: Option<String>,
    },
    /// Download an object (typically a build artifact)
    Fetch {
        /// Object key to download
        key: String,

        /// Destination file (defaults to the key's file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - The CLI configuration
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Submit { key, profile } => submit::handle_submit(&key, &profile, config).await,
        Commands::Upload { archive, key } => {
            artifact::handle_upload(&archive, key.as_deref(), config).await
        }
        Commands::Fetch { key, output } => {
            artifact::handle_fetch(&key, output.as_deref(), config).await
        }
    }
}
