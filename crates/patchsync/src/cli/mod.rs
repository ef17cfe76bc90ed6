/// Clap argument definitions
mod args;

/// Config command handlers
mod config;

/// `replay` against a local database
mod replay;

/// `send`, `call` and `get` against the server's HTTP endpoints
mod remote;

/// `watch` over a live transport
mod watch;

use clap::Parser;
use patchsync_core::{EntityKey, PatchSyncError};
use thiserror::Error;

pub use args::Cli;
use args::{Commands, EntityArgs};
use config::CliConfig;

/// Failures surfaced by CLI commands
#[derive(Debug, Error)]
pub enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Could not write config: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("No config directory on this platform")]
    NoConfigDir,

    #[error(transparent)]
    Sync(#[from] PatchSyncError),

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Invalid patch '{spec}': {reason}")]
    InvalidPatch { spec: String, reason: String },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl EntityArgs {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }
}

/// Multi-threaded runtime for commands that talk to the network
fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

/// Main entry point for the CLI
pub fn run_cli() {
    let cli = Cli::parse();

    let config = match CliConfig::load() {
        Ok(c) => c.with_overrides(cli.server, cli.user),
        Err(e) => {
            eprintln!("✗ Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    let success = match cli.command {
        Commands::Watch {
            entity,
            transport,
            persist,
            quiet,
        } => watch::handle_watch(&config, &entity.key(), transport, persist, quiet),

        Commands::Send {
            entity,
            set,
            append,
            remove,
            file,
        } => remote::handle_send(&config, &entity.key(), &set, &append, &remove, file.as_deref()),

        Commands::Call {
            entity,
            method,
            args,
        } => remote::handle_call(&config, &entity.key(), &method, args.as_deref()),

        Commands::Get { entity } => remote::handle_get(&config, &entity.key()),

        Commands::Replay {
            entity,
            db,
            compact,
        } => replay::handle_replay(&config, &entity.key(), db, compact),

        Commands::Config { command } => config::handle_config_command(command, config),
    };

    if !success {
        std::process::exit(1);
    }
}
