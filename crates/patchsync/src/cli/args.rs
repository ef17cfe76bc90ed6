//! Command-line argument structures and enums

use clap::{Args, Parser, Subcommand};
use patchsync_core::TransportKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "patchsync")]
#[command(about = "Watch, edit and inspect entities replicated by a patchsync server", long_about = None)]
pub struct Cli {
    /// Server base URL (overrides config), e.g. http://localhost:3030
    #[arg(short, long, global = true)]
    pub server: Option<String>,

    /// Attribute changes to this user (overrides config)
    #[arg(short, long, global = true)]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Entity address shared by most commands
#[derive(Args, Debug, Clone)]
pub struct EntityArgs {
    /// Entity type, e.g. "board"
    pub entity_type: String,

    /// Entity instance id
    pub entity_id: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Follow an entity and print every state change
    Watch {
        #[command(flatten)]
        entity: EntityArgs,

        /// Transport to use: websocket or sse (overrides config)
        #[arg(short, long)]
        transport: Option<TransportKind>,

        /// Keep a local copy in the data directory and restore it next time
        #[arg(long)]
        persist: bool,

        /// Print only the change number, not the full state
        #[arg(short, long)]
        quiet: bool,
    },

    /// Propose patches to an entity
    Send {
        #[command(flatten)]
        entity: EntityArgs,

        /// Assign a JSON value: PATH=VALUE (repeatable)
        #[arg(long = "set", value_name = "PATH=VALUE")]
        set: Vec<String>,

        /// Append a JSON value to a list: PATH=VALUE (repeatable)
        #[arg(long = "append", value_name = "PATH=VALUE")]
        append: Vec<String>,

        /// Remove a list element: PATH=INDEX (repeatable)
        #[arg(long = "remove", value_name = "PATH=INDEX")]
        remove: Vec<String>,

        /// Read patches from a JSON file (an array, or {"patches": [...]})
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Invoke a server method on an entity
    Call {
        #[command(flatten)]
        entity: EntityArgs,

        /// Method name, e.g. place_token
        method: String,

        /// JSON arguments, e.g. '{"column": 3, "player": "P1"}'
        args: Option<String>,
    },

    /// Print an entity's current state from the server
    Get {
        #[command(flatten)]
        entity: EntityArgs,
    },

    /// Rebuild an entity from a local database
    Replay {
        #[command(flatten)]
        entity: EntityArgs,

        /// Database file (default: patchsync.db in the data directory)
        #[arg(long)]
        db: Option<PathBuf>,

        /// After replaying, write a snapshot and keep only this many log entries
        #[arg(long, value_name = "KEEP")]
        compact: Option<usize>,
    },

    /// Show or change CLI configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the resolved configuration
    Show,

    /// Update configuration values
    Set {
        /// Server base URL
        #[arg(long)]
        server: Option<String>,

        /// Default transport for `watch`
        #[arg(long)]
        transport: Option<TransportKind>,

        /// Directory for local databases
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Default user id
        #[arg(long)]
        user: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_watch_with_transport() {
        let cli = Cli::parse_from([
            "patchsync",
            "--server",
            "http://h:1",
            "watch",
            "board",
            "g1",
            "--transport",
            "sse",
        ]);
        assert_eq!(cli.server.as_deref(), Some("http://h:1"));
        match cli.command {
            Commands::Watch {
                entity, transport, ..
            } => {
                assert_eq!(entity.entity_type, "board");
                assert_eq!(entity.entity_id, "g1");
                assert_eq!(transport, Some(TransportKind::ServerPush));
            }
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn test_parse_repeated_patch_flags() {
        let cli = Cli::parse_from([
            "patchsync",
            "send",
            "board",
            "g1",
            "--set",
            "turn=1",
            "--set",
            "currentPlayer=\"P2\"",
            "--remove",
            "moves=0",
        ]);
        match cli.command {
            Commands::Send { set, remove, .. } => {
                assert_eq!(set.len(), 2);
                assert_eq!(remove, vec!["moves=0"]);
            }
            _ => panic!("expected send"),
        }
    }
}
