//! CLI configuration, persisted as TOML (typically at
//! `~/.config/patchsync/config.toml` on Unix systems).
//!
//! Values set on the command line take precedence over the file.

use patchsync_core::{EntityKey, ReconnectPolicy, TransportKind, TransportSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cli::CliError;
use crate::cli::args::ConfigCommands;

pub const DEFAULT_SERVER: &str = "http://localhost:3030";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// HTTP base of the server
    pub server_url: String,

    /// Transport `watch` uses when none is given
    pub transport: TransportKind,

    /// Where local databases live (default: platform data dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Prefix for stored entity names
    pub storage_prefix: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    pub reconnect: ReconnectPolicy,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER.to_string(),
            transport: TransportKind::WebSocket,
            data_dir: None,
            storage_prefix: String::new(),
            user_id: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl CliConfig {
    /// Get the config file path (~/.config/patchsync/config.toml)
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("patchsync").join("config.toml"))
    }

    /// Load config from default location, or return default if file doesn't exist
    pub fn load() -> Result<Self, CliError> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, CliError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save config to default location
    pub fn save(&self) -> Result<PathBuf, CliError> {
        let path = Self::config_path().ok_or(CliError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), CliError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply global command-line overrides.
    pub fn with_overrides(mut self, server: Option<String>, user: Option<String>) -> Self {
        if let Some(server) = server {
            self.server_url = server;
        }
        if user.is_some() {
            self.user_id = user;
        }
        self
    }

    pub fn server_base(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// Socket endpoint derived from the server URL.
    pub fn websocket_url(&self) -> String {
        let base = self
            .server_base()
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        match &self.user_id {
            Some(user) => format!("{}/ws?user={}", base, user),
            None => format!("{}/ws", base),
        }
    }

    pub fn entity_url(&self, key: &EntityKey) -> String {
        format!(
            "{}/entities/{}/{}",
            self.server_base(),
            key.entity_type,
            key.entity_id
        )
    }

    pub fn rpc_url(&self, key: &EntityKey, method: &str) -> String {
        format!(
            "{}/rpc/{}/{}/{}",
            self.server_base(),
            key.entity_type,
            key.entity_id,
            method
        )
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            channel: "patchsync".to_string(),
            websocket_url: Some(self.websocket_url()),
            server_url: Some(self.server_base().to_string()),
            reconnect: self.reconnect,
        }
    }

    /// Directory for local databases
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("patchsync")
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("patchsync.db")
    }
}

pub fn handle_config_command(command: Option<ConfigCommands>, config: CliConfig) -> bool {
    match command {
        None | Some(ConfigCommands::Show) => {
            show_config(&config);
            true
        }
        Some(ConfigCommands::Set {
            server,
            transport,
            data_dir,
            user,
        }) => {
            let mut config = config;
            if let Some(server) = server {
                config.server_url = server;
            }
            if let Some(transport) = transport {
                config.transport = transport;
            }
            if data_dir.is_some() {
                config.data_dir = data_dir;
            }
            if user.is_some() {
                config.user_id = user;
            }
            match config.save() {
                Ok(path) => {
                    println!("✓ Saved {}", path.display());
                    true
                }
                Err(e) => {
                    eprintln!("✗ Failed to save config: {}", e);
                    false
                }
            }
        }
    }
}

fn show_config(config: &CliConfig) {
    println!("patchsync Configuration");
    println!("=======================");
    println!("Server: {}", config.server_url);
    println!("Socket: {}", config.websocket_url());
    println!("Transport: {}", config.transport);
    println!("Data directory: {}", config.data_dir().display());
    if let Some(user) = &config.user_id {
        println!("User: {}", user);
    }
    println!(
        "Reconnect: {} attempts from {}ms",
        config.reconnect.max_attempts, config.reconnect.initial_delay_ms
    );
    if let Some(path) = CliConfig::config_path() {
        println!("Config file: {}", path.display());
    }
}
