use std::env;
use std::path::PathBuf;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// Database file path (default: ./patchsync.db)
    pub database_path: PathBuf,
    /// Prefix for storage names of every entity (default: empty)
    pub storage_prefix: String,
    /// Per-room broadcast channel capacity (default: 1024)
    pub broadcast_capacity: usize,
    /// CORS allowed origins (comma-separated, `*` for any)
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3030,
            database_path: PathBuf::from("./patchsync.db"),
            storage_prefix: String::new(),
            broadcast_capacity: 1024,
            cors_origins: vec!["*".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        let host = env::var("HOST").unwrap_or(defaults.host);
        let port = match env::var("PORT") {
            Ok(port) => port.parse().map_err(|_| ConfigError::InvalidPort)?,
            Err(_) => defaults.port,
        };

        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let storage_prefix = env::var("STORAGE_PREFIX").unwrap_or(defaults.storage_prefix);

        let broadcast_capacity = match env::var("BROADCAST_CAPACITY") {
            Ok(capacity) => capacity
                .parse()
                .ok()
                .filter(|c| *c > 0)
                .ok_or(ConfigError::InvalidBroadcastCapacity)?,
            Err(_) => defaults.broadcast_capacity,
        };

        let cors_origins = match env::var("CORS_ORIGINS") {
            Ok(origins) => parse_origins(&origins),
            Err(_) => defaults.cors_origins,
        };

        Ok(Config {
            host,
            port,
            database_path,
            storage_prefix,
            broadcast_capacity,
            cors_origins,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether every origin is allowed
    pub fn allows_any_origin(&self) -> bool {
        self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o == "*")
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidBroadcastCapacity,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidBroadcastCapacity => {
                write!(f, "Invalid BROADCAST_CAPACITY environment variable")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_origins_trims_and_skips_empty() {
        assert_eq!(
            parse_origins(" http://a.test , ,http://b.test"),
            vec!["http://a.test", "http://b.test"]
        );
    }

    #[test]
    fn test_default_allows_any_origin() {
        let config = Config::default();
        assert!(config.allows_any_origin());
        assert_eq!(config.server_addr(), "0.0.0.0:3030");

        let config = Config {
            cors_origins: vec!["http://a.test".into()],
            ..Config::default()
        };
        assert!(!config.allows_any_origin());
    }
}
