use serde::Serialize;
use thiserror::Error;

/// Unified error type for patchsync operations
#[derive(Debug, Error)]
pub enum PatchSyncError {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generation errors
    #[error("No authority to generate patches for '{0}'")]
    NotAuthoritative(String),

    #[error("Mutation produced no patches for '{0}'")]
    EmptyMutation(String),

    // Entity registry errors
    #[error("Unknown entity '{0}'. Register it before use")]
    UnknownEntity(String),

    #[error("Entity '{0}' is already registered")]
    EntityAlreadyRegistered(String),

    // Application errors
    #[error("Invalid field path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("{operation} patch at '{path}' is missing '{argument}'")]
    MissingArgument {
        operation: String,
        path: String,
        argument: &'static str,
    },

    #[error("Path conflict at '{path}': expected {expected}, found {found}")]
    PathConflict {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Transport terminated after {attempts} reconnect attempts")]
    TransportTerminated { attempts: u32 },

    #[error("Transport has been destroyed")]
    TransportDestroyed,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    // Storage errors
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type alias for patchsync operations
pub type Result<T> = std::result::Result<T, PatchSyncError>;

impl PatchSyncError {
    /// Short variant name, stable across releases
    pub fn kind(&self) -> &'static str {
        match self {
            PatchSyncError::Io(_) => "Io",
            PatchSyncError::Json(_) => "Json",
            PatchSyncError::NotAuthoritative(_) => "NotAuthoritative",
            PatchSyncError::EmptyMutation(_) => "EmptyMutation",
            PatchSyncError::UnknownEntity(_) => "UnknownEntity",
            PatchSyncError::EntityAlreadyRegistered(_) => "EntityAlreadyRegistered",
            PatchSyncError::InvalidPath { .. } => "InvalidPath",
            PatchSyncError::MissingArgument { .. } => "MissingArgument",
            PatchSyncError::PathConflict { .. } => "PathConflict",
            PatchSyncError::Transport(_) => "Transport",
            PatchSyncError::NotConnected => "NotConnected",
            PatchSyncError::TransportTerminated { .. } => "TransportTerminated",
            PatchSyncError::TransportDestroyed => "TransportDestroyed",
            PatchSyncError::MalformedPayload(_) => "MalformedPayload",
            #[cfg(feature = "sqlite")]
            PatchSyncError::Sqlite(_) => "Sqlite",
            PatchSyncError::Storage(_) => "Storage",
        }
    }

    /// Whether the hosting process can keep going after this error.
    ///
    /// Only programmer errors (using an entity before registering it) and a
    /// transport that exhausted its reconnect budget are terminal.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            PatchSyncError::UnknownEntity(_) | PatchSyncError::TransportTerminated { .. }
        )
    }

    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// A serializable representation of PatchSyncError for HTTP bodies and IPC
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Field path involved (if applicable)
    pub path: Option<String>,
}

impl From<&PatchSyncError> for SerializableError {
    fn from(err: &PatchSyncError) -> Self {
        let path = match err {
            PatchSyncError::InvalidPath { path, .. } => Some(path.clone()),
            PatchSyncError::MissingArgument { path, .. } => Some(path.clone()),
            PatchSyncError::PathConflict { path, .. } => Some(path.clone()),
            _ => None,
        };

        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            path,
        }
    }
}

impl From<PatchSyncError> for SerializableError {
    fn from(err: PatchSyncError) -> Self {
        SerializableError::from(&err)
    }
}
