#![doc = include_str!("../README.md")]

/// Applying a single patch to a JSON document
pub mod apply;

/// Ordered, panic-isolated listener registry
pub mod callback;

/// Ordering strategies for patches within one apply call
pub mod conflict;

/// Local entity copies and the watermark-guarded apply loop
pub mod engine;

/// Error (common error types)
pub mod error;

/// Authoritative change numbering
pub mod generator;

/// Engine + generator + transport wiring
pub mod manager;

/// Patch, batch and entity key model
pub mod patch;

/// Snapshot, patch log and counter persistence
pub mod storage;

/// Pluggable transports
pub mod transport;

pub use apply::{PathPolicy, apply_patch};
pub use conflict::ConflictStrategy;
pub use engine::{ApplyReport, EngineConfig, PatchEngine, RestoreSource, StateChanged};
pub use error::{PatchSyncError, Result, SerializableError};
pub use generator::{Mutation, MutationContext, PatchGenerator, PatchList};
pub use manager::{RetainPolicy, SyncManager};
pub use patch::{EntityKey, Patch, PatchBatch, PatchOperation, PatchResponse, PatchSource};
pub use storage::{MemoryStorage, PatchStorage};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use transport::{
    DefaultTransportFactory, ReconnectPolicy, Transport, TransportFactory, TransportKind,
    TransportMessage, TransportSettings, TransportStatus,
};
