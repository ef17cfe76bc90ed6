//! Rebuild an entity from a local database without touching the network.

use std::path::PathBuf;
use std::sync::Arc;

use patchsync_core::storage::PatchStorage;
use patchsync_core::{
    ConflictStrategy, EngineConfig, EntityKey, PatchEngine, RestoreSource, SqliteStorage,
};
use serde_json::Value;

use super::CliError;
use super::config::CliConfig;

/// What a replay produced
#[derive(Debug)]
pub struct Replayed {
    pub source: RestoreSource,
    pub state: Value,
    pub change_number: u64,
    pub log_entries: usize,
}

/// Restore `key` from `storage`, optionally compacting the log afterwards.
pub fn replay(
    storage: Arc<dyn PatchStorage>,
    prefix: &str,
    key: &EntityKey,
    compact: Option<usize>,
) -> Result<Replayed, CliError> {
    let config = EngineConfig {
        storage_prefix: prefix.to_string(),
        ..EngineConfig::default()
    };
    let mut engine = PatchEngine::with_storage(config, Arc::clone(&storage));
    let source = engine.restore_entity(key.clone(), ConflictStrategy::default())?;

    if let Some(keep) = compact {
        engine.compact(key, keep)?;
    }

    Ok(Replayed {
        source,
        state: engine.state(key).cloned().unwrap_or(Value::Null),
        change_number: engine.last_change_number(key).unwrap_or(0),
        log_entries: storage.load_patch_log(&key.storage_name(prefix))?.len(),
    })
}

pub fn handle_replay(
    config: &CliConfig,
    key: &EntityKey,
    db: Option<PathBuf>,
    compact: Option<usize>,
) -> bool {
    let path = db.unwrap_or_else(|| config.database_path());
    if !path.exists() {
        eprintln!("✗ No database at {}", path.display());
        return false;
    }

    let result = SqliteStorage::open(&path)
        .map_err(CliError::from)
        .and_then(|storage| replay(Arc::new(storage), &config.storage_prefix, key, compact));

    match result {
        Ok(replayed) => {
            println!("{} @ {}", key, replayed.change_number);
            println!("  Database: {}", path.display());
            println!("  Restored from: {:?}", replayed.source);
            println!("  Log entries: {}", replayed.log_entries);
            if compact.is_some() {
                println!("  ✓ Compacted");
            }
            match serde_json::to_string_pretty(&replayed.state) {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("✗ {}", e),
            }
            true
        }
        Err(e) => {
            eprintln!("✗ Replay failed: {}", e);
            false
        }
    }
}
