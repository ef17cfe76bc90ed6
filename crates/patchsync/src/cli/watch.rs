//! Follow an entity over a live transport.

use std::sync::Arc;

use patchsync_core::storage::PatchStorage;
use patchsync_core::{
    ConflictStrategy, DefaultTransportFactory, EngineConfig, EntityKey, PatchEngine,
    PatchSyncError, SqliteStorage, StateChanged, SyncManager, TransportKind, TransportStatus,
};
use patchsync_core::transport::BroadcastHub;
use serde_json::json;

use super::config::CliConfig;
use super::{CliError, runtime};

pub fn handle_watch(
    config: &CliConfig,
    key: &EntityKey,
    transport: Option<TransportKind>,
    persist: bool,
    quiet: bool,
) -> bool {
    let kind = transport.unwrap_or(config.transport);
    if kind == TransportKind::LocalBroadcast {
        eprintln!("✗ The local broadcast transport only reaches this process; use websocket or sse");
        return false;
    }

    match watch(config, key, kind, persist, quiet) {
        Ok(()) => {
            println!("Watch stopped.");
            true
        }
        Err(e) => {
            eprintln!("✗ {}", e);
            false
        }
    }
}

fn open_engine(config: &CliConfig, persist: bool) -> Result<PatchEngine, CliError> {
    let engine_config = EngineConfig {
        storage_prefix: config.storage_prefix.clone(),
        ..EngineConfig::default()
    };
    if !persist {
        return Ok(PatchEngine::new(engine_config));
    }

    let path = config.database_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let storage: Arc<dyn PatchStorage> = Arc::new(SqliteStorage::open(&path)?);
    println!("  Local copy: {}", path.display());
    Ok(PatchEngine::with_storage(engine_config, storage))
}

fn print_change(event: &StateChanged, quiet: bool) {
    if quiet {
        println!("{} @ {}", event.key, event.last_change_number);
        return;
    }
    let state = serde_json::to_string_pretty(&event.state).unwrap_or_else(|_| event.state.to_string());
    println!(
        "── {} @ {} ({} patches, {:?})",
        event.key, event.last_change_number, event.consumed, event.source
    );
    println!("{}", state);
}

fn watch(
    config: &CliConfig,
    key: &EntityKey,
    kind: TransportKind,
    persist: bool,
    quiet: bool,
) -> Result<(), CliError> {
    println!("Watching {}", key);
    println!("  Server: {}", config.server_url);
    println!("  Transport: {}", kind);

    let engine = open_engine(config, persist)?;
    let factory = DefaultTransportFactory::new(BroadcastHub::new(), config.transport_settings());

    let rt = runtime()?;
    rt.block_on(async {
        let manager = SyncManager::new(engine, Arc::new(factory));
        manager.on_state_changed(Arc::new(move |event: &StateChanged| {
            print_change(event, quiet);
        }));

        if persist {
            let source = manager.restore_entity(key, ConflictStrategy::default())?;
            println!(
                "  Restored {:?} at change {}",
                source,
                manager.last_change_number(key).unwrap_or(0)
            );
        } else {
            manager.register_entity(
                &key.entity_type,
                &key.entity_id,
                json!({}),
                ConflictStrategy::default(),
            )?;
        }

        manager.switch_transport(kind)?;
        let mut status = manager
            .transport_status_watch()
            .ok_or(CliError::Sync(PatchSyncError::TransportDestroyed))?;
        report_status(&status.borrow_and_update().clone());

        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = status.borrow_and_update().clone();
                    report_status(&current);
                    if current.is_terminal() {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    println!("Shutting down...");
                    break;
                }
            }
        }

        // persists every entity when a local copy is kept
        manager.shutdown()?;
        log::debug!("[watch] stopped following {}", key);
        Ok::<(), CliError>(())
    })
}

fn report_status(status: &TransportStatus) {
    match status {
        TransportStatus::Connected => println!("● connected"),
        TransportStatus::Connecting => println!("○ connecting"),
        TransportStatus::Reconnecting { attempt, delay_ms } => {
            println!("○ reconnecting (attempt {}, in {}ms)", attempt, delay_ms)
        }
        TransportStatus::Failed { attempts, message } => {
            eprintln!("✗ gave up after {} attempts: {}", attempts, message)
        }
        TransportStatus::Disconnected => println!("○ disconnected"),
        TransportStatus::Destroyed => {}
    }
}
