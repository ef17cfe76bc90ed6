//! SQLite-backed storage.
//!
//! Snapshots and log entries are stored as JSON text, in the same camelCase shape
//! they travel in, so a database can be inspected with any SQLite shell.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use super::{PatchStorage, StorageResult, StoredPatch, StoredSnapshot, now_millis};
use crate::error::PatchSyncError;
use crate::patch::Patch;

/// SQLite-backed patch storage.
///
/// The connection is wrapped in a `Mutex`; SQLite runs in serialized mode.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a database at `path` and create missing tables.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database. Data is lost when the storage is dropped.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> StorageResult<()> {
        self.conn().execute_batch(
            r#"
            -- Full-state snapshots
            CREATE TABLE IF NOT EXISTS snapshots (
                name TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                change_number INTEGER,
                updated_at INTEGER NOT NULL
            );

            -- Append-only log of applied patches
            CREATE TABLE IF NOT EXISTS patch_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                change_number INTEGER NOT NULL,
                patch TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_patch_log_name_id ON patch_log(name, id);

            -- Generator counters
            CREATE TABLE IF NOT EXISTS counters (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn query_log(&self, name: &str, after: Option<u64>) -> StorageResult<Vec<StoredPatch>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, change_number, patch, created_at FROM patch_log
             WHERE name = ? AND change_number > ?
             ORDER BY id ASC",
        )?;
        // -1 selects every row, including change number 0
        let floor = after.map(to_sql_int).unwrap_or(-1);
        let rows = stmt
            .query_map(params![name, floor], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, change_number, patch, created_at) in rows {
            match serde_json::from_str::<Patch>(&patch) {
                Ok(patch) => entries.push(StoredPatch {
                    id,
                    change_number: change_number.max(0) as u64,
                    patch,
                    created_at,
                }),
                Err(e) => {
                    log::warn!(
                        "[SqliteStorage] skipping unreadable log entry {} for '{}': {}",
                        id,
                        name,
                        e
                    );
                }
            }
        }
        Ok(entries)
    }
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

impl PatchStorage for SqliteStorage {
    fn load_snapshot(&self, name: &str) -> StorageResult<Option<StoredSnapshot>> {
        let row = self
            .conn()
            .query_row(
                "SELECT state, change_number, updated_at FROM snapshots WHERE name = ?",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((state, change_number, updated_at)) => Ok(Some(StoredSnapshot {
                state: serde_json::from_str(&state)?,
                change_number: change_number.map(|cn| cn.max(0) as u64),
                updated_at,
            })),
            None => Ok(None),
        }
    }

    fn save_snapshot(
        &self,
        name: &str,
        state: &Value,
        change_number: Option<u64>,
    ) -> StorageResult<()> {
        let state = serde_json::to_string(state)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO snapshots (name, state, change_number, updated_at)
             VALUES (?, ?, ?, ?)",
            params![name, state, change_number.map(to_sql_int), now_millis()],
        )?;
        Ok(())
    }

    fn append_patches(&self, name: &str, patches: &[Patch]) -> StorageResult<Vec<i64>> {
        let encoded = patches
            .iter()
            .map(|p| -> StorageResult<(i64, String)> {
                Ok((to_sql_int(p.change_number), serde_json::to_string(p)?))
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = now_millis();
        let mut ids = Vec::with_capacity(encoded.len());
        for (change_number, patch) in encoded {
            tx.execute(
                "INSERT INTO patch_log (name, change_number, patch, created_at) VALUES (?, ?, ?, ?)",
                params![name, change_number, patch, now],
            )?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit()?;
        Ok(ids)
    }

    fn load_patch_log(&self, name: &str) -> StorageResult<Vec<StoredPatch>> {
        self.query_log(name, None)
    }

    fn load_patches_since(&self, name: &str, change_number: u64) -> StorageResult<Vec<StoredPatch>> {
        self.query_log(name, Some(change_number))
    }

    fn load_counter(&self, name: &str) -> StorageResult<Option<u64>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM counters WHERE name = ?",
                params![name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(value.map(|v| v.max(0) as u64))
    }

    fn save_counter(&self, name: &str, value: u64) -> StorageResult<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO counters (name, value) VALUES (?, ?)",
            params![name, to_sql_int(value)],
        )?;
        Ok(())
    }

    fn delete_entity(&self, name: &str) -> StorageResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM patch_log WHERE name = ?", params![name])?;
        tx.execute("DELETE FROM snapshots WHERE name = ?", params![name])?;
        tx.execute("DELETE FROM counters WHERE name = ?", params![name])?;
        tx.commit()?;
        Ok(())
    }

    fn list_entities(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name FROM snapshots UNION SELECT DISTINCT name FROM patch_log ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn compact(&self, name: &str, keep: usize) -> StorageResult<()> {
        let mut conn = self.conn();

        let has_snapshot: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM snapshots WHERE name = ?)",
            params![name],
            |row| row.get(0),
        )?;
        if !has_snapshot {
            return Err(PatchSyncError::Storage(format!(
                "cannot compact '{}' without a snapshot",
                name
            )));
        }

        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM patch_log WHERE name = ?1 AND id NOT IN (
                 SELECT id FROM patch_log WHERE name = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![name, i64::try_from(keep).unwrap_or(i64::MAX)],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn numbered(cn: u64) -> Patch {
        Patch::set(format!("board.cells[{}]", cn), "P1").with_change_number(cn)
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage
            .save_snapshot("game:1", &json!({"board": {"cells": ["P1"]}}), Some(3))
            .unwrap();

        let snap = storage.load_snapshot("game:1").unwrap().unwrap();
        assert_eq!(snap.state, json!({"board": {"cells": ["P1"]}}));
        assert_eq!(snap.change_number, Some(3));

        storage.save_snapshot("game:2", &json!({}), None).unwrap();
        assert_eq!(storage.load_snapshot("game:2").unwrap().unwrap().change_number, None);
        assert!(storage.load_snapshot("missing").unwrap().is_none());
    }

    #[test]
    fn test_log_preserves_patch_values() {
        let storage = SqliteStorage::in_memory().unwrap();
        let patches = vec![
            numbered(1),
            Patch::insert_map("players", "p1", json!({"name": "ann"})).with_change_number(2),
        ];
        storage.append_patches("game:1", &patches).unwrap();

        let log = storage.load_patch_log("game:1").unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].patch, patches[0]);
        assert_eq!(log[1].patch.value, Some(json!({"name": "ann"})));

        let since = storage.load_patches_since("game:1", 1).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].change_number, 2);
    }

    #[test]
    fn test_counter_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.save_counter("game:1", 12).unwrap();
            storage.append_patches("game:1", &[numbered(12)]).unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.load_counter("game:1").unwrap(), Some(12));
        assert_eq!(storage.load_patch_log("game:1").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_and_list() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.save_snapshot("a:1", &json!({}), None).unwrap();
        storage.append_patches("b:1", &[numbered(1)]).unwrap();
        storage.save_counter("b:1", 1).unwrap();
        assert_eq!(storage.list_entities().unwrap(), vec!["a:1", "b:1"]);

        storage.delete_entity("b:1").unwrap();
        assert_eq!(storage.list_entities().unwrap(), vec!["a:1"]);
        assert_eq!(storage.load_counter("b:1").unwrap(), None);
    }

    #[test]
    fn test_compact_keeps_most_recent() {
        let storage = SqliteStorage::in_memory().unwrap();
        let patches: Vec<Patch> = (1..=5).map(numbered).collect();
        storage.append_patches("game:1", &patches).unwrap();
        assert!(storage.compact("game:1", 2).is_err());

        storage.save_snapshot("game:1", &json!({}), Some(5)).unwrap();
        storage.compact("game:1", 2).unwrap();
        let cns: Vec<u64> = storage
            .load_patch_log("game:1")
            .unwrap()
            .iter()
            .map(|e| e.change_number)
            .collect();
        assert_eq!(cns, vec![4, 5]);
    }
}
