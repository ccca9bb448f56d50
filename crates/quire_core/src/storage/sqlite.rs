//! SQLite-backed document store.
//!
//! One database file per location. The store keeps a compacted snapshot
//! per document plus an append-only update log; compaction folds the log
//! into the snapshot inside a single transaction so a crash can never lose
//! acknowledged updates.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, Transact, Update};

use super::{DocStore, StoredUpdate, UpdateOrigin};
use crate::error::{QuireError, Result};

/// SQLite-backed [`DocStore`].
///
/// The connection is wrapped in a `Mutex`, which also gives appends for
/// the same document a total order.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database. Data is lost when dropped.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Document snapshots (compacted state)
            CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                state_vector BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Incremental updates (append-only log)
            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_name TEXT NOT NULL,
                data BLOB NOT NULL,
                origin TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            -- Index for replay queries
            CREATE INDEX IF NOT EXISTS idx_updates_doc_id ON updates(doc_name, id);
            "#,
        )?;
        Ok(())
    }
}

/// Fold a snapshot plus a list of updates into one encoded state blob.
fn merge_state(base: Option<&[u8]>, updates: &[Vec<u8>]) -> Vec<u8> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        if let Some(state) = base {
            if let Ok(update) = Update::decode_v1(state) {
                let _ = txn.apply_update(update);
            }
        }
        for data in updates {
            if let Ok(update) = Update::decode_v1(data) {
                let _ = txn.apply_update(update);
            }
        }
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&Default::default())
}

/// Extract the state vector of an encoded state blob.
fn state_vector_of(state: &[u8]) -> Vec<u8> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        if let Ok(update) = Update::decode_v1(state) {
            let _ = txn.apply_update(update);
        }
    }
    let txn = doc.transact();
    txn.state_vector().encode_v1()
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl DocStore for SqliteStore {
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT state FROM documents WHERE name = ?",
            params![name],
            |row| row.get(0),
        );

        match result {
            Ok(state) => Ok(Some(state)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(QuireError::Database(e)),
        }
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        let state_vector = state_vector_of(state);

        conn.execute(
            "INSERT OR REPLACE INTO documents (name, state, state_vector, updated_at)
             VALUES (?, ?, ?, ?)",
            params![name, state, state_vector, now],
        )?;
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM updates WHERE doc_name = ?", params![name])?;
        conn.execute("DELETE FROM documents WHERE name = ?", params![name])?;
        Ok(())
    }

    fn list_docs(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name FROM documents
             UNION SELECT DISTINCT doc_name FROM updates
             ORDER BY 1",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(names)
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        let origin_str = origin.to_string();

        conn.execute(
            "INSERT INTO updates (doc_name, data, origin, timestamp) VALUES (?, ?, ?, ?)",
            params![name, update, origin_str, now],
        )?;

        Ok(conn.last_insert_rowid())
    }

    fn get_all_updates(&self, name: &str) -> Result<Vec<StoredUpdate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, data, origin, timestamp FROM updates
             WHERE doc_name = ?
             ORDER BY id ASC",
        )?;

        let updates = stmt
            .query_map(params![name], |row| {
                let origin_str: String = row.get(2)?;
                Ok(StoredUpdate {
                    update_id: row.get(0)?,
                    doc_name: name.to_string(),
                    data: row.get(1)?,
                    timestamp: row.get(3)?,
                    origin: origin_str.parse().unwrap_or(UpdateOrigin::Local),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(updates)
    }

    fn compact(&self, name: &str, keep_updates: usize) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();

        let base_state: Option<Vec<u8>> = conn
            .query_row(
                "SELECT state FROM documents WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .ok();

        let updates: Vec<Vec<u8>> = {
            let mut stmt =
                conn.prepare("SELECT data FROM updates WHERE doc_name = ? ORDER BY id ASC")?;
            let rows = stmt
                .query_map(params![name], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        if base_state.is_none() && updates.is_empty() {
            return Ok(());
        }

        if updates.len() <= keep_updates {
            return Ok(());
        }

        let full_state = merge_state(base_state.as_deref(), &updates);
        let state_vector = state_vector_of(&full_state);
        let now = chrono::Utc::now().timestamp_millis();

        // Cutoff below which log rows are folded into the snapshot
        let cutoff_id: i64 = if keep_updates == 0 {
            i64::MAX
        } else {
            conn.query_row(
                "SELECT id FROM updates WHERE doc_name = ? ORDER BY id DESC LIMIT 1 OFFSET ?",
                params![name, keep_updates - 1],
                |row| row.get(0),
            )
            .unwrap_or(0)
        };

        // Save the new snapshot first, then delete old updates, atomically;
        // an interrupted transaction leaves both intact.
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO documents (name, state, state_vector, updated_at)
             VALUES (?, ?, ?, ?)",
            params![name, full_state, state_vector, now],
        )?;
        tx.execute(
            "DELETE FROM updates WHERE doc_name = ? AND id < ?",
            params![name, cutoff_id],
        )?;
        tx.commit()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text};

    fn encoded_text_state(content: &str) -> Vec<u8> {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("body");
        {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 0, content);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&Default::default())
    }

    fn decode_text_state(state: &[u8]) -> String {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
        }
        let text = doc.get_or_insert_text("body");
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[test]
    fn test_save_and_load_doc() {
        let store = SqliteStore::in_memory().unwrap();
        let state = encoded_text_state("persisted");

        store.save_doc("baseDoc", &state).unwrap();
        let loaded = store.load_doc("baseDoc").unwrap().unwrap();

        assert_eq!(decode_text_state(&loaded), "persisted");
    }

    #[test]
    fn test_load_nonexistent_doc() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.load_doc("nope").unwrap().is_none());
    }

    #[test]
    fn test_delete_doc() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_doc("d", b"data").unwrap();
        store.append_update("d", b"u", UpdateOrigin::Local).unwrap();

        store.delete_doc("d").unwrap();

        assert!(store.load_doc("d").unwrap().is_none());
        assert!(store.get_all_updates("d").unwrap().is_empty());
    }

    #[test]
    fn test_list_docs_includes_log_only_docs() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_doc("snap", b"s").unwrap();
        store
            .append_update("logonly", b"u", UpdateOrigin::Remote)
            .unwrap();

        let docs = store.list_docs().unwrap();
        assert_eq!(docs, vec!["logonly", "snap"]);
    }

    #[test]
    fn test_append_orders_updates() {
        let store = SqliteStore::in_memory().unwrap();

        let id1 = store.append_update("d", b"u1", UpdateOrigin::Local).unwrap();
        let id2 = store.append_update("d", b"u2", UpdateOrigin::Remote).unwrap();
        let id3 = store.append_update("d", b"u3", UpdateOrigin::Sync).unwrap();

        assert!(id1 < id2 && id2 < id3);

        let all = store.get_all_updates("d").unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].origin, UpdateOrigin::Local);
        assert_eq!(all[1].origin, UpdateOrigin::Remote);
        assert_eq!(all[2].origin, UpdateOrigin::Sync);
    }

    #[test]
    fn test_compact_folds_log_into_snapshot() {
        let store = SqliteStore::in_memory().unwrap();

        // Generate real incremental updates from a live doc
        let doc = Doc::new();
        let text = doc.get_or_insert_text("body");
        for word in ["a", "b", "c", "d", "e"] {
            let sv_before = {
                let txn = doc.transact();
                txn.state_vector()
            };
            {
                let mut txn = doc.transact_mut();
                let len = text.get_string(&txn).len() as u32;
                text.insert(&mut txn, len, word);
            }
            let update = {
                let txn = doc.transact();
                txn.encode_state_as_update_v1(&sv_before)
            };
            store
                .append_update("d", &update, UpdateOrigin::Local)
                .unwrap();
        }

        store.compact("d", 2).unwrap();

        assert_eq!(store.get_all_updates("d").unwrap().len(), 2);
        let snapshot = store.load_doc("d").unwrap().unwrap();
        // Snapshot alone already contains the full folded history
        assert_eq!(decode_text_state(&snapshot), "abcde");
    }

    #[test]
    fn test_compact_to_zero_empties_log() {
        let store = SqliteStore::in_memory().unwrap();
        let state = encoded_text_state("hello");
        store
            .append_update("d", &state, UpdateOrigin::Local)
            .unwrap();

        store.compact("d", 0).unwrap();

        assert!(store.get_all_updates("d").unwrap().is_empty());
        let snapshot = store.load_doc("d").unwrap().unwrap();
        assert_eq!(decode_text_state(&snapshot), "hello");
    }

    #[test]
    fn test_compact_missing_doc_is_noop() {
        let store = SqliteStore::in_memory().unwrap();
        store.compact("ghost", 0).unwrap();
    }

    #[test]
    fn test_on_disk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loc.db");
        let state = encoded_text_state("durable");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_doc("baseDoc", &state).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.load_doc("baseDoc").unwrap().unwrap();
        assert_eq!(decode_text_state(&loaded), "durable");
    }
}
