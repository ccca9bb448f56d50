//! In-memory document store for testing.

use std::collections::HashMap;
use std::sync::RwLock;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, Transact, Update};

use super::{DocStore, StoredUpdate, UpdateOrigin};
use crate::error::Result;

/// In-memory [`DocStore`]. Thread-safe, lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, Vec<u8>>>,
    updates: RwLock<HashMap<String, Vec<StoredUpdate>>>,
    next_id: RwLock<i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_update_id(&self) -> i64 {
        let mut id = self.next_id.write().unwrap();
        *id += 1;
        *id
    }
}

impl DocStore for MemoryStore {
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(name).cloned())
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        docs.insert(name.to_string(), state.to_vec());
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> Result<()> {
        self.docs.write().unwrap().remove(name);
        self.updates.write().unwrap().remove(name);
        Ok(())
    }

    fn list_docs(&self) -> Result<Vec<String>> {
        let docs = self.docs.read().unwrap();
        let updates = self.updates.read().unwrap();
        let mut names: Vec<String> = docs.keys().chain(updates.keys()).cloned().collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> Result<i64> {
        let id = self.next_update_id();
        let stored = StoredUpdate {
            update_id: id,
            doc_name: name.to_string(),
            data: update.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin,
        };

        let mut updates = self.updates.write().unwrap();
        updates.entry(name.to_string()).or_default().push(stored);

        Ok(id)
    }

    fn get_all_updates(&self, name: &str) -> Result<Vec<StoredUpdate>> {
        let updates = self.updates.read().unwrap();
        Ok(updates.get(name).cloned().unwrap_or_default())
    }

    fn compact(&self, name: &str, keep_updates: usize) -> Result<()> {
        let base = self.load_doc(name)?;
        let log = self.get_all_updates(name)?;

        if base.is_none() && log.is_empty() {
            return Ok(());
        }
        if log.len() <= keep_updates {
            return Ok(());
        }

        // Fold everything into one snapshot
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            if let Some(state) = &base {
                if let Ok(update) = Update::decode_v1(state) {
                    let _ = txn.apply_update(update);
                }
            }
            for stored in &log {
                if let Ok(update) = Update::decode_v1(&stored.data) {
                    let _ = txn.apply_update(update);
                }
            }
        }
        let full_state = {
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&Default::default())
        };

        self.save_doc(name, &full_state)?;

        let mut updates = self.updates.write().unwrap();
        if let Some(log) = updates.get_mut(name) {
            let drop_count = log.len() - keep_updates;
            log.drain(..drop_count);
        }
        Ok(())
    }
}
