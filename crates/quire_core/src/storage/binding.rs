//! Per-location persistence binding.
//!
//! A [`PersistenceBinding`] owns the durable store for one location and
//! keeps live documents and the store mutually up to date: binding a
//! document merges persisted and in-memory state in both directions, then
//! subscribes a write-back listener that appends every subsequent update
//! to the store. Binding the same document twice is a no-op.
//!
//! Opening a binding runs the one-shot legacy-layout migration before any
//! document can bind; a migration failure fails the whole location rather
//! than serving inconsistent data.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use yrs::StateVector;

use super::{DocStore, UpdateOrigin};
use crate::doc::{SharedDoc, BASE_DOC_NAME};
use crate::error::{QuireError, Result};

/// Document name used by the legacy single-document storage layout.
const LEGACY_BASE_DOC_NAME: &str = "base";

/// Durable store adapter for one location.
pub struct PersistenceBinding {
    store: Arc<dyn DocStore>,
    /// Write-back subscriptions per document name. Presence of an entry is
    /// also the idempotency guard against double-binding.
    bound: Mutex<HashMap<String, yrs::Subscription>>,
}

impl PersistenceBinding {
    /// Open a binding over the given store.
    ///
    /// Runs the legacy-layout migration first; on migration failure the
    /// location must not serve any connection.
    pub fn open(store: Arc<dyn DocStore>) -> Result<Self> {
        migrate_legacy_layout(store.as_ref())
            .map_err(|e| QuireError::Migration(e.to_string()))?;

        Ok(Self {
            store,
            bound: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn DocStore> {
        &self.store
    }

    /// Bind a live document to the store.
    ///
    /// Loads the persisted state for the document's name, merges it with
    /// the current in-memory state in both directions, then subscribes a
    /// write-back listener. Resolves only once the initial merge is
    /// complete, so callers can await it before forwarding remote traffic
    /// that references this document.
    pub async fn bind(&self, doc: &SharedDoc) -> Result<()> {
        let mut bound = self.bound.lock().await;
        if bound.contains_key(doc.name()) {
            return Ok(());
        }

        let name = doc.name().to_string();
        let persisted = reconstruct_state(self.store.as_ref(), &name)?;

        // Store receives whatever the live document has that it lacks
        if doc.state_vector() != StateVector::default() {
            self.store
                .append_update(&name, &doc.encode_state_as_update(), UpdateOrigin::Sync)?;
        }

        // Live document receives whatever the store has that it lacks
        if let Some(state) = persisted {
            doc.apply_update(&state)?;
        }

        // Every subsequent update is written back. Failures are logged and
        // do not roll back the in-memory mutation; the live document stays
        // authoritative until the next successful flush.
        let store = Arc::clone(&self.store);
        let wb_name = name.clone();
        let sub = doc.observe_updates(move |update| {
            if let Err(e) = store.append_update(&wb_name, update, UpdateOrigin::Remote) {
                log::warn!("write-back failed for doc '{}': {}", wb_name, e);
            }
        });
        bound.insert(name, sub);
        Ok(())
    }

    /// Whether a document name is currently bound.
    pub async fn is_bound(&self, name: &str) -> bool {
        self.bound.lock().await.contains_key(name)
    }

    /// Flush-and-release path used when the last subscriber disconnects:
    /// saves a compacted snapshot and drops the write-back subscription.
    pub async fn write_on_close(&self, doc: &SharedDoc) -> Result<()> {
        let mut bound = self.bound.lock().await;
        bound.remove(doc.name());

        self.store
            .save_doc(doc.name(), &doc.encode_state_as_update())?;
        self.store.compact(doc.name(), 0)?;
        Ok(())
    }
}

impl std::fmt::Debug for PersistenceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceBinding").finish_non_exhaustive()
    }
}

/// Reconstruct a document's current persisted state: the compacted
/// snapshot plus the update log replayed on top, as one encoded blob.
/// Returns `None` when the store holds nothing for this name.
pub fn reconstruct_state(store: &dyn DocStore, name: &str) -> Result<Option<Vec<u8>>> {
    let snapshot = store.load_doc(name)?;
    let log = store.get_all_updates(name)?;

    if snapshot.is_none() && log.is_empty() {
        return Ok(None);
    }

    let doc = SharedDoc::new("", name, true);
    if let Some(state) = snapshot {
        if let Err(e) = doc.apply_update(&state) {
            log::warn!("skipping undecodable snapshot for doc '{}': {}", name, e);
        }
    }
    for stored in log {
        if let Err(e) = doc.apply_update(&stored.data) {
            log::warn!(
                "skipping undecodable update {} for doc '{}': {}",
                stored.update_id,
                name,
                e
            );
        }
    }

    Ok(Some(doc.encode_state_as_update()))
}

/// One-shot migration from the legacy single-document layout: a document
/// stored under the well-known name "base" is rewritten under the current
/// base name, then the legacy entry is deleted. The rewrite happens before
/// the delete, so an interrupted migration re-runs cleanly (re-appending
/// the same state is idempotent at the CRDT level).
fn migrate_legacy_layout(store: &dyn DocStore) -> Result<bool> {
    let names = store.list_docs()?;
    if !names.iter().any(|n| n == LEGACY_BASE_DOC_NAME) {
        return Ok(false);
    }

    let state = reconstruct_state(store, LEGACY_BASE_DOC_NAME)?;
    if let Some(state) = state {
        store.append_update(BASE_DOC_NAME, &state, UpdateOrigin::Sync)?;
    }
    store.delete_doc(LEGACY_BASE_DOC_NAME)?;

    log::info!(
        "migrated legacy document '{}' to '{}'",
        LEGACY_BASE_DOC_NAME,
        BASE_DOC_NAME
    );
    Ok(true)
}
