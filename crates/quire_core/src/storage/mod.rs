//! Storage abstraction for document persistence.
//!
//! One durable store exists per location. Within it, each document name
//! owns a snapshot plus an append-only update log sufficient to
//! reconstruct current state. Stores key on document *names*, never guids,
//! so a store can be moved between locations without rewriting contents.

mod binding;
mod memory;
mod sqlite;

pub use binding::PersistenceBinding;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;

/// Origin of a stored update, recorded for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Update originated from a local edit
    Local,
    /// Update received from a remote peer
    Remote,
    /// Update captured during the initial bind merge
    Sync,
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote => write!(f, "remote"),
            UpdateOrigin::Sync => write!(f, "sync"),
        }
    }
}

impl std::str::FromStr for UpdateOrigin {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(UpdateOrigin::Local),
            "remote" => Ok(UpdateOrigin::Remote),
            "sync" => Ok(UpdateOrigin::Sync),
            _ => Err(format!("Unknown update origin: {}", s)),
        }
    }
}

/// One row of a document's update log.
#[derive(Debug, Clone)]
pub struct StoredUpdate {
    pub update_id: i64,
    pub doc_name: String,
    pub data: Vec<u8>,
    pub timestamp: i64,
    pub origin: UpdateOrigin,
}

/// Trait for per-location durable document stores.
///
/// Implementations persist a compacted snapshot per document plus an
/// append-only log of incremental updates. Both are opaque CRDT blobs.
pub trait DocStore: Send + Sync {
    /// Load the compacted snapshot for a document.
    ///
    /// Returns `None` if no snapshot exists. Reconstruction of current
    /// state additionally replays the update log on top of it.
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrite the compacted snapshot for a document.
    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()>;

    /// Delete a document's snapshot and all of its updates.
    fn delete_doc(&self, name: &str) -> Result<()>;

    /// List all document names present in the store (snapshot or log).
    fn list_docs(&self) -> Result<Vec<String>>;

    /// Append an incremental update to the document's log.
    ///
    /// Returns the id of the new log row. Appends for the same document
    /// are totally ordered by that id.
    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> Result<i64>;

    /// All updates for a document, oldest first.
    fn get_all_updates(&self, name: &str) -> Result<Vec<StoredUpdate>>;

    /// Fold old updates into the snapshot, keeping only the most recent
    /// `keep_updates` rows in the log.
    fn compact(&self, name: &str, keep_updates: usize) -> Result<()>;
}
