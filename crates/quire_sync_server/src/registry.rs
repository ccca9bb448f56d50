//! Process-wide document registry.
//!
//! The registry maps locations to [`LocationHub`]s. A hub owns everything
//! shared by the connections to one location: the persistence binding, the
//! live documents keyed by guid, per-document subscriber sets, the
//! location-wide fan-out channel, and the base document's awareness state.
//!
//! Hubs and documents are created lazily on first reference and torn down
//! when their last subscriber departs (store-then-destroy).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use quire_core::{
    doc_guid, Awareness, DocStore, PersistenceBinding, Result, SharedDoc, SqliteStore,
};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Connection identifier, unique within the process.
pub type ConnId = u64;

/// A frame fanned out to a location's connections. Receivers drop frames
/// they originated and frames for documents they are not subscribed to.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub origin: ConnId,
    pub guid: String,
    pub frame: Vec<u8>,
}

/// Statistics over the registry, served by the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub active_connections: usize,
    pub active_locations: usize,
    pub live_documents: usize,
}

/// Shared state for all connections to one location.
pub struct LocationHub {
    location: String,
    binding: PersistenceBinding,
    /// Live documents keyed by guid.
    docs: RwLock<HashMap<String, Arc<SharedDoc>>>,
    /// Subscriber sets per guid.
    subscribers: RwLock<HashMap<String, HashSet<ConnId>>>,
    /// Presence state for the base document.
    awareness: std::sync::Mutex<Awareness>,
    broadcast_tx: broadcast::Sender<OutboundFrame>,
    connection_count: AtomicUsize,
}

impl LocationHub {
    /// Open a hub over the given store. Runs the location's storage
    /// migration; a migration failure means the location must not serve.
    pub fn open(location: &str, store: Arc<dyn DocStore>) -> Result<Self> {
        let binding = PersistenceBinding::open(store)?;
        let (broadcast_tx, _) = broadcast::channel(1024);

        Ok(Self {
            location: location.to_string(),
            binding,
            docs: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            awareness: std::sync::Mutex::new(Awareness::new()),
            broadcast_tx,
            connection_count: AtomicUsize::new(0),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Receiver for the location's fan-out channel.
    pub fn subscribe_channel(&self) -> broadcast::Receiver<OutboundFrame> {
        self.broadcast_tx.subscribe()
    }

    /// Presence state for the base document.
    pub fn awareness(&self) -> &std::sync::Mutex<Awareness> {
        &self.awareness
    }

    pub fn add_connection(&self) {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Get the live document for a guid, if any.
    pub async fn doc(&self, guid: &str) -> Option<Arc<SharedDoc>> {
        self.docs.read().await.get(guid).cloned()
    }

    pub async fn doc_count(&self) -> usize {
        self.docs.read().await.len()
    }

    /// Return the existing document for `name`, or construct one: bind it
    /// to the location's persistence (awaiting the initial merge), then
    /// register it under its guid.
    ///
    /// Safe under concurrent first access: the insertion is re-checked
    /// under the write lock, so only one instance is ever registered per
    /// guid. A bind failure registers nothing, so a retried access can
    /// attempt creation again.
    pub async fn get_or_create_doc(&self, name: &str, gc: bool) -> Result<Arc<SharedDoc>> {
        let guid = doc_guid(&self.location, name);

        {
            let docs = self.docs.read().await;
            if let Some(doc) = docs.get(&guid) {
                return Ok(Arc::clone(doc));
            }
        }

        // Load-then-merge before the document becomes visible, so no
        // forwarded message can reach it ahead of its persisted baseline.
        let doc = Arc::new(SharedDoc::new(&self.location, name, gc));
        self.binding.bind(&doc).await?;

        let mut docs = self.docs.write().await;
        // Double-check after acquiring the write lock; if another
        // connection won the race its instance is authoritative and our
        // freshly bound copy is discarded along with its subscription.
        if let Some(existing) = docs.get(&guid) {
            return Ok(Arc::clone(existing));
        }
        docs.insert(guid.clone(), Arc::clone(&doc));
        info!(location = %self.location, guid = %guid, "created document");
        Ok(doc)
    }

    /// Register a connection as subscriber of a guid. Returns `true` when
    /// newly added.
    pub async fn subscribe(&self, guid: &str, conn: ConnId) -> bool {
        let mut subs = self.subscribers.write().await;
        subs.entry(guid.to_string()).or_default().insert(conn)
    }

    /// Fan a frame out to the location's other connections.
    pub fn broadcast(&self, origin: ConnId, guid: &str, frame: Vec<u8>) {
        let _ = self.broadcast_tx.send(OutboundFrame {
            origin,
            guid: guid.to_string(),
            frame,
        });
    }

    /// Remove a connection from every subscriber set it had joined. Each
    /// document whose subscriber set becomes empty is flushed to the store
    /// and evicted. Returns the evicted guids.
    pub async fn remove_connection(&self, conn: ConnId) -> Vec<String> {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);

        let emptied: Vec<String> = {
            let mut subs = self.subscribers.write().await;
            let mut emptied = Vec::new();
            subs.retain(|guid, conns| {
                conns.remove(&conn);
                if conns.is_empty() {
                    emptied.push(guid.clone());
                    false
                } else {
                    true
                }
            });
            emptied
        };

        let mut docs = self.docs.write().await;
        for guid in &emptied {
            if let Some(doc) = docs.remove(guid) {
                if let Err(e) = self.binding.write_on_close(&doc).await {
                    warn!(guid = %guid, "failed to flush document on close: {e}");
                }
                debug!(guid = %guid, "evicted idle document");
            }
        }
        emptied
    }
}

impl std::fmt::Debug for LocationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationHub")
            .field("location", &self.location)
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Global registry mapping locations to hubs.
pub struct DocRegistry {
    /// Base path for location databases. A location maps to
    /// `<data_dir>/<location>.db`, with leading slashes stripped so every
    /// store stays under the data directory.
    data_dir: PathBuf,
    hubs: RwLock<HashMap<String, Arc<LocationHub>>>,
}

impl DocRegistry {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            hubs: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the hub for a location.
    ///
    /// Creation opens the location's SQLite store and runs its migration;
    /// failure propagates and leaves no registry entry, so the next
    /// connection retries initialisation.
    pub async fn get_or_create_hub(&self, location: &str) -> Result<Arc<LocationHub>> {
        {
            let hubs = self.hubs.read().await;
            if let Some(hub) = hubs.get(location) {
                return Ok(Arc::clone(hub));
            }
        }

        let mut hubs = self.hubs.write().await;
        if let Some(hub) = hubs.get(location) {
            return Ok(Arc::clone(hub));
        }

        let db_path = self.data_dir.join(format!("{}.db", location.trim_start_matches('/')));
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store: Arc<dyn DocStore> = Arc::new(SqliteStore::open(&db_path)?);
        let hub = Arc::new(LocationHub::open(location, store)?);

        hubs.insert(location.to_string(), Arc::clone(&hub));
        info!(location = %location, db = %db_path.display(), "opened location");
        Ok(hub)
    }

    /// Get an existing hub without creating one.
    pub async fn hub(&self, location: &str) -> Option<Arc<LocationHub>> {
        self.hubs.read().await.get(location).cloned()
    }

    /// Drop a hub once its last connection departed. The hub's documents
    /// were already flushed as their subscriber sets emptied.
    pub async fn maybe_remove_hub(&self, location: &str) {
        let mut hubs = self.hubs.write().await;
        if let Some(hub) = hubs.get(location) {
            if hub.connection_count() == 0 {
                hubs.remove(location);
                info!(location = %location, "closed idle location");
            }
        }
    }

    pub async fn stats(&self) -> SyncStats {
        let hubs = self.hubs.read().await;
        let mut stats = SyncStats {
            active_locations: hubs.len(),
            ..Default::default()
        };
        for hub in hubs.values() {
            stats.active_connections += hub.connection_count();
            stats.live_documents += hub.doc_count().await;
        }
        stats
    }
}

impl std::fmt::Debug for DocRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocRegistry")
            .field("data_dir", &self.data_dir)
            .finish()
    }
}
