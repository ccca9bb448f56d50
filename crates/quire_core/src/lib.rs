//! quire core
//!
//! The synchronization backbone of the quire collaborative editor: it
//! keeps many independently-addressable replicated documents consistent
//! across any number of client connections, persists each document's
//! state to durable storage, and broadcasts live presence information.
//!
//! A document is addressed by a *location* (a persistence root, owning one
//! durable store) plus a *document name*; `location + name` forms the
//! globally unique guid used on the wire. Every location has a
//! distinguished `"baseDoc"` document that syncs automatically on connect;
//! any other document under the same location syncs lazily on first
//! reference by either peer.
//!
//! The CRDT itself is supplied by [`yrs`] and treated as opaque: this
//! crate moves update blobs between replicas and storage, it never
//! interprets them.
//!
//! ## Modules
//!
//! - [`protocol`]: the varint-framed wire codec
//! - [`doc`]: the shared live document wrapper
//! - [`awareness`]: ephemeral presence state and deltas
//! - [`tracker`]: per-peer sync handshake tracking
//! - [`storage`]: the durable store trait, backends, and the per-location
//!   persistence binding
//! - [`client`]: the reconnecting client-side provider

pub mod awareness;
pub mod client;
pub mod doc;
pub mod error;
pub mod protocol;
pub mod storage;
pub mod tracker;

pub use awareness::{Awareness, AwarenessChange};
pub use client::{backoff_delay, DocProvider, ProviderConfig, ProviderEvent};
pub use doc::{doc_guid, SharedDoc, BASE_DOC_NAME};
pub use error::{QuireError, Result};
pub use protocol::{has_content, DecodeError, Message, SyncPayload};
pub use storage::{
    DocStore, MemoryStore, PersistenceBinding, SqliteStore, StoredUpdate, UpdateOrigin,
};
pub use tracker::SyncTracker;
