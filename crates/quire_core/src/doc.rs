//! Shared replicated document.
//!
//! [`SharedDoc`] wraps a yrs [`Doc`] and is the single live instance for one
//! document guid, shared by every connection subscribed to it. quire treats
//! the CRDT itself as opaque: all mutation goes through [`apply_update`],
//! all reads through the state-vector/diff encoders, and every mutation
//! raises an update event observable via [`observe_updates`].
//!
//! [`apply_update`]: SharedDoc::apply_update
//! [`observe_updates`]: SharedDoc::observe_updates

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, ReadTxn, StateVector, Transact, Update};

use crate::error::{QuireError, Result};

/// The distinguished document name every location must have. It is the
/// default document bound to any new connection to that location.
pub const BASE_DOC_NAME: &str = "baseDoc";

/// Compose the globally unique document identifier from a location and a
/// document name.
///
/// Persistence keys on the name alone, so a store can be relocated without
/// rewriting its contents; the guid only exists on the wire and in memory.
pub fn doc_guid(location: &str, name: &str) -> String {
    format!("{location}{name}")
}

/// A live in-memory replicated document, keyed by guid.
pub struct SharedDoc {
    guid: String,
    name: String,
    doc: Doc,
}

impl SharedDoc {
    /// Create a fresh document for `location + name`.
    ///
    /// `gc` controls garbage-collection of tombstoned history in the
    /// underlying document; it only applies at creation time.
    pub fn new(location: &str, name: &str, gc: bool) -> Self {
        let mut options = Options::default();
        options.skip_gc = !gc;

        Self {
            guid: doc_guid(location, name),
            name: name.to_string(),
            doc: Doc::with_options(options),
        }
    }

    /// The globally unique identifier (`location + name`).
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// The document name within its location.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encode the current state vector for the sync handshake.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// The current state vector, decoded. Used to test whether a remote
    /// peer's announced state already matches ours.
    pub fn state_vector(&self) -> StateVector {
        let txn = self.doc.transact();
        txn.state_vector()
    }

    /// Encode the full document state as a single update blob.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Whether a remote peer's encoded state vector already matches ours,
    /// i.e. a diff for it would be empty. Undecodable input is treated as
    /// not matching, so the caller falls through to the diff path and
    /// surfaces the error there.
    pub fn state_vector_matches(&self, remote_state_vector: &[u8]) -> bool {
        match StateVector::decode_v1(remote_state_vector) {
            Ok(sv) => sv == self.state_vector(),
            Err(_) => false,
        }
    }

    /// Encode only the updates a remote peer is missing, given its state
    /// vector.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| QuireError::Crdt(format!("failed to decode state vector: {e}")))?;

        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update blob to the document.
    ///
    /// Applying the same update twice is a no-op; the CRDT discards
    /// structs it already integrated.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let decoded = Update::decode_v1(update)
            .map_err(|e| QuireError::Crdt(format!("failed to decode update: {e}")))?;

        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| QuireError::Crdt(format!("failed to apply update: {e}")))?;
        Ok(())
    }

    /// Subscribe to document updates.
    ///
    /// The callback receives the binary update data whenever the document
    /// changes, fired synchronously at transaction commit. Returns a
    /// subscription that unsubscribes when dropped.
    pub fn observe_updates<F>(&self, callback: F) -> yrs::Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |_txn, event| {
                callback(&event.update);
            })
            .expect("Failed to observe document updates")
    }

    /// Direct access to the underlying yrs document, for embedders that
    /// edit it locally.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl std::fmt::Debug for SharedDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDoc")
            .field("guid", &self.guid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use yrs::{GetString, Text};

    fn write_text(doc: &SharedDoc, content: &str) {
        let text = doc.doc().get_or_insert_text("body");
        let mut txn = doc.doc().transact_mut();
        let len = text.get_string(&txn).len() as u32;
        text.insert(&mut txn, len, content);
    }

    fn read_text(doc: &SharedDoc) -> String {
        let text = doc.doc().get_or_insert_text("body");
        let txn = doc.doc().transact();
        text.get_string(&txn)
    }

    #[test]
    fn test_guid_composition() {
        let doc = SharedDoc::new("/data/wiki", "notes", true);
        assert_eq!(doc.guid(), "/data/wikinotes");
        assert_eq!(doc.name(), "notes");
    }

    #[test]
    fn test_full_state_transfer() {
        let a = SharedDoc::new("loc", "d", true);
        let b = SharedDoc::new("loc", "d", true);

        write_text(&a, "hello");
        b.apply_update(&a.encode_state_as_update()).unwrap();

        assert_eq!(read_text(&b), "hello");
        assert_eq!(a.encode_state_vector(), b.encode_state_vector());
    }

    #[test]
    fn test_diff_against_state_vector() {
        let a = SharedDoc::new("loc", "d", true);
        let b = SharedDoc::new("loc", "d", true);

        write_text(&a, "hello");
        b.apply_update(&a.encode_state_as_update()).unwrap();
        write_text(&a, " world");

        // b only needs the second edit
        let diff = a.encode_diff(&b.encode_state_vector()).unwrap();
        b.apply_update(&diff).unwrap();

        assert_eq!(read_text(&b), "hello world");
        assert_eq!(a.encode_state_vector(), b.encode_state_vector());
    }

    #[test]
    fn test_apply_update_is_idempotent() {
        let a = SharedDoc::new("loc", "d", true);
        let b = SharedDoc::new("loc", "d", true);

        write_text(&a, "once");
        let update = a.encode_state_as_update();

        b.apply_update(&update).unwrap();
        let state_after_first = b.encode_state_as_update();
        b.apply_update(&update).unwrap();

        assert_eq!(b.encode_state_as_update(), state_after_first);
        assert_eq!(read_text(&b), "once");
    }

    #[test]
    fn test_apply_empty_update_is_noop() {
        let doc = SharedDoc::new("loc", "d", true);
        doc.apply_update(&[]).unwrap();
        assert_eq!(read_text(&doc), "");
    }

    #[test]
    fn test_apply_garbage_update_fails() {
        let doc = SharedDoc::new("loc", "d", true);
        assert!(doc.apply_update(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_observe_updates_fires_on_mutation() {
        let a = SharedDoc::new("loc", "d", true);
        let b = SharedDoc::new("loc", "d", true);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let _sub = b.observe_updates(move |update| {
            assert!(!update.is_empty());
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        write_text(&a, "ping");
        b.apply_update(&a.encode_state_as_update()).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_convergence_under_concurrent_edits() {
        let a = SharedDoc::new("loc", "d", true);
        let b = SharedDoc::new("loc", "d", true);

        write_text(&a, "from-a");
        write_text(&b, "from-b");

        // Exchange diffs both ways, in either order
        let diff_for_b = a.encode_diff(&b.encode_state_vector()).unwrap();
        let diff_for_a = b.encode_diff(&a.encode_state_vector()).unwrap();
        b.apply_update(&diff_for_b).unwrap();
        a.apply_update(&diff_for_a).unwrap();

        assert_eq!(a.encode_state_vector(), b.encode_state_vector());
        assert_eq!(read_text(&a), read_text(&b));
    }
}
