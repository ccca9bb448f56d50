//! Per-connection multiplexer state and frame routing.
//!
//! A connection is scoped to one location at establishment time. It starts
//! subscribed to the location's base document and implicitly subscribes to
//! any further document under the same location the first time either peer
//! references its guid. All inbound frames are routed here; replies go
//! back to the same connection, while updates fan out to the document's
//! other subscribers through the hub's broadcast channel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quire_core::{
    doc_guid, Message, QuireError, Result, SyncPayload, SyncTracker, BASE_DOC_NAME,
};
use tracing::{debug, info, warn};

use crate::registry::{ConnId, LocationHub};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Server-side connection state.
pub struct Connection {
    id: ConnId,
    gc: bool,
    hub: Arc<LocationHub>,
    /// Guids this connection receives fan-out for. Grows monotonically
    /// until disconnect.
    subscribed: HashSet<String>,
    tracker: SyncTracker,
    /// Awareness client ids controlled by this connection, removed and
    /// rebroadcast on disconnect.
    awareness_ids: HashSet<u64>,
}

impl Connection {
    /// Accept a connection to the hub's location: create/bind the base
    /// document, join its subscriber set, and produce the frames to send
    /// immediately (the base document's SyncStep1, plus the current
    /// awareness snapshot when non-empty).
    pub async fn open(hub: Arc<LocationHub>, gc: bool) -> Result<(Self, Vec<Vec<u8>>)> {
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

        let base = hub.get_or_create_doc(BASE_DOC_NAME, gc).await?;
        let base_guid = base.guid().to_string();
        hub.add_connection();
        hub.subscribe(&base_guid, id).await;

        let mut conn = Self {
            id,
            gc,
            hub,
            subscribed: HashSet::new(),
            tracker: SyncTracker::new(),
            awareness_ids: HashSet::new(),
        };
        conn.subscribed.insert(base_guid.clone());
        conn.tracker.track(&base_guid);

        let mut initial = vec![Message::Sync {
            guid: base_guid,
            payload: SyncPayload::Step1(base.encode_state_vector()),
        }
        .encode()];

        {
            let awareness = conn.hub.awareness().lock().unwrap();
            if !awareness.is_empty() {
                initial.push(Message::Awareness(awareness.encode_full()).encode());
            }
        }

        Ok((conn, initial))
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn is_subscribed(&self, guid: &str) -> bool {
        self.subscribed.contains(guid)
    }

    /// Guids this connection currently follows.
    pub fn subscribed_guids(&self) -> Vec<String> {
        self.subscribed.iter().cloned().collect()
    }

    /// Guid of this location's base document.
    fn base_guid(&self) -> String {
        doc_guid(self.hub.location(), BASE_DOC_NAME)
    }

    /// Route one inbound frame. Returns the reply frames for this
    /// connection; fan-out to other subscribers happens through the hub.
    ///
    /// Errors are per-frame: the caller logs them and keeps the
    /// connection open.
    pub async fn handle_frame(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let message = Message::decode(data)?;

        match message {
            Message::Sync { guid, payload } => self.handle_sync(guid, payload).await,
            Message::Awareness(update) => {
                self.handle_awareness(&update)?;
                Ok(Vec::new())
            }
            Message::Auth { reason } => {
                // Read-only on this side; the server never grants or
                // revokes anything over the wire.
                warn!(conn = self.id, "dropping inbound auth frame: {reason}");
                Ok(Vec::new())
            }
        }
    }

    async fn handle_sync(&mut self, guid: String, payload: SyncPayload) -> Result<Vec<Vec<u8>>> {
        let mut replies = Vec::new();

        if !self.subscribed.contains(&guid) {
            // Implicit subscribe to another document under this location
            let location = self.hub.location().to_string();
            let Some(name) = guid.strip_prefix(location.as_str()).filter(|n| !n.is_empty())
            else {
                return Err(QuireError::UnknownDocument { guid, location });
            };

            let doc = self.hub.get_or_create_doc(name, self.gc).await?;
            self.hub.subscribe(&guid, self.id).await;
            self.subscribed.insert(guid.clone());
            self.tracker.track(&guid);
            debug!(conn = self.id, guid = %guid, "implicit subscribe");

            // Announce our state for the new document before processing
            // the inbound payload
            replies.push(
                Message::Sync {
                    guid: guid.clone(),
                    payload: SyncPayload::Step1(doc.encode_state_vector()),
                }
                .encode(),
            );
        }

        let doc = self
            .hub
            .doc(&guid)
            .await
            .ok_or_else(|| QuireError::UnknownDocument {
                guid: guid.clone(),
                location: self.hub.location().to_string(),
            })?;

        match payload {
            SyncPayload::Step1(remote_sv) => {
                // Elide the reply when the sender already matches us
                if doc.state_vector_matches(&remote_sv) {
                    return Ok(replies);
                }
                let diff = doc.encode_diff(&remote_sv)?;
                replies.push(
                    Message::Sync {
                        guid,
                        payload: SyncPayload::Step2(diff),
                    }
                    .encode(),
                );
            }
            payload @ (SyncPayload::Step2(_) | SyncPayload::Update(_)) => {
                let is_step2 = matches!(payload, SyncPayload::Step2(_));
                let (SyncPayload::Step2(update) | SyncPayload::Update(update)) = payload
                else {
                    unreachable!()
                };

                doc.apply_update(&update)?;

                // The document's change fans out to every other
                // subscriber; the write-back listener installed at bind
                // time persists it independently. Origin tagging keeps
                // the frame from echoing back to its sender.
                self.hub.broadcast(
                    self.id,
                    &guid,
                    Message::Sync {
                        guid: guid.clone(),
                        payload: SyncPayload::Update(update),
                    }
                    .encode(),
                );

                if is_step2 && self.tracker.mark_synced(&guid) {
                    info!(conn = self.id, guid = %guid, "document is live");
                }
            }
        }

        Ok(replies)
    }

    fn handle_awareness(&mut self, update: &[u8]) -> Result<()> {
        let change = {
            let mut awareness = self.hub.awareness().lock().unwrap();
            awareness.apply_update(update)?
        };

        if change.is_empty() {
            return Ok(());
        }

        // Track which client ids this connection controls, so disconnect
        // can clear them
        for id in change.added.iter().chain(change.updated.iter()) {
            self.awareness_ids.insert(*id);
        }
        for id in &change.removed {
            self.awareness_ids.remove(id);
        }

        self.hub.broadcast(
            self.id,
            &self.base_guid(),
            Message::Awareness(update.to_vec()).encode(),
        );
        Ok(())
    }

    /// Tear the connection down: clear its awareness entries (broadcasting
    /// the removal to remaining subscribers), then release it from every
    /// subscriber set, flushing documents it was the last subscriber of.
    pub async fn close(mut self) {
        if !self.awareness_ids.is_empty() {
            let ids: Vec<u64> = self.awareness_ids.drain().collect();
            let removal = {
                let mut awareness = self.hub.awareness().lock().unwrap();
                awareness.remove_clients(&ids)
            };
            self.hub
                .broadcast(self.id, &self.base_guid(), Message::Awareness(removal).encode());
        }

        let evicted = self.hub.remove_connection(self.id).await;
        debug!(
            conn = self.id,
            evicted = evicted.len(),
            "connection closed"
        );
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("subscribed", &self.subscribed.len())
            .finish()
    }
}
