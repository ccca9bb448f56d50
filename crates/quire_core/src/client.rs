//! Client-side connection provider.
//!
//! [`DocProvider`] maintains one WebSocket connection to a sync server for
//! one location and multiplexes any number of documents over it. On open it
//! runs the SyncStep1 handshake for every registered document; local edits
//! are forwarded as `Update` frames; abnormal closes feed an exponential
//! backoff controller; and an independent liveness guard force-closes the
//! socket when the server has gone silent, triggering the same backoff
//! path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::doc::SharedDoc;
use crate::error::{QuireError, Result};
use crate::protocol::{Message, SyncPayload};
use crate::tracker::SyncTracker;

/// Reconnect delay floor: the first retry waits twice this.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Ceiling for the exponential backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(2500);

/// The liveness guard closes the socket when no message of any kind (the
/// server pings count) arrived within this window. Checked at a tenth of
/// the period.
pub const MESSAGE_RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Compute the reconnect delay after `attempts` consecutive abnormal
/// closes: `min(2^attempts * base, max)`.
pub fn backoff_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u64.checked_pow(attempts).unwrap_or(u64::MAX);
    base.checked_mul(factor.min(u32::MAX as u64) as u32)
        .unwrap_or(max)
        .min(max)
}

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Server URL, e.g. `ws://localhost:3030/sync`
    pub server_url: String,
    /// Persistence root this connection is scoped to
    pub location: String,
    /// Garbage-collection flag forwarded to the server
    pub gc: bool,
    pub base_delay: Duration,
    pub max_backoff: Duration,
    pub message_timeout: Duration,
}

impl ProviderConfig {
    pub fn new(server_url: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            location: location.into(),
            gc: true,
            base_delay: DEFAULT_BASE_DELAY,
            max_backoff: DEFAULT_MAX_BACKOFF,
            message_timeout: MESSAGE_RECONNECT_TIMEOUT,
        }
    }
}

/// Status and sync events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    /// A document completed its initial sync round; fires once per
    /// (connection, document).
    DocSynced { guid: String },
}

/// One registered document and its echo guard.
struct DocEntry {
    doc: Arc<SharedDoc>,
    /// Set while the provider applies a remote update, so the update
    /// observer does not bounce the server's own data back to it.
    applying_remote: Arc<AtomicBool>,
    _update_sub: yrs::Subscription,
}

/// Shared state between the provider handle and its connection task.
struct ProviderShared {
    config: ProviderConfig,
    docs: RwLock<HashMap<String, DocEntry>>,
    tracker: std::sync::Mutex<SyncTracker>,
    events_tx: broadcast::Sender<ProviderEvent>,
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,
    connected: AtomicBool,
    should_connect: AtomicBool,
    shutdown: Notify,
}

impl ProviderShared {
    fn emit(&self, event: ProviderEvent) {
        let _ = self.events_tx.send(event);
    }
}

/// Client-side multiplexing provider for one location.
pub struct DocProvider {
    shared: Arc<ProviderShared>,
    outgoing_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl DocProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ProviderShared {
            config,
            docs: RwLock::new(HashMap::new()),
            tracker: std::sync::Mutex::new(SyncTracker::new()),
            events_tx,
            outgoing_tx,
            connected: AtomicBool::new(false),
            should_connect: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        Self {
            shared,
            outgoing_rx: Arc::new(tokio::sync::Mutex::new(outgoing_rx)),
            task: None,
        }
    }

    /// Subscribe to provider events.
    pub fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Whether the given document has completed its sync round on the
    /// current connection.
    pub fn is_synced(&self, guid: &str) -> bool {
        self.shared.tracker.lock().unwrap().is_synced(guid)
    }

    /// Whether every registered document is synced.
    pub fn all_synced(&self) -> bool {
        self.shared.tracker.lock().unwrap().all_synced()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Register a document to sync over this connection.
    ///
    /// Installs an update observer that forwards local edits as `Update`
    /// frames and, when already connected, starts the handshake for the
    /// document immediately. Registering the same guid twice is a no-op.
    pub async fn add_doc(&self, doc: Arc<SharedDoc>) {
        let guid = doc.guid().to_string();
        let mut docs = self.shared.docs.write().await;
        if docs.contains_key(&guid) {
            return;
        }

        let applying_remote = Arc::new(AtomicBool::new(false));
        let sub = {
            let shared = Arc::clone(&self.shared);
            let applying = Arc::clone(&applying_remote);
            let guid = guid.clone();
            doc.observe_updates(move |update| {
                if applying.load(Ordering::SeqCst) {
                    return;
                }
                if !shared.connected.load(Ordering::SeqCst) {
                    // Offline edits are recovered by the next handshake
                    return;
                }
                let frame = Message::Sync {
                    guid: guid.clone(),
                    payload: SyncPayload::Update(update.to_vec()),
                }
                .encode();
                let _ = shared.outgoing_tx.send(frame);
            })
        };

        self.shared.tracker.lock().unwrap().track(&guid);

        if self.shared.connected.load(Ordering::SeqCst) {
            let step1 = Message::Sync {
                guid: guid.clone(),
                payload: SyncPayload::Step1(doc.encode_state_vector()),
            }
            .encode();
            let _ = self.shared.outgoing_tx.send(step1);
        }

        docs.insert(
            guid,
            DocEntry {
                doc,
                applying_remote,
                _update_sub: sub,
            },
        );
    }

    /// Stop syncing a document. Its update observer and sync state are
    /// dropped.
    pub async fn remove_doc(&self, guid: &str) {
        self.shared.docs.write().await.remove(guid);
        self.shared.tracker.lock().unwrap().forget(guid);
    }

    /// Start connecting. Reconnection with exponential backoff continues
    /// until [`disconnect`](Self::disconnect) is called.
    pub fn connect(&mut self) {
        if self.task.is_some() {
            return;
        }
        self.shared.should_connect.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let outgoing_rx = Arc::clone(&self.outgoing_rx);
        self.task = Some(tokio::spawn(async move {
            run_provider_loop(shared, outgoing_rx).await;
        }));
    }

    /// Stop the connection and cancel any pending backoff timer.
    pub async fn disconnect(&mut self) {
        self.shared.should_connect.store(false, Ordering::SeqCst);
        self.shared.shutdown.notify_waiters();

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.tracker.lock().unwrap().reset();
    }
}

impl std::fmt::Debug for DocProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocProvider")
            .field("location", &self.shared.config.location)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Build the connection URL with `location` and `gc` query parameters.
fn build_ws_url(config: &ProviderConfig) -> Result<String> {
    let mut url = Url::parse(&config.server_url)
        .map_err(|e| QuireError::Transport(format!("invalid server url: {e}")))?;
    url.query_pairs_mut()
        .append_pair("location", &config.location)
        .append_pair("gc", if config.gc { "true" } else { "false" });
    Ok(url.to_string())
}

/// The reconnect loop: connect, serve until close, back off, repeat.
async fn run_provider_loop(
    shared: Arc<ProviderShared>,
    outgoing_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
) {
    let url = match build_ws_url(&shared.config) {
        Ok(url) => url,
        Err(e) => {
            log::warn!("provider cannot start: {e}");
            return;
        }
    };

    let mut attempts: u32 = 0;

    while shared.should_connect.load(Ordering::SeqCst) {
        shared.emit(ProviderEvent::Connecting);

        let attempt = tokio::select! {
            attempt = tokio_tungstenite::connect_async(&url) => attempt,
            _ = shared.shutdown.notified() => break,
        };

        match attempt {
            Ok((stream, _)) => {
                attempts = 0;
                shared.connected.store(true, Ordering::SeqCst);
                shared.emit(ProviderEvent::Connected);

                run_connection(&shared, stream, &outgoing_rx).await;

                shared.connected.store(false, Ordering::SeqCst);
                shared.tracker.lock().unwrap().reset();
                shared.emit(ProviderEvent::Disconnected);
            }
            Err(e) => {
                log::warn!("connect to {} failed: {e}", shared.config.server_url);
            }
        }

        if !shared.should_connect.load(Ordering::SeqCst) {
            break;
        }

        attempts += 1;
        let delay = backoff_delay(attempts, shared.config.base_delay, shared.config.max_backoff);
        log::debug!("reconnecting in {delay:?} (attempt {attempts})");
        shared.emit(ProviderEvent::Reconnecting { attempt: attempts });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.shutdown.notified() => break,
        }
    }
}

/// Serve one established connection until it closes.
async fn run_connection<S>(
    shared: &Arc<ProviderShared>,
    stream: S,
    outgoing_rx: &Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
) where
    S: StreamExt<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + SinkExt<WsMessage>
        + Unpin,
    <S as futures_util::Sink<WsMessage>>::Error: std::fmt::Display,
{
    let (mut write, mut read) = stream.split();
    let mut outgoing = outgoing_rx.lock().await;

    // Handshake: announce our state vector for every registered document
    {
        let docs = shared.docs.read().await;
        for entry in docs.values() {
            let step1 = Message::Sync {
                guid: entry.doc.guid().to_string(),
                payload: SyncPayload::Step1(entry.doc.encode_state_vector()),
            }
            .encode();
            if let Err(e) = write.send(WsMessage::Binary(step1.into())).await {
                log::warn!("failed to send handshake: {e}");
                return;
            }
        }
    }

    let mut last_message = Instant::now();
    let mut liveness = tokio::time::interval(shared.config.message_timeout / 10);
    liveness.reset();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        last_message = Instant::now();
                        if let Some(reply) = handle_frame(shared, &data).await {
                            if !crate::protocol::has_content(&reply) {
                                continue;
                            }
                            if let Err(e) = write.send(WsMessage::Binary(reply.into())).await {
                                log::warn!("failed to send reply: {e}");
                                return;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        last_message = Instant::now();
                        if write.send(WsMessage::Pong(payload)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_message = Instant::now();
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::debug!("server closed connection");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("websocket error: {e}");
                        return;
                    }
                }
            }
            frame = outgoing.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = write.send(WsMessage::Binary(frame.into())).await {
                            log::warn!("failed to send update: {e}");
                            return;
                        }
                    }
                    None => return,
                }
            }
            _ = liveness.tick() => {
                // No traffic at all (not even server pings) within the
                // timeout: assume the connection is dead and let backoff
                // take over.
                if last_message.elapsed() > shared.config.message_timeout {
                    log::warn!("no message within {:?}, closing", shared.config.message_timeout);
                    let _ = write.send(WsMessage::Close(None)).await;
                    return;
                }
            }
            _ = shared.shutdown.notified() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return;
            }
        }
    }
}

/// Route one inbound frame; returns an optional reply frame.
async fn handle_frame(shared: &Arc<ProviderShared>, data: &[u8]) -> Option<Vec<u8>> {
    let message = match Message::decode(data) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("dropping undecodable frame: {e}");
            return None;
        }
    };

    match message {
        Message::Sync { guid, payload } => {
            let docs = shared.docs.read().await;
            let Some(entry) = docs.get(&guid) else {
                log::warn!("doc not found for guid '{guid}'");
                return None;
            };

            match payload {
                SyncPayload::Step1(remote_sv) => {
                    // A peer that already has everything needs no reply
                    if entry.doc.state_vector_matches(&remote_sv) {
                        return None;
                    }
                    let diff = match entry.doc.encode_diff(&remote_sv) {
                        Ok(diff) => diff,
                        Err(e) => {
                            log::warn!("failed to encode diff for '{guid}': {e}");
                            return None;
                        }
                    };
                    Some(
                        Message::Sync {
                            guid,
                            payload: SyncPayload::Step2(diff),
                        }
                        .encode(),
                    )
                }
                payload @ (SyncPayload::Step2(_) | SyncPayload::Update(_)) => {
                    let is_step2 = matches!(payload, SyncPayload::Step2(_));
                    let (SyncPayload::Step2(update) | SyncPayload::Update(update)) = payload
                    else {
                        return None;
                    };

                    entry.applying_remote.store(true, Ordering::SeqCst);
                    let applied = entry.doc.apply_update(&update);
                    entry.applying_remote.store(false, Ordering::SeqCst);

                    if let Err(e) = applied {
                        log::warn!("failed to apply update for '{guid}': {e}");
                        return None;
                    }

                    if is_step2 {
                        let transitioned =
                            shared.tracker.lock().unwrap().mark_synced(&guid);
                        if transitioned {
                            shared.emit(ProviderEvent::DocSynced { guid });
                        }
                    }
                    None
                }
            }
        }
        Message::Awareness(_) => {
            // Presence is rendered by the embedding editor; the transport
            // has nothing to do with inbound awareness on this side yet.
            log::debug!("ignoring awareness frame");
            None
        }
        Message::Auth { reason } => {
            log::warn!(
                "permission denied to access {}: {reason}",
                shared.config.server_url
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Text, Transact};

    #[test]
    fn test_backoff_is_monotonic_until_cap() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(2500);

        let delays: Vec<Duration> = (0..8).map(|n| backoff_delay(n, base, max)).collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(800));
        assert_eq!(delays[4], Duration::from_millis(1600));
        // Plateau at the ceiling
        assert_eq!(delays[5], max);
        assert_eq!(delays[6], max);

        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        for pair in delays[..5].windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_backoff_survives_huge_attempt_counts() {
        let max = Duration::from_millis(2500);
        assert_eq!(backoff_delay(64, DEFAULT_BASE_DELAY, max), max);
        assert_eq!(backoff_delay(u32::MAX, DEFAULT_BASE_DELAY, max), max);
    }

    #[test]
    fn test_build_ws_url() {
        let mut config = ProviderConfig::new("ws://localhost:3030/sync", "/data/wiki");
        config.gc = false;

        let url = build_ws_url(&config).unwrap();
        assert!(url.starts_with("ws://localhost:3030/sync?"));
        assert!(url.contains("location=%2Fdata%2Fwiki"));
        assert!(url.contains("gc=false"));
    }

    #[test]
    fn test_build_ws_url_rejects_garbage() {
        let config = ProviderConfig::new("not a url", "loc");
        assert!(build_ws_url(&config).is_err());
    }

    #[tokio::test]
    async fn test_add_doc_tracks_sync_state() {
        let provider = DocProvider::new(ProviderConfig::new("ws://localhost:1/sync", "loc"));
        let doc = Arc::new(SharedDoc::new("loc", "baseDoc", true));
        provider.add_doc(Arc::clone(&doc)).await;

        assert!(!provider.is_synced("locbaseDoc"));
        assert!(!provider.all_synced());
    }

    #[tokio::test]
    async fn test_local_edit_forwards_update_frame_when_connected() {
        let provider = DocProvider::new(ProviderConfig::new("ws://localhost:1/sync", "loc"));
        let doc = Arc::new(SharedDoc::new("loc", "baseDoc", true));
        provider.add_doc(Arc::clone(&doc)).await;
        provider.shared.connected.store(true, Ordering::SeqCst);

        {
            let text = doc.doc().get_or_insert_text("body");
            let mut txn = doc.doc().transact_mut();
            text.insert(&mut txn, 0, "local edit");
        }

        let frame = provider
            .outgoing_rx
            .lock()
            .await
            .try_recv()
            .expect("local edit should produce an outgoing frame");
        match Message::decode(&frame).unwrap() {
            Message::Sync {
                guid,
                payload: SyncPayload::Update(update),
            } => {
                assert_eq!(guid, "locbaseDoc");
                assert!(!update.is_empty());
            }
            other => panic!("expected update frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offline_edits_are_not_queued() {
        let provider = DocProvider::new(ProviderConfig::new("ws://localhost:1/sync", "loc"));
        let doc = Arc::new(SharedDoc::new("loc", "baseDoc", true));
        provider.add_doc(Arc::clone(&doc)).await;

        {
            let text = doc.doc().get_or_insert_text("body");
            let mut txn = doc.doc().transact_mut();
            text.insert(&mut txn, 0, "offline edit");
        }

        // Nothing queued; the next handshake carries the edit instead
        assert!(provider.outgoing_rx.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_apply_does_not_echo() {
        let provider = DocProvider::new(ProviderConfig::new("ws://localhost:1/sync", "loc"));
        let doc = Arc::new(SharedDoc::new("loc", "baseDoc", true));
        provider.add_doc(Arc::clone(&doc)).await;
        provider.shared.connected.store(true, Ordering::SeqCst);

        // A remote peer's update arrives as a sync frame
        let remote = SharedDoc::new("loc", "baseDoc", true);
        {
            let text = remote.doc().get_or_insert_text("body");
            let mut txn = remote.doc().transact_mut();
            text.insert(&mut txn, 0, "remote edit");
        }
        let frame = Message::Sync {
            guid: "locbaseDoc".to_string(),
            payload: SyncPayload::Update(remote.encode_state_as_update()),
        }
        .encode();

        let reply = handle_frame(&provider.shared, &frame).await;
        assert!(reply.is_none());
        assert_eq!(doc.encode_state_vector(), remote.encode_state_vector());

        // The applied remote update must not bounce back out
        assert!(provider.outgoing_rx.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_step2_fires_doc_synced_once() {
        let provider = DocProvider::new(ProviderConfig::new("ws://localhost:1/sync", "loc"));
        let doc = Arc::new(SharedDoc::new("loc", "baseDoc", true));
        provider.add_doc(Arc::clone(&doc)).await;
        let mut events = provider.events();

        let step2 = Message::Sync {
            guid: "locbaseDoc".to_string(),
            payload: SyncPayload::Step2(Vec::new()),
        }
        .encode();

        handle_frame(&provider.shared, &step2).await;
        assert!(provider.is_synced("locbaseDoc"));
        assert_eq!(
            events.recv().await.unwrap(),
            ProviderEvent::DocSynced {
                guid: "locbaseDoc".to_string()
            }
        );

        // A second step2 does not re-fire
        handle_frame(&provider.shared, &step2).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_step1_elicits_step2_diff() {
        let provider = DocProvider::new(ProviderConfig::new("ws://localhost:1/sync", "loc"));
        let doc = Arc::new(SharedDoc::new("loc", "baseDoc", true));
        {
            let text = doc.doc().get_or_insert_text("body");
            let mut txn = doc.doc().transact_mut();
            text.insert(&mut txn, 0, "content");
        }
        provider.add_doc(Arc::clone(&doc)).await;

        // Empty remote state vector: the peer has nothing
        let step1 = Message::Sync {
            guid: "locbaseDoc".to_string(),
            payload: SyncPayload::Step1(SharedDoc::new("x", "y", true).encode_state_vector()),
        }
        .encode();

        let reply = handle_frame(&provider.shared, &step1).await.unwrap();
        match Message::decode(&reply).unwrap() {
            Message::Sync {
                guid,
                payload: SyncPayload::Step2(update),
            } => {
                assert_eq!(guid, "locbaseDoc");
                let check = SharedDoc::new("loc", "baseDoc", true);
                check.apply_update(&update).unwrap();
                assert_eq!(check.encode_state_vector(), doc.encode_state_vector());
            }
            other => panic!("expected step2, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_step1_with_matching_state_vector_elicits_nothing() {
        let provider = DocProvider::new(ProviderConfig::new("ws://localhost:1/sync", "loc"));
        let doc = Arc::new(SharedDoc::new("loc", "baseDoc", true));
        {
            let text = doc.doc().get_or_insert_text("body");
            let mut txn = doc.doc().transact_mut();
            text.insert(&mut txn, 0, "content");
        }
        provider.add_doc(Arc::clone(&doc)).await;

        // The peer announces a state vector identical to ours
        let step1 = Message::Sync {
            guid: "locbaseDoc".to_string(),
            payload: SyncPayload::Step1(doc.encode_state_vector()),
        }
        .encode();

        assert!(handle_frame(&provider.shared, &step1).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_guid_is_dropped() {
        let provider = DocProvider::new(ProviderConfig::new("ws://localhost:1/sync", "loc"));
        let frame = Message::Sync {
            guid: "locghost".to_string(),
            payload: SyncPayload::Update(vec![1, 2, 3]),
        }
        .encode();
        assert!(handle_frame(&provider.shared, &frame).await.is_none());
    }
}
