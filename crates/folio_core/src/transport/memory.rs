//! In-process sync server.
//!
//! Speaks the same protocol as the hosted server: credential handshake,
//! y-sync on the document channel with fan-out to other clients of the same
//! document, and `media-changed` pushes plus `ping`/`pong` on the media
//! channel. Failure knobs (unreachable, rejected opens, silent handshake,
//! dropped connections) let callers exercise reconnect paths without a
//! network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::mpsc;
use url::Url;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::handshake::{ACCESS_DENIED_PREFIX, AUTHENTICATED};
use super::{
    DOCUMENT_CHANNEL_PATH, Frame, MEDIA_CHANNEL_PATH, Transport, TransportChannel,
    TransportEvent, query_param,
};
use crate::BoxFuture;
use crate::crdt::{MemoryStore, ProjectDoc, SyncMessage, UpdateOrigin};
use crate::error::{FolioError, Result};
use crate::project_key::ProjectKey;
use crate::task::CancellationFlag;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChannelKind {
    Document(String),
    Media(String),
}

struct Connection {
    id: u64,
    kind: ChannelKind,
    to_client: mpsc::UnboundedSender<TransportEvent>,
    authenticated: bool,
    kill: CancellationFlag,
}

struct ServerInner {
    tokens: Mutex<HashSet<String>>,
    documents: Mutex<HashMap<String, Doc>>,
    connections: Mutex<Vec<Connection>>,
    next_id: AtomicU64,
    reachable: AtomicBool,
    silent: AtomicBool,
    open_error: Mutex<Option<String>>,
    opens: AtomicUsize,
    open_attempts: AtomicUsize,
    updates_received: AtomicUsize,
}

/// A sync server living in the current process.
///
/// Cloning shares the server.
#[derive(Clone)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServerInner {
                tokens: Mutex::new(HashSet::new()),
                documents: Mutex::new(HashMap::new()),
                connections: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                reachable: AtomicBool::new(true),
                silent: AtomicBool::new(false),
                open_error: Mutex::new(None),
                opens: AtomicUsize::new(0),
                open_attempts: AtomicUsize::new(0),
                updates_received: AtomicUsize::new(0),
            }),
        }
    }

    /// Accept `token` in handshakes (builder pattern).
    pub fn with_token(self, token: &str) -> Self {
        self.add_token(token);
        self
    }

    pub fn add_token(&self, token: &str) {
        self.inner.tokens.lock().unwrap().insert(token.to_string());
    }

    pub fn revoke_token(&self, token: &str) {
        self.inner.tokens.lock().unwrap().remove(token);
    }

    /// When unreachable, every open fails with a connection error.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail every open with `error` (e.g. an HTTP 401 upgrade response).
    pub fn set_open_error(&self, error: Option<&str>) {
        *self.inner.open_error.lock().unwrap() = error.map(str::to_string);
    }

    /// Never answer the credential frame.
    pub fn set_silent(&self, silent: bool) {
        self.inner.silent.store(silent, Ordering::SeqCst);
    }

    /// Number of successful transport opens so far.
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Every open call, including refused ones.
    pub fn open_attempts(&self) -> usize {
        self.inner.open_attempts.load(Ordering::SeqCst)
    }

    /// Open connections that completed the handshake.
    pub fn authenticated_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.authenticated)
            .count()
    }

    /// Update and SyncStep2 messages applied from clients.
    pub fn updates_received(&self) -> usize {
        self.inner.updates_received.load(Ordering::SeqCst)
    }

    /// Close every connection as a server restart would.
    pub fn drop_connections(&self, reason: Option<&str>) {
        let connections = std::mem::take(&mut *self.inner.connections.lock().unwrap());
        log::info!("[MemoryServer] Dropping {} connections", connections.len());
        for connection in connections {
            let _ = connection
                .to_client
                .send(TransportEvent::Closed(reason.map(str::to_string)));
            connection.kill.cancel();
        }
    }

    /// Push a `media-changed` notification to the project's media channels.
    ///
    /// Returns the number of clients notified.
    pub fn notify_media(&self, project: &ProjectKey, filename: &str, action: &str) -> usize {
        let payload = json!({
            "type": "media-changed",
            "projectKey": project.to_string(),
            "filename": filename,
            "action": action,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
        .to_string();
        let key = ChannelKind::Media(project.to_string());
        let connections = self.inner.connections.lock().unwrap();
        connections
            .iter()
            .filter(|c| c.authenticated && c.kind == key)
            .filter(|c| {
                c.to_client
                    .send(TransportEvent::Frame(Frame::Text(payload.clone())))
                    .is_ok()
            })
            .count()
    }

    /// Merge `update` into the server copy of `document_id`.
    pub fn seed_document(&self, document_id: &str, update: &[u8]) -> Result<()> {
        self.inner.apply(document_id, update)
    }

    /// Full server state of a document as a single update.
    pub fn document_state(&self, document_id: &str) -> Option<Vec<u8>> {
        let documents = self.inner.documents.lock().unwrap();
        documents
            .get(document_id)
            .map(|doc| doc.transact().encode_state_as_update_v1(&StateVector::default()))
    }

    /// Decode the server copy of a project document.
    pub fn project_doc(&self, document_id: &str) -> Option<ProjectDoc> {
        let state = self.document_state(document_id)?;
        let doc = ProjectDoc::new(Arc::new(MemoryStore::new()), document_id);
        match doc.apply_update(&state, UpdateOrigin::Sync) {
            Ok(()) => Some(doc),
            Err(e) => {
                log::warn!("[MemoryServer] Could not decode {}: {}", document_id, e);
                None
            }
        }
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryServer")
            .field("opens", &self.open_count())
            .field("authenticated", &self.authenticated_count())
            .finish_non_exhaustive()
    }
}

impl ServerInner {
    fn apply(&self, document_id: &str, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| FolioError::Crdt(format!("Failed to decode update: {}", e)))?;
        let mut documents = self.documents.lock().unwrap();
        let doc = documents.entry(document_id.to_string()).or_default();
        let mut txn = doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| FolioError::Crdt(format!("Failed to apply update: {}", e)))?;
        Ok(())
    }

    fn send_to(&self, id: u64, frame: Frame) {
        let connections = self.connections.lock().unwrap();
        if let Some(connection) = connections.iter().find(|c| c.id == id) {
            let _ = connection.to_client.send(TransportEvent::Frame(frame));
        }
    }

    fn remove(&self, id: u64) {
        self.connections.lock().unwrap().retain(|c| c.id != id);
    }

    /// Returns `false` when the connection must be closed.
    fn handle(&self, id: u64, kind: &ChannelKind, frame: Frame) -> bool {
        let authenticated = self
            .connections
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.id == id && c.authenticated);

        if !authenticated {
            let Frame::Text(credential) = frame else {
                return true;
            };
            if self.silent.load(Ordering::SeqCst) {
                return true;
            }
            if self.tokens.lock().unwrap().contains(&credential) {
                if let Some(c) = self.connections.lock().unwrap().iter_mut().find(|c| c.id == id) {
                    c.authenticated = true;
                }
                self.send_to(id, Frame::Text(AUTHENTICATED.to_string()));
                return true;
            }
            self.send_to(id, Frame::Text(format!("{}invalid-token", ACCESS_DENIED_PREFIX)));
            return false;
        }

        match (kind, frame) {
            (ChannelKind::Document(document_id), Frame::Binary(data)) => {
                self.handle_sync(id, document_id, &data);
            }
            (ChannelKind::Media(_), Frame::Text(text)) if text == "ping" => {
                self.send_to(id, Frame::Text("pong".to_string()));
            }
            _ => {}
        }
        true
    }

    fn handle_sync(&self, id: u64, document_id: &str, data: &[u8]) {
        let messages = match SyncMessage::decode_all(data) {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("[MemoryServer] Bad sync frame: {}", e);
                return;
            }
        };

        for message in messages {
            match message {
                SyncMessage::SyncStep1(remote_sv) => {
                    let (diff, server_sv) = {
                        let mut documents = self.documents.lock().unwrap();
                        let doc = documents.entry(document_id.to_string()).or_default();
                        let txn = doc.transact();
                        let diff = StateVector::decode_v1(&remote_sv)
                            .map(|sv| txn.encode_state_as_update_v1(&sv))
                            .unwrap_or_default();
                        (diff, txn.state_vector().encode_v1())
                    };
                    self.send_to(id, Frame::Binary(SyncMessage::SyncStep2(diff).encode()));
                    self.send_to(id, Frame::Binary(SyncMessage::SyncStep1(server_sv).encode()));
                }
                SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                    if let Err(e) = self.apply(document_id, &update) {
                        log::warn!("[MemoryServer] {}", e);
                        continue;
                    }
                    self.updates_received.fetch_add(1, Ordering::SeqCst);
                    self.broadcast(id, document_id, SyncMessage::Update(update).encode());
                }
            }
        }
    }

    fn broadcast(&self, from: u64, document_id: &str, frame: Vec<u8>) {
        let kind = ChannelKind::Document(document_id.to_string());
        let connections = self.connections.lock().unwrap();
        for connection in connections
            .iter()
            .filter(|c| c.id != from && c.authenticated && c.kind == kind)
        {
            let _ = connection
                .to_client
                .send(TransportEvent::Frame(Frame::Binary(frame.clone())));
        }
    }
}

impl Transport for MemoryServer {
    fn open<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<TransportChannel>> {
        Box::pin(async move {
            self.inner.open_attempts.fetch_add(1, Ordering::SeqCst);
            if !self.inner.reachable.load(Ordering::SeqCst) {
                return Err(FolioError::Transport("Connection refused".to_string()));
            }
            if let Some(error) = self.inner.open_error.lock().unwrap().clone() {
                return Err(FolioError::Transport(error));
            }

            let kind = if url.path().ends_with(DOCUMENT_CHANNEL_PATH) {
                query_param(url, "documentId").map(ChannelKind::Document)
            } else if url.path().ends_with(MEDIA_CHANNEL_PATH) {
                query_param(url, "projectKey").map(ChannelKind::Media)
            } else {
                None
            };
            let kind = kind.ok_or_else(|| {
                FolioError::Transport(format!("HTTP error: 404 Not Found ({})", url))
            })?;

            let (client_tx, mut server_rx) = mpsc::unbounded_channel::<Frame>();
            let (to_client, client_rx) = mpsc::unbounded_channel::<TransportEvent>();
            let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
            let kill = CancellationFlag::new();
            self.inner.connections.lock().unwrap().push(Connection {
                id,
                kind: kind.clone(),
                to_client,
                authenticated: false,
                kill: kill.clone(),
            });
            self.inner.opens.fetch_add(1, Ordering::SeqCst);

            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = kill.cancelled() => break,
                        frame = server_rx.recv() => match frame {
                            Some(frame) => {
                                if !inner.handle(id, &kind, frame) {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
                inner.remove(id);
            });

            Ok(TransportChannel {
                outgoing: client_tx,
                incoming: client_rx,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{authenticate, HandshakeOutcome, document_url, media_url};
    use std::time::Duration;

    #[tokio::test]
    async fn test_handshake_accepts_known_token() {
        let server = MemoryServer::new().with_token("good");
        let key = ProjectKey::new("alice", "novel").unwrap();
        let url = document_url("ws://memory", &key.elements_doc_id()).unwrap();

        let mut channel = server.open(&url).await.unwrap();
        let outcome = authenticate(&mut channel, "good", Duration::from_secs(1)).await;
        assert_eq!(outcome, HandshakeOutcome::Authenticated);
        assert_eq!(server.authenticated_count(), 1);

        let mut channel = server.open(&url).await.unwrap();
        let outcome = authenticate(&mut channel, "bad", Duration::from_secs(1)).await;
        assert_eq!(outcome, HandshakeOutcome::Denied("invalid-token".to_string()));
        assert_eq!(server.open_count(), 2);
    }

    #[tokio::test]
    async fn test_media_ping_and_notification() {
        let server = MemoryServer::new().with_token("t");
        let key = ProjectKey::new("alice", "novel").unwrap();
        let url = media_url("ws://memory", &key).unwrap();
        let mut channel = server.open(&url).await.unwrap();
        authenticate(&mut channel, "t", Duration::from_secs(1)).await;

        assert!(channel.send(Frame::Text("ping".to_string())));
        assert_eq!(
            channel.incoming.recv().await,
            Some(TransportEvent::Frame(Frame::Text("pong".to_string())))
        );

        assert_eq!(server.notify_media(&key, "map.png", "uploaded"), 1);
        let Some(TransportEvent::Frame(Frame::Text(text))) = channel.incoming.recv().await else {
            panic!("expected a notification");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "media-changed");
        assert_eq!(value["projectKey"], "alice/novel");
        assert_eq!(value["action"], "uploaded");
    }

    #[tokio::test]
    async fn test_unreachable_and_rejected_opens() {
        let server = MemoryServer::new();
        let key = ProjectKey::new("a", "b").unwrap();
        let url = document_url("ws://memory", &key.elements_doc_id()).unwrap();

        server.set_reachable(false);
        assert!(server.open(&url).await.is_err());

        server.set_reachable(true);
        server.set_open_error(Some("HTTP error: 401 Unauthorized"));
        let err = server.open(&url).await.unwrap_err();
        assert!(FolioError::is_auth_failure(&err.to_string()));
        assert_eq!(server.open_count(), 0);
        assert_eq!(server.open_attempts(), 2);
    }
}
