//! Provider that replicates the project document with the sync server.
//!
//! # Connect sequence
//!
//! 1. Validate the key and resolve the transport URL; detach any previous
//!    project; phase `Syncing`.
//! 2. Hydrate the local document, seeding a README item into an empty tree,
//!    and publish every collection.
//! 3. Fetch a credential. Without one the provider stays attached locally
//!    with phase `Offline`.
//! 4. Start a [`ReplicationSession`] and wait for its first attempt. A denial
//!    or an expired session detaches and fails the connect; a transient
//!    failure leaves the provider `Offline` with reconnects scheduled.
//!
//! # Teardown
//!
//! The document is detached first (observers unbound), then the durable log
//! is compacted, then the transport is closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::attached::AttachedDoc;
use super::state::ProviderState;
use super::{ConnectOptions, ConnectResult, SyncProvider};
use crate::BoxFuture;
use crate::auth::AuthTokenSource;
use crate::config::SyncTimings;
use crate::connectivity::Connectivity;
use crate::crdt::{CollectionName, CollectionValue, DocumentStore, ProjectDoc, UpdateOrigin};
use crate::error::FolioError;
use crate::model::SyncPhase;
use crate::project_key::ProjectKey;
use crate::task::CancellationFlag;
use crate::transport::{
    Backoff, FirstAttempt, ReplicationSession, SessionEvent, SessionOptions, Transport,
    document_url,
};

/// Terminal error emitted once reconnect attempts are exhausted.
pub const UNABLE_TO_CONNECT: &str = "Unable to connect to server. Please refresh the page.";

const SESSION_EXPIRED: &str = "Session expired";

struct ReplicatedConnection {
    key: ProjectKey,
    attached: AttachedDoc,
    session: Option<ReplicationSession>,
    live: CancellationFlag,
}

/// Server-replicated provider.
pub struct ReplicatedProvider {
    store: Arc<dyn DocumentStore>,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn AuthTokenSource>,
    connectivity: Connectivity,
    timings: SyncTimings,
    transport_url: Option<String>,
    state: Arc<ProviderState>,
    connection: Mutex<Option<ReplicatedConnection>>,
    generation: AtomicU64,
}

impl ReplicatedProvider {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn AuthTokenSource>,
        connectivity: Connectivity,
        timings: SyncTimings,
        transport_url: Option<String>,
    ) -> Self {
        Self {
            store,
            transport,
            tokens,
            connectivity,
            timings,
            transport_url,
            state: Arc::new(ProviderState::new("ReplicatedProvider")),
            connection: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn project_key(&self) -> Option<ProjectKey> {
        self.connection
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.key.clone())
    }

    /// Reset the backoff and reconnect immediately.
    pub fn reconnect(&self) {
        if let Some(session) = self
            .connection
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|c| c.session.as_ref())
        {
            session.reconnect();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn open_local(&self, key: &ProjectKey) -> Arc<ProjectDoc> {
        let doc = Arc::new(ProjectDoc::new(
            Arc::clone(&self.store),
            key.elements_doc_id().to_string(),
        ));
        if let Err(e) = doc.hydrate() {
            self.state
                .error(format!("Local storage unavailable, continuing in memory: {}", e));
        }
        match doc.seed_default_if_empty() {
            Ok(Some(update)) => {
                if let Err(e) = doc.persist(&update, UpdateOrigin::Local) {
                    self.state.error(format!("Failed to save elements: {}", e));
                }
            }
            Ok(None) => {}
            Err(e) => self.state.error(format!("Failed to seed project: {}", e)),
        }
        doc
    }

    fn start_session(
        &self,
        doc: Arc<ProjectDoc>,
        options: SessionOptions,
        live: CancellationFlag,
    ) -> (ReplicationSession, tokio::sync::oneshot::Receiver<FirstAttempt>) {
        let state = Arc::clone(&self.state);
        let event_doc = Arc::clone(&doc);
        ReplicationSession::start(
            doc,
            Arc::clone(&self.transport),
            Arc::clone(&self.tokens),
            &self.connectivity,
            options,
            move |event| {
                if !live.is_cancelled() {
                    apply_session_event(&state, &event_doc, event);
                }
            },
        )
    }
}

fn apply_session_event(state: &ProviderState, doc: &ProjectDoc, event: SessionEvent) {
    match event {
        SessionEvent::Connecting => state.set_phase(SyncPhase::Syncing),
        SessionEvent::Authenticated => state.set_phase(SyncPhase::Synced),
        SessionEvent::Converged => {
            for name in CollectionName::ALL {
                state.emit(doc.read(name));
            }
        }
        SessionEvent::Disconnected(reason) => {
            if let Some(reason) = reason {
                log::info!("[ReplicatedProvider] Disconnected: {}", reason);
            }
            state.set_phase(SyncPhase::Offline);
        }
        SessionEvent::Denied(reason) => {
            state.set_phase(SyncPhase::Unavailable);
            state.error(format!("Access denied: {}", reason));
        }
        SessionEvent::SessionExpired => {
            state.set_phase(SyncPhase::Unavailable);
            state.error(SESSION_EXPIRED);
        }
        SessionEvent::Exhausted => state.error(UNABLE_TO_CONNECT),
        SessionEvent::RemoteError(message) => state.error(format!("Sync error: {}", message)),
    }
}

impl SyncProvider for ReplicatedProvider {
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'_, ConnectResult> {
        Box::pin(async move {
            let key = match ProjectKey::new(options.owner, options.slug) {
                Ok(key) => key,
                Err(e) => return ConnectResult::failed(e.to_string()),
            };
            let Some(base) = options
                .transport_url
                .or_else(|| self.transport_url.clone())
                .filter(|url| !url.is_empty())
            else {
                return ConnectResult::failed(FolioError::MissingTransportUrl.to_string());
            };
            let doc_id = key.elements_doc_id();
            let url = match document_url(&base, &doc_id) {
                Ok(url) => url,
                Err(e) => return ConnectResult::failed(e.to_string()),
            };

            self.disconnect();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            log::info!("[ReplicatedProvider] Connecting to {}", doc_id);
            self.state.set_phase(SyncPhase::Syncing);

            let doc = self.open_local(&key);
            let attached = AttachedDoc::attach(Arc::clone(&doc), Arc::clone(&self.state));
            attached.emit_all(&self.state);
            let live = CancellationFlag::new();
            *self.connection.lock().unwrap() = Some(ReplicatedConnection {
                key,
                attached,
                session: None,
                live: live.clone(),
            });

            if self.tokens.token().await.is_none() {
                if !self.is_current(generation) {
                    return ConnectResult::failed("Connect superseded");
                }
                log::info!("[ReplicatedProvider] No credential, staying local-only");
                self.state.set_phase(SyncPhase::Offline);
                return ConnectResult::ok();
            }
            if !self.is_current(generation) {
                return ConnectResult::failed("Connect superseded");
            }

            let session_options = SessionOptions {
                url,
                backoff: Backoff::for_documents(&self.timings),
                handshake_timeout: self.timings.handshake_timeout,
            };
            let (session, first) = self.start_session(doc, session_options, live);
            if let Some(connection) = self.connection.lock().unwrap().as_mut() {
                connection.session = Some(session);
            }

            match first.await {
                Ok(FirstAttempt::Authenticated) => ConnectResult::ok(),
                Ok(FirstAttempt::Offline(reason)) => {
                    log::info!(
                        "[ReplicatedProvider] Server unreachable ({}), working offline",
                        reason.as_deref().unwrap_or("offline")
                    );
                    ConnectResult::ok()
                }
                Ok(FirstAttempt::Denied(reason)) => {
                    if self.is_current(generation) {
                        self.disconnect();
                    }
                    ConnectResult::failed(format!("Access denied: {}", reason))
                }
                Ok(FirstAttempt::SessionExpired) => {
                    if self.is_current(generation) {
                        self.disconnect();
                    }
                    ConnectResult::failed(SESSION_EXPIRED)
                }
                Err(_) => ConnectResult::failed("Connect cancelled"),
            }
        })
    }

    fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let Some(connection) = self.connection.lock().unwrap().take() else {
            self.state.reset();
            return;
        };
        log::info!("[ReplicatedProvider] Disconnecting from {}", connection.key);
        connection.live.cancel();

        let ReplicatedConnection {
            attached, session, ..
        } = connection;
        let doc = attached.detach();
        if let Err(e) = doc.compact() {
            log::warn!("[ReplicatedProvider] Compaction failed: {}", e);
        }
        if let Some(session) = session {
            session.close();
        }
        self.state.reset();
    }

    fn is_connected(&self) -> bool {
        self.connection.lock().unwrap().is_some()
    }

    fn update(&self, value: CollectionValue) {
        if !self.is_connected() {
            log::warn!(
                "[ReplicatedProvider] Ignoring update of {}: not connected",
                value.name()
            );
            return;
        }
        self.state.emit(value.clone());
        let handles = self.connection.lock().unwrap().as_ref().map(|c| {
            (
                c.attached.writer(),
                c.session.as_ref().map(ReplicationSession::update_sender),
            )
        });
        let Some((writer, sender)) = handles else {
            return;
        };
        if let Some(update) = writer.write(&value, &self.state)
            && let Some(sender) = sender
        {
            sender.send(update);
        }
    }

    fn state(&self) -> &ProviderState {
        &self.state
    }
}
