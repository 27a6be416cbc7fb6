//! Keeps one replicated document connected to the server.
//!
//! The session owns the transport for its document. Each open runs the
//! credential handshake, then the y-sync exchange; local updates are forwarded
//! while authenticated and dropped otherwise (the next SyncStep1 carries them
//! over). Transient failures reconnect on a [`Backoff`] schedule; a denial or
//! an expired session ends the session for good.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

use super::backoff::Backoff;
use super::handshake::{HandshakeOutcome, authenticate};
use super::{Frame, Transport, TransportChannel, TransportEvent};
use crate::auth::AuthTokenSource;
use crate::connectivity::Connectivity;
use crate::crdt::{SyncMessage, SyncTarget, handle_message};
use crate::error::FolioError;
use crate::task::CancellationFlag;

/// Lifecycle notifications emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A transport open is in progress.
    Connecting,
    /// The handshake succeeded; frames are now trusted.
    Authenticated,
    /// The server's SyncStep2 was applied.
    Converged,
    /// The transport went away. A reconnect follows unless the session ends.
    Disconnected(Option<String>),
    /// The server rejected the credential. Terminal.
    Denied(String),
    /// The server reported an expired or invalid session. Terminal.
    SessionExpired,
    /// Reconnect attempts are used up. The session idles until the host comes
    /// back online or [`ReplicationSession::reconnect`] is called.
    Exhausted,
    /// A frame from the server could not be applied.
    RemoteError(String),
}

/// Outcome of the first connection attempt, reported once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstAttempt {
    Authenticated,
    Denied(String),
    SessionExpired,
    /// Could not reach the server; reconnects are scheduled.
    Offline(Option<String>),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub url: Url,
    pub backoff: Backoff,
    pub handshake_timeout: Duration,
}

enum Command {
    Update(Vec<u8>),
    Reconnect,
}

/// Forwards local updates to a session. Sends after the session stopped
/// are dropped.
#[derive(Clone)]
pub struct UpdateSender(mpsc::UnboundedSender<Command>);

impl UpdateSender {
    pub fn send(&self, update: Vec<u8>) {
        if update.is_empty() {
            return;
        }
        let _ = self.0.send(Command::Update(update));
    }
}

/// Handle to a running session. Dropping it stops the session.
pub struct ReplicationSession {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationFlag,
    handle: JoinHandle<()>,
}

type EventCallback = Arc<dyn Fn(SessionEvent) + Send + Sync>;

impl ReplicationSession {
    /// Spawn the session loop. The receiver resolves with the first attempt's
    /// outcome, or errors if the session is closed before one completes.
    pub fn start(
        target: Arc<dyn SyncTarget>,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn AuthTokenSource>,
        connectivity: &Connectivity,
        options: SessionOptions,
        on_event: impl Fn(SessionEvent) + Send + Sync + 'static,
    ) -> (Self, oneshot::Receiver<FirstAttempt>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (first_tx, first_rx) = oneshot::channel();
        let cancel = CancellationFlag::new();

        let worker = Worker {
            target,
            transport,
            tokens,
            online: connectivity.subscribe(),
            options,
            on_event: Arc::new(on_event),
            commands: commands_rx,
            cancel: cancel.clone(),
            first: Some(first_tx),
        };
        let handle = tokio::spawn(worker.run());

        (
            Self {
                commands: commands_tx,
                cancel,
                handle,
            },
            first_rx,
        )
    }

    /// Forward a local update. Dropped when not authenticated.
    pub fn send_update(&self, update: Vec<u8>) {
        self.update_sender().send(update);
    }

    /// A cloneable handle that forwards local updates into this session.
    pub fn update_sender(&self) -> UpdateSender {
        UpdateSender(self.commands.clone())
    }

    /// Reset the backoff and reconnect now.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the loop and close the transport.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for ReplicationSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

impl std::fmt::Debug for ReplicationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationSession")
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

enum Attempt {
    Connected(TransportChannel),
    Denied(String),
    Failed(String),
    Cancelled,
}

enum PumpEnd {
    Cancelled,
    Closed(Option<String>),
    Offline,
    Reconnect,
}

struct Worker {
    target: Arc<dyn SyncTarget>,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn AuthTokenSource>,
    online: watch::Receiver<bool>,
    options: SessionOptions,
    on_event: EventCallback,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationFlag,
    first: Option<oneshot::Sender<FirstAttempt>>,
}

impl Worker {
    fn emit(&self, event: SessionEvent) {
        if !self.cancel.is_cancelled() {
            (self.on_event)(event);
        }
    }

    fn report_first(&mut self, attempt: FirstAttempt) {
        if let Some(first) = self.first.take() {
            let _ = first.send(attempt);
        }
    }

    fn online_now(&mut self) -> bool {
        *self.online.borrow_and_update()
    }

    async fn run(mut self) {
        let mut backoff = self.options.backoff.clone();

        while !self.cancel.is_cancelled() {
            if !self.online_now() {
                log::info!("[ReplicationSession] Offline, waiting for connectivity");
                self.report_first(FirstAttempt::Offline(None));
                self.emit(SessionEvent::Disconnected(None));
                if !self.wait_for_online().await {
                    break;
                }
                backoff.reset();
                continue;
            }

            self.emit(SessionEvent::Connecting);
            match self.attempt().await {
                Attempt::Connected(mut channel) => {
                    backoff.reset();
                    self.report_first(FirstAttempt::Authenticated);
                    self.emit(SessionEvent::Authenticated);

                    let end = self.pump(&mut channel).await;
                    drop(channel);
                    match end {
                        PumpEnd::Cancelled => break,
                        PumpEnd::Closed(reason) => {
                            log::info!("[ReplicationSession] Connection closed: {:?}", reason);
                            let expired = reason.as_deref().is_some_and(FolioError::is_auth_failure);
                            self.emit(SessionEvent::Disconnected(reason));
                            if expired {
                                self.emit(SessionEvent::SessionExpired);
                                break;
                            }
                        }
                        PumpEnd::Offline | PumpEnd::Reconnect => {
                            self.emit(SessionEvent::Disconnected(None));
                            continue;
                        }
                    }
                }
                Attempt::Denied(reason) => {
                    log::warn!("[ReplicationSession] Access denied: {}", reason);
                    self.report_first(FirstAttempt::Denied(reason.clone()));
                    self.emit(SessionEvent::Denied(reason));
                    break;
                }
                Attempt::Failed(message) => {
                    log::warn!("[ReplicationSession] Connection attempt failed: {}", message);
                    if FolioError::is_auth_failure(&message) {
                        self.report_first(FirstAttempt::SessionExpired);
                        self.emit(SessionEvent::Disconnected(Some(message)));
                        self.emit(SessionEvent::SessionExpired);
                        break;
                    }
                    self.report_first(FirstAttempt::Offline(Some(message.clone())));
                    self.emit(SessionEvent::Disconnected(Some(message)));
                }
                Attempt::Cancelled => break,
            }

            match backoff.next_delay() {
                Some(delay) => {
                    log::info!(
                        "[ReplicationSession] Reconnecting in {:?} (attempt {})",
                        delay,
                        backoff.attempts()
                    );
                    if !self.sleep_or_wake(delay, &mut backoff).await {
                        break;
                    }
                }
                None => {
                    log::warn!("[ReplicationSession] Reconnect attempts exhausted");
                    self.emit(SessionEvent::Exhausted);
                    if !self.wait_for_wake().await {
                        break;
                    }
                    backoff.reset();
                }
            }
        }
        log::debug!("[ReplicationSession] Stopped");
    }

    /// Open the transport and authenticate.
    async fn attempt(&mut self) -> Attempt {
        let Some(credential) = self.tokens.token().await else {
            return Attempt::Failed("No credential available".to_string());
        };
        if self.cancel.is_cancelled() {
            return Attempt::Cancelled;
        }

        let opened = tokio::select! {
            result = self.transport.open(&self.options.url) => result,
            _ = self.cancel.cancelled() => return Attempt::Cancelled,
        };
        let mut channel = match opened {
            Ok(channel) => channel,
            Err(e) => return Attempt::Failed(e.to_string()),
        };

        let outcome = tokio::select! {
            outcome = authenticate(&mut channel, &credential, self.options.handshake_timeout) => outcome,
            _ = self.cancel.cancelled() => return Attempt::Cancelled,
        };
        match outcome {
            HandshakeOutcome::Authenticated => Attempt::Connected(channel),
            HandshakeOutcome::Denied(reason) => Attempt::Denied(reason),
            HandshakeOutcome::Failed(message) => Attempt::Failed(message),
            HandshakeOutcome::TimedOut => Attempt::Failed("Handshake timed out".to_string()),
        }
    }

    /// Exchange sync frames until the connection ends.
    async fn pump(&mut self, channel: &mut TransportChannel) -> PumpEnd {
        let step1 = SyncMessage::SyncStep1(self.target.state_vector()).encode();
        if !channel.send(Frame::Binary(step1)) {
            return PumpEnd::Closed(None);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                command = self.commands.recv() => match command {
                    Some(Command::Update(update)) => {
                        let frame = SyncMessage::Update(update).encode();
                        if !channel.send(Frame::Binary(frame)) {
                            return PumpEnd::Closed(None);
                        }
                    }
                    Some(Command::Reconnect) => return PumpEnd::Reconnect,
                    None => return PumpEnd::Cancelled,
                },
                Ok(()) = self.online.changed() => {
                    if !*self.online.borrow_and_update() {
                        return PumpEnd::Offline;
                    }
                }
                event = channel.incoming.recv() => match event {
                    Some(TransportEvent::Frame(Frame::Binary(data))) => {
                        self.handle_binary(channel, &data);
                    }
                    Some(TransportEvent::Frame(Frame::Text(text))) => {
                        log::debug!("[ReplicationSession] Ignoring text frame: {}", text);
                    }
                    Some(TransportEvent::Closed(reason)) => return PumpEnd::Closed(reason),
                    Some(TransportEvent::Error(e)) => return PumpEnd::Closed(Some(e)),
                    None => return PumpEnd::Closed(None),
                },
            }
        }
    }

    fn handle_binary(&self, channel: &TransportChannel, data: &[u8]) {
        let messages = match SyncMessage::decode_all(data) {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("[ReplicationSession] Undecodable frame: {}", e);
                self.emit(SessionEvent::RemoteError(e.to_string()));
                return;
            }
        };
        for message in messages {
            match handle_message(self.target.as_ref(), message) {
                Ok(outcome) => {
                    if let Some(reply) = outcome.reply {
                        channel.send(Frame::Binary(reply.encode()));
                    }
                    if outcome.converged {
                        self.emit(SessionEvent::Converged);
                    }
                }
                Err(e) => {
                    log::warn!("[ReplicationSession] Failed to apply remote message: {}", e);
                    self.emit(SessionEvent::RemoteError(e.to_string()));
                }
            }
        }
    }

    /// Wait out a backoff delay. Returns `false` when cancelled.
    async fn sleep_or_wake(&mut self, delay: Duration, backoff: &mut Backoff) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.cancel.cancelled() => return false,
                command = self.commands.recv() => match command {
                    Some(Command::Reconnect) => {
                        backoff.reset();
                        return true;
                    }
                    Some(Command::Update(_)) => {}
                    None => return false,
                },
                Ok(()) = self.online.changed() => {
                    if *self.online.borrow_and_update() {
                        backoff.reset();
                        return true;
                    }
                }
            }
        }
    }

    /// Idle after exhaustion until woken. Returns `false` when cancelled.
    async fn wait_for_wake(&mut self) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                command = self.commands.recv() => match command {
                    Some(Command::Reconnect) => return true,
                    Some(Command::Update(_)) => {}
                    None => return false,
                },
                Ok(()) = self.online.changed() => {
                    if *self.online.borrow_and_update() {
                        return true;
                    }
                }
            }
        }
    }

    async fn wait_for_online(&mut self) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                command = self.commands.recv() => match command {
                    Some(Command::Reconnect) if self.online_now() => return true,
                    Some(_) => {}
                    None => return false,
                },
                Ok(()) = self.online.changed() => {
                    if *self.online.borrow_and_update() {
                        return true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;
    use crate::crdt::{CollectionValue, MemoryStore, ProjectDoc};
    use crate::model::{Element, ElementType};
    use crate::project_key::ProjectKey;
    use crate::transport::{MemoryServer, document_url};
    use std::sync::Mutex;

    struct Harness {
        server: MemoryServer,
        doc: Arc<ProjectDoc>,
        events: Arc<Mutex<Vec<SessionEvent>>>,
        connectivity: Connectivity,
        options: SessionOptions,
    }

    fn harness() -> Harness {
        let key = ProjectKey::new("alice", "novel").unwrap();
        let doc_id = key.elements_doc_id();
        Harness {
            server: MemoryServer::new().with_token("token"),
            doc: Arc::new(ProjectDoc::new(Arc::new(MemoryStore::new()), doc_id.to_string())),
            events: Arc::new(Mutex::new(Vec::new())),
            connectivity: Connectivity::default(),
            options: SessionOptions {
                url: document_url("ws://memory", &doc_id).unwrap(),
                backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 3),
                handshake_timeout: Duration::from_secs(10),
            },
        }
    }

    impl Harness {
        fn start(&self, token: &str) -> (ReplicationSession, oneshot::Receiver<FirstAttempt>) {
            let events = Arc::clone(&self.events);
            ReplicationSession::start(
                self.doc.clone(),
                Arc::new(self.server.clone()),
                Arc::new(StaticTokenSource::new(token)),
                &self.connectivity,
                self.options.clone(),
                move |event| events.lock().unwrap().push(event),
            )
        }

        fn events(&self) -> Vec<SessionEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticates_and_converges() {
        let h = harness();
        let (session, first) = h.start("token");
        assert_eq!(first.await.unwrap(), FirstAttempt::Authenticated);

        let elements = vec![Element::new(ElementType::Item, "Local")];
        let update = h.doc.replace(&CollectionValue::Elements(elements.clone())).unwrap();
        session.send_update(update);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events = h.events();
        assert_eq!(events[0], SessionEvent::Connecting);
        assert_eq!(events[1], SessionEvent::Authenticated);
        assert!(events.contains(&SessionEvent::Converged));

        let server_doc = h.server.project_doc("alice:novel:elements").unwrap();
        assert_eq!(server_doc.read_sequence::<Element>(), elements);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_does_not_retry() {
        let h = harness();
        let (session, first) = h.start("wrong");
        assert_eq!(
            first.await.unwrap(),
            FirstAttempt::Denied("invalid-token".to_string())
        );
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.server.open_count(), 1);
        assert!(session.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_until_exhausted_then_online_wakes() {
        let h = harness();
        h.server.set_reachable(false);
        let (_session, first) = h.start("token");
        assert!(matches!(first.await.unwrap(), FirstAttempt::Offline(Some(_))));

        // 1 + 2 + 4 seconds of backoff, then exhaustion
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(h.events().contains(&SessionEvent::Exhausted));
        let connecting = h
            .events()
            .iter()
            .filter(|e| **e == SessionEvent::Connecting)
            .count();
        assert_eq!(connecting, 4);

        h.server.set_reachable(true);
        h.connectivity.set_online(false);
        h.connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.events().last(), Some(&SessionEvent::Authenticated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_drop_reconnects() {
        let h = harness();
        let (_session, first) = h.start("token");
        first.await.unwrap();

        h.server.drop_connections(Some("restart"));
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let events = h.events();
        assert!(events.contains(&SessionEvent::Disconnected(Some("restart".to_string()))));
        assert_eq!(events.last(), Some(&SessionEvent::Authenticated));
        assert_eq!(h.server.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_upgrade_expires_session() {
        let h = harness();
        h.server.set_open_error(Some("HTTP error: 401 Unauthorized"));
        let (session, first) = h.start("token");
        assert_eq!(first.await.unwrap(), FirstAttempt::SessionExpired);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.events().last(), Some(&SessionEvent::SessionExpired));
        assert!(session.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_handshake_enters_backoff() {
        let h = harness();
        h.server.set_silent(true);
        let (_session, first) = h.start("token");
        assert_eq!(
            first.await.unwrap(),
            FirstAttempt::Offline(Some("Handshake timed out".to_string()))
        );
    }
}
