//! Automatic media library reconciliation for the active project.
//!
//! While a project is active three things keep its media in sync:
//!
//! - an initial full sync when the project becomes active,
//! - a periodic sweep that checks the sync status and runs a full sync when
//!   the libraries differ,
//! - a notification channel (`/api/v1/ws/media`) whose `media-changed`
//!   pushes schedule a debounced full sync.
//!
//! All three go through one `is_syncing` guard, so full syncs never overlap.
//! Everything is a no-op in local mode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::api::MediaSyncService;
use crate::auth::AuthTokenSource;
use crate::config::{SyncMode, SyncTimings};
use crate::connectivity::Connectivity;
use crate::project_key::ProjectKey;
use crate::task::{CancellationFlag, Debouncer};
use crate::transport::{
    Backoff, Frame, HandshakeOutcome, Transport, TransportChannel, TransportEvent, authenticate,
    media_url,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PING: &str = "ping";
const PONG: &str = "pong";

/// Push received on the media channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaNotification {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub project_key: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    pub action: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl MediaNotification {
    /// Parse a text frame; `None` for anything but an upload or delete.
    pub fn parse(text: &str) -> Option<Self> {
        let notification: Self = serde_json::from_str(text).ok()?;
        let relevant = notification.kind == "media-changed"
            && matches!(notification.action.as_str(), "uploaded" | "deleted");
        relevant.then_some(notification)
    }
}

struct ActiveProject {
    key: ProjectKey,
    cancel: CancellationFlag,
    tasks: Vec<JoinHandle<()>>,
    debouncer: Arc<Debouncer>,
}

impl ActiveProject {
    fn shutdown(self) {
        self.cancel.cancel();
        self.debouncer.cancel();
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Inner {
    media: Arc<dyn MediaSyncService>,
    mode: SyncMode,
    websocket_url: Option<String>,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn AuthTokenSource>,
    connectivity: Connectivity,
    timings: SyncTimings,
    is_syncing: AtomicBool,
    active: Mutex<Option<ActiveProject>>,
}

/// Resets `is_syncing` when a sync ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Inner {
    /// Full sync unless one is already running. Returns whether it ran.
    async fn run_sync(&self, key: &ProjectKey) -> bool {
        if self.is_syncing.swap(true, Ordering::SeqCst) {
            log::debug!("[MediaAutoSync] Sync already in progress, skipping");
            return false;
        }
        let _guard = SyncGuard(&self.is_syncing);
        match self.media.full_sync(key).await {
            Ok(report) => log::info!(
                "[MediaAutoSync] Synced {}: {} downloaded, {} uploaded",
                key,
                report.downloaded,
                report.uploaded
            ),
            Err(e) => log::warn!("[MediaAutoSync] Sync of {} failed: {}", key, e),
        }
        true
    }

    async fn sweep(&self, key: &ProjectKey) {
        match self.media.check_sync_status(key).await {
            Ok(status) if status.needs_sync => {
                self.run_sync(key).await;
            }
            Ok(_) => log::debug!("[MediaAutoSync] {} is up to date", key),
            Err(e) => log::warn!("[MediaAutoSync] Status check for {} failed: {}", key, e),
        }
    }
}

/// Media synchronizer for one active project at a time.
#[derive(Clone)]
pub struct MediaAutoSync {
    inner: Arc<Inner>,
}

impl MediaAutoSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        media: Arc<dyn MediaSyncService>,
        mode: SyncMode,
        websocket_url: Option<String>,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn AuthTokenSource>,
        connectivity: Connectivity,
        timings: SyncTimings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                media,
                mode,
                websocket_url: websocket_url.filter(|url| !url.is_empty()),
                transport,
                tokens,
                connectivity,
                timings,
                is_syncing: AtomicBool::new(false),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn active_project(&self) -> Option<ProjectKey> {
        self.inner
            .active
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.key.clone())
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.is_syncing.load(Ordering::SeqCst)
    }

    /// Make `key` the active project. A no-op in local mode or when `key` is
    /// already active.
    pub fn start_auto_sync(&self, key: ProjectKey) {
        if self.inner.mode != SyncMode::Server {
            log::debug!("[MediaAutoSync] Local mode, not starting for {}", key);
            return;
        }
        if self.active_project().as_ref() == Some(&key) {
            return;
        }
        self.stop();
        log::info!("[MediaAutoSync] Starting for {}", key);

        let cancel = CancellationFlag::new();
        let debouncer = Arc::new(Debouncer::new(self.inner.timings.media_debounce));
        let mut tasks = vec![
            tokio::spawn(initial_and_periodic(
                Arc::clone(&self.inner),
                key.clone(),
                cancel.clone(),
            )),
        ];
        if let Some(base) = &self.inner.websocket_url {
            match media_url(base, &key) {
                Ok(url) => tasks.push(tokio::spawn(notification_loop(
                    Arc::clone(&self.inner),
                    key.clone(),
                    url,
                    cancel.clone(),
                    Arc::clone(&debouncer),
                ))),
                Err(e) => log::warn!("[MediaAutoSync] {}", e),
            }
        }

        *self.inner.active.lock().unwrap() = Some(ActiveProject {
            key,
            cancel,
            tasks,
            debouncer,
        });
    }

    /// Full sync of the active project, e.g. after an upload. Returns whether
    /// a sync ran.
    pub async fn trigger_sync_after_upload(&self) -> bool {
        match self.active_project() {
            Some(key) => self.inner.run_sync(&key).await,
            None => false,
        }
    }

    /// Cancel timers and close the notification channel.
    pub fn stop(&self) {
        let active = self.inner.active.lock().unwrap().take();
        if let Some(active) = active {
            log::info!("[MediaAutoSync] Stopping for {}", active.key);
            active.shutdown();
        }
    }
}

impl std::fmt::Debug for MediaAutoSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaAutoSync")
            .field("mode", &self.inner.mode)
            .field("active", &self.active_project())
            .field("syncing", &self.is_syncing())
            .finish()
    }
}

async fn initial_and_periodic(inner: Arc<Inner>, key: ProjectKey, cancel: CancellationFlag) {
    inner.run_sync(&key).await;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(inner.timings.media_sync_period) => inner.sweep(&key).await,
            _ = cancel.cancelled() => break,
        }
    }
}

enum ChannelEnd {
    Cancelled,
    Closed(Option<String>),
}

async fn notification_loop(
    inner: Arc<Inner>,
    key: ProjectKey,
    url: url::Url,
    cancel: CancellationFlag,
    debouncer: Arc<Debouncer>,
) {
    let mut backoff = Backoff::for_media(&inner.timings);
    let mut online = inner.connectivity.subscribe();

    while !cancel.is_cancelled() {
        if !*online.borrow_and_update() {
            tokio::select! {
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
            }
            continue;
        }

        let Some(credential) = inner.tokens.token().await else {
            log::info!("[MediaAutoSync] No credential, notifications disabled");
            break;
        };
        let opened = tokio::select! {
            opened = inner.transport.open(&url) => opened,
            _ = cancel.cancelled() => break,
        };
        match opened {
            Ok(mut channel) => {
                let outcome = tokio::select! {
                    outcome = authenticate(&mut channel, &credential, inner.timings.handshake_timeout) => outcome,
                    _ = cancel.cancelled() => break,
                };
                match outcome {
                    HandshakeOutcome::Authenticated => {
                        log::info!("[MediaAutoSync] Notification channel open for {}", key);
                        backoff.reset();
                        match listen(&inner, &key, &mut channel, &cancel, &debouncer).await {
                            ChannelEnd::Cancelled => break,
                            ChannelEnd::Closed(reason) => {
                                log::info!("[MediaAutoSync] Channel closed: {:?}", reason);
                            }
                        }
                    }
                    HandshakeOutcome::Denied(reason) => {
                        log::warn!("[MediaAutoSync] Access denied: {}", reason);
                        break;
                    }
                    HandshakeOutcome::Failed(message) => {
                        log::warn!("[MediaAutoSync] Handshake failed: {}", message);
                    }
                    HandshakeOutcome::TimedOut => {
                        log::warn!("[MediaAutoSync] Handshake timed out");
                    }
                }
            }
            Err(e) => log::warn!("[MediaAutoSync] Could not open channel: {}", e),
        }

        let Some(delay) = backoff.next_delay() else {
            log::warn!("[MediaAutoSync] Reconnect attempts exhausted");
            break;
        };
        log::debug!("[MediaAutoSync] Reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
    }
}

async fn listen(
    inner: &Arc<Inner>,
    key: &ProjectKey,
    channel: &mut TransportChannel,
    cancel: &CancellationFlag,
    debouncer: &Debouncer,
) -> ChannelEnd {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return ChannelEnd::Cancelled,
            _ = heartbeat.tick() => {
                if !channel.send(Frame::Text(PING.to_string())) {
                    return ChannelEnd::Closed(None);
                }
            }
            event = channel.incoming.recv() => match event {
                Some(TransportEvent::Frame(Frame::Text(text))) => {
                    if text == PONG {
                        continue;
                    }
                    match MediaNotification::parse(&text) {
                        Some(notification) => {
                            log::debug!(
                                "[MediaAutoSync] {} {:?}, sync scheduled",
                                notification.action,
                                notification.filename
                            );
                            let inner = Arc::clone(inner);
                            let key = key.clone();
                            debouncer.schedule(move || async move {
                                inner.run_sync(&key).await;
                            });
                        }
                        None => log::debug!("[MediaAutoSync] Ignoring frame: {}", text),
                    }
                }
                Some(TransportEvent::Frame(Frame::Binary(_))) => {}
                Some(TransportEvent::Closed(reason)) => return ChannelEnd::Closed(reason),
                Some(TransportEvent::Error(e)) => return ChannelEnd::Closed(Some(e)),
                None => return ChannelEnd::Closed(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;
    use crate::test_utils::MockMediaSync;
    use crate::transport::MemoryServer;

    struct Harness {
        server: MemoryServer,
        media: MockMediaSync,
        sync: MediaAutoSync,
    }

    fn harness(mode: SyncMode) -> Harness {
        harness_with_token(mode, "t")
    }

    fn harness_with_token(mode: SyncMode, token: &str) -> Harness {
        let server = MemoryServer::new().with_token("t");
        let media = MockMediaSync::new();
        let sync = MediaAutoSync::new(
            Arc::new(media.clone()),
            mode,
            Some("ws://memory".into()),
            Arc::new(server.clone()),
            Arc::new(StaticTokenSource::new(token)),
            Connectivity::default(),
            SyncTimings::default(),
        );
        Harness {
            server,
            media,
            sync,
        }
    }

    fn key() -> ProjectKey {
        ProjectKey::new("alice", "novel").unwrap()
    }

    #[test]
    fn test_parse_notification() {
        let text = r#"{"type":"media-changed","projectKey":"alice/novel","filename":"a.png","action":"uploaded","timestamp":"2024-01-01T00:00:00Z"}"#;
        let notification = MediaNotification::parse(text).unwrap();
        assert_eq!(notification.filename.as_deref(), Some("a.png"));

        assert!(MediaNotification::parse(r#"{"type":"media-changed","action":"renamed"}"#).is_none());
        assert!(MediaNotification::parse(r#"{"type":"other","action":"uploaded"}"#).is_none());
        assert!(MediaNotification::parse("pong").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_mode_is_noop() {
        let h = harness(SyncMode::Local);
        h.sync.start_auto_sync(key());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.sync.active_project().is_none());
        assert_eq!(h.media.full_sync_count(), 0);
        assert!(!h.sync.trigger_sync_after_upload().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_sync_and_periodic_sweep() {
        let h = harness(SyncMode::Server);
        h.sync.start_auto_sync(key());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.media.full_sync_count(), 1);

        // Starting the same project again changes nothing
        h.sync.start_auto_sync(key());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.media.full_sync_count(), 1);

        // Up to date: the sweep only checks
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.media.status_checks(), 1);
        assert_eq!(h.media.full_sync_count(), 1);

        h.media.set_needs_sync(true);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.media.full_sync_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_are_debounced() {
        let h = harness(SyncMode::Server);
        h.sync.start_auto_sync(key());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.media.full_sync_count(), 1);

        for _ in 0..3 {
            assert_eq!(h.server.notify_media(&key(), "map.png", "uploaded"), 1);
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        let last_event = tokio::time::Instant::now() - Duration::from_millis(200);

        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert_eq!(h.media.full_sync_count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.media.full_sync_count(), 2);
        let fired = h.media.full_sync_times()[1];
        assert!(fired - last_event >= Duration::from_secs(2));
        assert!(fired - last_event < Duration::from_millis(2050));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_syncs_are_skipped() {
        let server = MemoryServer::new();
        let media = MockMediaSync::new().with_delay(Duration::from_secs(5));
        let sync = MediaAutoSync::new(
            Arc::new(media.clone()),
            SyncMode::Server,
            None,
            Arc::new(server),
            Arc::new(StaticTokenSource::none()),
            Connectivity::default(),
            SyncTimings::default(),
        );
        sync.start_auto_sync(key());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sync.is_syncing());

        assert!(!sync.trigger_sync_after_upload().await);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!sync.is_syncing());
        assert!(sync.trigger_sync_after_upload().await);
        assert_eq!(media.full_sync_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_denied_stops_reconnecting() {
        let h = harness_with_token(SyncMode::Server, "stale");
        h.sync.start_auto_sync(key());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.server.open_count(), 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.server.open_count(), 1);
        assert_eq!(h.server.notify_media(&key(), "a.png", "uploaded"), 0);
        // Polling keeps running without notifications
        assert_eq!(h.media.status_checks(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_give_up_after_ten_attempts() {
        let h = harness(SyncMode::Server);
        h.server.set_reachable(false);
        h.sync.start_auto_sync(key());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.server.open_attempts(), 1);

        // Delays 1, 2, 4, 8, 16 s, then capped at 30 s
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.server.open_attempts(), 5);
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(h.server.open_attempts(), 10);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.server.open_attempts(), 11);

        // Exhausted: a recovered server is not retried
        h.server.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.server.open_attempts(), 11);
        assert_eq!(h.server.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_everything() {
        let h = harness(SyncMode::Server);
        h.sync.start_auto_sync(key());
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.server.notify_media(&key(), "a.png", "deleted");
        h.sync.stop();

        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(h.media.full_sync_count(), 1);
        assert_eq!(h.server.notify_media(&key(), "a.png", "deleted"), 0);
        assert!(h.sync.active_project().is_none());
    }
}
