use std::sync::Arc;

use super::{LocalProvider, ReplicatedProvider, SyncProvider};
use crate::auth::{AuthTokenSource, StaticTokenSource};
use crate::config::{Config, SyncMode, SyncTimings};
use crate::connectivity::Connectivity;
use crate::crdt::DocumentStore;
use crate::transport::{Transport, WebSocketTransport};

/// Everything a provider needs besides its mode.
#[derive(Clone)]
pub struct ProviderDeps {
    pub store: Arc<dyn DocumentStore>,
    pub transport: Arc<dyn Transport>,
    pub tokens: Arc<dyn AuthTokenSource>,
    pub connectivity: Connectivity,
    pub timings: SyncTimings,
}

impl ProviderDeps {
    /// WebSocket transport, no credential, online.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            transport: Arc::new(WebSocketTransport),
            tokens: Arc::new(StaticTokenSource::none()),
            connectivity: Connectivity::default(),
            timings: SyncTimings::default(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_tokens(mut self, tokens: Arc<dyn AuthTokenSource>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_timings(mut self, timings: SyncTimings) -> Self {
        self.timings = timings;
        self
    }
}

impl std::fmt::Debug for ProviderDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDeps")
            .field("connectivity", &self.connectivity)
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

/// Chooses the provider variant for the deployment mode.
///
/// Server mode without a transport URL falls back to local.
#[derive(Debug, Clone)]
pub struct ProviderFactory {
    mode: SyncMode,
    websocket_url: Option<String>,
    deps: ProviderDeps,
}

impl ProviderFactory {
    pub fn new(mode: SyncMode, websocket_url: Option<String>, deps: ProviderDeps) -> Self {
        let websocket_url = websocket_url.filter(|url| !url.is_empty());
        let mode = match (mode, &websocket_url) {
            (SyncMode::Server, None) => {
                log::warn!("[ProviderFactory] Server mode without a transport URL, using local");
                SyncMode::Local
            }
            (mode, _) => mode,
        };
        Self {
            mode,
            websocket_url,
            deps,
        }
    }

    pub fn from_config(config: &Config, deps: ProviderDeps) -> Self {
        Self::new(config.sync_mode, config.websocket_url.clone(), deps)
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn deps(&self) -> &ProviderDeps {
        &self.deps
    }

    pub fn websocket_url(&self) -> Option<&str> {
        self.websocket_url.as_deref()
    }

    /// A fresh, unattached provider.
    pub fn create(&self) -> Arc<dyn SyncProvider> {
        match self.mode {
            SyncMode::Local => Arc::new(LocalProvider::new(Arc::clone(&self.deps.store))),
            SyncMode::Server => Arc::new(ReplicatedProvider::new(
                Arc::clone(&self.deps.store),
                Arc::clone(&self.deps.transport),
                Arc::clone(&self.deps.tokens),
                self.deps.connectivity.clone(),
                self.deps.timings.clone(),
                self.websocket_url.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::MemoryStore;
    use crate::model::SyncPhase;
    use crate::provider::ConnectOptions;

    fn deps() -> ProviderDeps {
        ProviderDeps::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_server_without_url_is_local() {
        let factory = ProviderFactory::new(SyncMode::Server, Some(String::new()), deps());
        assert_eq!(factory.mode(), SyncMode::Local);

        let factory = ProviderFactory::new(SyncMode::Server, Some("ws://x".into()), deps());
        assert_eq!(factory.mode(), SyncMode::Server);
    }

    #[tokio::test]
    async fn test_local_mode_creates_local_provider() {
        let factory = ProviderFactory::new(SyncMode::Local, Some("ws://x".into()), deps());
        let provider = factory.create();
        let result = provider.connect(ConnectOptions::new("alice", "novel")).await;
        assert!(result.success);
        assert_eq!(provider.sync_phase(), SyncPhase::Offline);
    }
}
