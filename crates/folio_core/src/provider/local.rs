//! Provider that keeps the project on this device only.

use std::sync::{Arc, Mutex};

use super::attached::AttachedDoc;
use super::state::ProviderState;
use super::{ConnectOptions, ConnectResult, SyncProvider};
use crate::BoxFuture;
use crate::crdt::{CollectionValue, DocumentStore, ProjectDoc};
use crate::model::SyncPhase;
use crate::project_key::ProjectKey;

struct LocalConnection {
    key: ProjectKey,
    attached: AttachedDoc,
}

/// Local-only provider.
///
/// Uses the same replicated document format as the server-backed provider,
/// so a project can later be promoted to server sync and merge cleanly.
/// The phase is `Offline` while attached.
pub struct LocalProvider {
    store: Arc<dyn DocumentStore>,
    state: Arc<ProviderState>,
    connection: Mutex<Option<LocalConnection>>,
}

impl LocalProvider {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            state: Arc::new(ProviderState::new("LocalProvider")),
            connection: Mutex::new(None),
        }
    }

    /// Key of the attached project.
    pub fn project_key(&self) -> Option<ProjectKey> {
        self.connection
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.key.clone())
    }

    fn attach(&self, key: ProjectKey) {
        let doc = Arc::new(ProjectDoc::new(
            Arc::clone(&self.store),
            key.elements_doc_id().to_string(),
        ));
        if let Err(e) = doc.hydrate() {
            self.state
                .error(format!("Local storage unavailable, continuing in memory: {}", e));
        }
        match doc.migrate_legacy(&key.legacy_store_key()) {
            Ok(true) => log::info!("[LocalProvider] Migrated legacy data for {}", key),
            Ok(false) => {}
            Err(e) => self.state.error(format!("Legacy migration failed: {}", e)),
        }

        let attached = AttachedDoc::attach(doc, Arc::clone(&self.state));
        attached.emit_all(&self.state);
        *self.connection.lock().unwrap() = Some(LocalConnection { key, attached });
        self.state.set_phase(SyncPhase::Offline);
    }
}

impl SyncProvider for LocalProvider {
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'_, ConnectResult> {
        Box::pin(async move {
            let key = match ProjectKey::new(options.owner, options.slug) {
                Ok(key) => key,
                Err(e) => return ConnectResult::failed(e.to_string()),
            };
            self.disconnect();
            log::info!("[LocalProvider] Connecting to {}", key);
            self.attach(key);
            ConnectResult::ok()
        })
    }

    fn disconnect(&self) {
        let Some(connection) = self.connection.lock().unwrap().take() else {
            self.state.reset();
            return;
        };
        log::info!("[LocalProvider] Disconnecting from {}", connection.key);
        let doc = connection.attached.detach();
        if let Err(e) = doc.compact() {
            log::warn!("[LocalProvider] Compaction failed: {}", e);
        }
        self.state.reset();
    }

    fn is_connected(&self) -> bool {
        self.connection.lock().unwrap().is_some()
    }

    fn update(&self, value: CollectionValue) {
        if !self.is_connected() {
            log::warn!("[LocalProvider] Ignoring update of {}: not connected", value.name());
            return;
        }
        self.state.emit(value.clone());
        let writer = self
            .connection
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.attached.writer());
        if let Some(writer) = writer {
            writer.write(&value, &self.state);
        }
    }

    fn state(&self) -> &ProviderState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{CollectionName, MemoryStore};
    use crate::model::{Element, ElementType};
    use crate::provider::SyncProviderExt;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    async fn connected(store: Arc<MemoryStore>) -> LocalProvider {
        let provider = LocalProvider::new(store);
        let result = provider.connect(ConnectOptions::new("alice", "novel")).await;
        assert_eq!(result, ConnectResult::ok());
        provider
    }

    #[tokio::test]
    async fn test_connect_is_offline_and_unseeded() {
        let provider = connected(Arc::new(MemoryStore::new())).await;
        assert!(provider.is_connected());
        assert_eq!(provider.sync_phase(), SyncPhase::Offline);
        assert!(provider.get_elements().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_empty_owner() {
        let provider = LocalProvider::new(Arc::new(MemoryStore::new()));
        let result = provider.connect(ConnectOptions::new("", "novel")).await;
        assert!(!result.success);
        assert_eq!(provider.sync_phase(), SyncPhase::Unavailable);
    }

    #[tokio::test]
    async fn test_update_is_optimistic_and_durable() {
        let store = Arc::new(MemoryStore::new());
        let provider = connected(store.clone()).await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = provider.subscribe_elements(move |v| seen_clone.lock().unwrap().push(v.clone()));

        let elements = vec![Element::new(ElementType::Folder, "Chapters")];
        provider.update_elements(elements.clone());
        assert_eq!(provider.get_elements(), elements);
        assert_eq!(seen.lock().unwrap().last(), Some(&elements));

        provider.disconnect();
        let reopened = connected(store).await;
        assert_eq!(reopened.get_elements(), elements);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_resets() {
        let provider = connected(Arc::new(MemoryStore::new())).await;
        provider.update_elements(vec![Element::new(ElementType::Item, "A")]);

        provider.disconnect();
        provider.disconnect();
        assert!(!provider.is_connected());
        assert_eq!(provider.sync_phase(), SyncPhase::Unavailable);
        for name in CollectionName::ALL {
            assert_eq!(*provider.get(name), CollectionValue::empty(name));
        }

        // Updates while detached are ignored
        provider.update_elements(vec![Element::new(ElementType::Item, "B")]);
        assert!(provider.get_elements().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_write_does_not_block_readers() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(connected(store.clone()).await);
        store.set_append_delay(Some(Duration::from_millis(400)));

        let writer = Arc::clone(&provider);
        let write = tokio::task::spawn_blocking(move || {
            writer.update_elements(vec![Element::new(ElementType::Item, "Slow")]);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        assert!(provider.is_connected());
        assert!(provider.project_key().is_some());
        assert!(started.elapsed() < Duration::from_millis(200));

        write.await.unwrap();
        assert_eq!(store.update_count("alice:novel:elements"), 1);
    }

    #[tokio::test]
    async fn test_legacy_payload_is_migrated_on_connect() {
        let store = Arc::new(MemoryStore::new());
        let legacy = serde_json::json!({
            "elements": [Element::new(ElementType::Item, "Old draft")],
            "projectMeta": {"name": "Old"},
        });
        store
            .set_value("legacy:alice:novel", &legacy.to_string())
            .unwrap();

        let provider = connected(store.clone()).await;
        assert_eq!(provider.get_elements()[0].name, "Old draft");
        assert_eq!(
            provider.get_project_meta().get("name").map(String::as_str),
            Some("Old")
        );
        assert!(store.get_value("legacy:alice:novel").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_reports_and_continues() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_reads(true);
        let provider = LocalProvider::new(store);
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let errors_clone = Arc::clone(&errors);
        let _sub = provider.subscribe_errors(Box::new(move |e| {
            errors_clone.lock().unwrap().push(e.clone())
        }));

        let result = provider.connect(ConnectOptions::new("alice", "novel")).await;
        assert!(result.success);
        assert!(!errors.lock().unwrap().is_empty());

        provider.update_elements(vec![Element::new(ElementType::Item, "In memory")]);
        assert_eq!(provider.get_elements().len(), 1);
    }
}
