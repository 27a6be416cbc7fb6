//! Lazily opened connections to per-element worldbuilding documents.
//!
//! Connections are keyed by `(project, elementId)` and created on first use.
//! Concurrent first accesses to the same key share one connection: the cache
//! holds a [`OnceCell`] per key and every caller awaits the same
//! initialization. In replicated mode each connection also runs its own
//! [`ReplicationSession`] against `<owner>:<slug>:<elementId>`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map as JsonMap, Value};
use tokio::sync::OnceCell;

use crate::auth::AuthTokenSource;
use crate::config::SyncTimings;
use crate::connectivity::Connectivity;
use crate::crdt::{DocumentStore, WorldbuildingDoc, WorldbuildingSection};
use crate::error::Result;
use crate::model::ElementTypeSchema;
use crate::observable::Subscription;
use crate::project_key::ProjectKey;
use crate::transport::{Backoff, ReplicationSession, SessionOptions, Transport, document_url};

/// Server side of the worldbuilding connections, present in replicated mode.
#[derive(Clone)]
pub struct WorldbuildingRemote {
    pub transport: Arc<dyn Transport>,
    pub tokens: Arc<dyn AuthTokenSource>,
    pub connectivity: Connectivity,
    pub base_url: String,
}

/// One open worldbuilding document.
pub struct WorldbuildingConnection {
    project: ProjectKey,
    element_id: String,
    doc: Arc<WorldbuildingDoc>,
    session: Option<ReplicationSession>,
}

impl WorldbuildingConnection {
    pub fn project(&self) -> &ProjectKey {
        &self.project
    }

    pub fn element_id(&self) -> &str {
        &self.element_id
    }

    pub fn is_replicated(&self) -> bool {
        self.session.is_some()
    }

    pub fn get_data(&self) -> JsonMap<String, Value> {
        self.doc.get_data()
    }

    pub fn get_identity(&self) -> JsonMap<String, Value> {
        self.doc.get_identity()
    }

    pub fn save_data(&self, partial: &JsonMap<String, Value>) -> Result<()> {
        self.save(WorldbuildingSection::Data, partial)
    }

    pub fn save_identity(&self, partial: &JsonMap<String, Value>) -> Result<()> {
        self.save(WorldbuildingSection::Identity, partial)
    }

    fn save(&self, section: WorldbuildingSection, partial: &JsonMap<String, Value>) -> Result<()> {
        let update = self.doc.save(section, partial)?;
        self.forward(update);
        Ok(())
    }

    /// Invoke `callback` with the payload after every change, local or remote.
    pub fn observe_changes(
        &self,
        callback: impl Fn(&JsonMap<String, Value>) + Send + Sync + 'static,
    ) -> Subscription {
        self.observe(WorldbuildingSection::Data, callback)
    }

    pub fn observe_identity(
        &self,
        callback: impl Fn(&JsonMap<String, Value>) + Send + Sync + 'static,
    ) -> Subscription {
        self.observe(WorldbuildingSection::Identity, callback)
    }

    fn observe(
        &self,
        section: WorldbuildingSection,
        callback: impl Fn(&JsonMap<String, Value>) + Send + Sync + 'static,
    ) -> Subscription {
        let observer = self.doc.observe(section, callback);
        Subscription::from_fn(move || drop(observer))
    }

    /// Stamp the document from `schema`. Returns `false` when it already
    /// carries a `schemaId`.
    pub fn initialize(&self, schema: &ElementTypeSchema, name: &str) -> Result<bool> {
        match self.doc.initialize(schema, &self.element_id, name)? {
            Some(update) => {
                self.forward(update);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn forward(&self, update: Vec<u8>) {
        if let Some(session) = &self.session {
            session.send_update(update);
        }
    }

    fn close(&self) {
        if let Err(e) = self.doc.compact() {
            log::warn!(
                "[Worldbuilding] Compaction of {} failed: {}",
                self.doc.doc_name(),
                e
            );
        }
    }
}

impl std::fmt::Debug for WorldbuildingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldbuildingConnection")
            .field("project", &self.project)
            .field("element_id", &self.element_id)
            .field("replicated", &self.is_replicated())
            .finish()
    }
}

type ConnectionCell = Arc<OnceCell<Arc<WorldbuildingConnection>>>;

/// Connect-or-reuse cache of worldbuilding connections.
pub struct WorldbuildingConnections {
    store: Arc<dyn DocumentStore>,
    remote: Option<WorldbuildingRemote>,
    timings: SyncTimings,
    connections: Mutex<HashMap<(ProjectKey, String), ConnectionCell>>,
}

impl WorldbuildingConnections {
    /// Local-only connections.
    pub fn new(store: Arc<dyn DocumentStore>, timings: SyncTimings) -> Self {
        Self {
            store,
            remote: None,
            timings,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_remote(mut self, remote: WorldbuildingRemote) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Return the connection for `(project, element_id)`, opening it on first
    /// use.
    pub async fn connect(
        &self,
        project: &ProjectKey,
        element_id: &str,
    ) -> Arc<WorldbuildingConnection> {
        let cell = {
            let mut connections = self.connections.lock().unwrap();
            Arc::clone(
                connections
                    .entry((project.clone(), element_id.to_string()))
                    .or_default(),
            )
        };
        cell.get_or_init(|| self.open(project.clone(), element_id.to_string()))
            .await
            .clone()
    }

    async fn open(&self, project: ProjectKey, element_id: String) -> Arc<WorldbuildingConnection> {
        let store_key = project.worldbuilding_store_key(&element_id);
        let doc = Arc::new(WorldbuildingDoc::new(Arc::clone(&self.store), store_key));

        // A read still running after the timeout is dropped unapplied.
        let store = Arc::clone(&self.store);
        let name = doc.doc_name().to_string();
        let read =
            tokio::task::spawn_blocking(move || WorldbuildingDoc::load_stored(store.as_ref(), &name));
        match tokio::time::timeout(self.timings.worldbuilding_hydration_timeout, read).await {
            Ok(Ok(Ok(stored))) => doc.apply_stored(stored),
            Ok(Ok(Err(e))) => log::warn!("[Worldbuilding] Hydration of {} failed: {}", doc.doc_name(), e),
            Ok(Err(e)) => log::warn!("[Worldbuilding] Hydration of {} aborted: {}", doc.doc_name(), e),
            Err(_) => log::warn!(
                "[Worldbuilding] Hydration of {} timed out, continuing",
                doc.doc_name()
            ),
        }

        let session = match &self.remote {
            Some(remote) => self.start_session(remote, &project, &element_id, &doc).await,
            None => None,
        };
        log::debug!(
            "[Worldbuilding] Opened {} (replicated: {})",
            doc.doc_name(),
            session.is_some()
        );

        Arc::new(WorldbuildingConnection {
            project,
            element_id,
            doc,
            session,
        })
    }

    async fn start_session(
        &self,
        remote: &WorldbuildingRemote,
        project: &ProjectKey,
        element_id: &str,
        doc: &Arc<WorldbuildingDoc>,
    ) -> Option<ReplicationSession> {
        if remote.tokens.token().await.is_none() {
            return None;
        }
        let url = match document_url(&remote.base_url, &project.element_doc_id(element_id)) {
            Ok(url) => url,
            Err(e) => {
                log::warn!("[Worldbuilding] {}", e);
                return None;
            }
        };
        let label = doc.doc_name().to_string();
        let (session, _first) = ReplicationSession::start(
            Arc::clone(doc) as Arc<dyn crate::crdt::SyncTarget>,
            Arc::clone(&remote.transport),
            Arc::clone(&remote.tokens),
            &remote.connectivity,
            SessionOptions {
                url,
                backoff: Backoff::for_documents(&self.timings),
                handshake_timeout: self.timings.handshake_timeout,
            },
            move |event| log::debug!("[Worldbuilding] {}: {:?}", label, event),
        );
        Some(session)
    }

    pub async fn get_data(&self, project: &ProjectKey, element_id: &str) -> JsonMap<String, Value> {
        self.connect(project, element_id).await.get_data()
    }

    pub async fn save_data(
        &self,
        project: &ProjectKey,
        element_id: &str,
        partial: &JsonMap<String, Value>,
    ) -> Result<()> {
        self.connect(project, element_id).await.save_data(partial)
    }

    pub async fn get_identity(
        &self,
        project: &ProjectKey,
        element_id: &str,
    ) -> JsonMap<String, Value> {
        self.connect(project, element_id).await.get_identity()
    }

    pub async fn save_identity(
        &self,
        project: &ProjectKey,
        element_id: &str,
        partial: &JsonMap<String, Value>,
    ) -> Result<()> {
        self.connect(project, element_id).await.save_identity(partial)
    }

    pub async fn observe_changes(
        &self,
        project: &ProjectKey,
        element_id: &str,
        callback: impl Fn(&JsonMap<String, Value>) + Send + Sync + 'static,
    ) -> Subscription {
        self.connect(project, element_id)
            .await
            .observe_changes(callback)
    }

    pub async fn initialize(
        &self,
        project: &ProjectKey,
        element_id: &str,
        name: &str,
        schema: &ElementTypeSchema,
    ) -> Result<bool> {
        self.connect(project, element_id)
            .await
            .initialize(schema, name)
    }

    /// Number of cached connections for `project`.
    pub fn open_count(&self, project: &ProjectKey) -> usize {
        self.connections
            .lock()
            .unwrap()
            .keys()
            .filter(|(key, _)| key == project)
            .count()
    }

    /// Drop every connection of `project`.
    pub fn close_project(&self, project: &ProjectKey) {
        let closed: Vec<ConnectionCell> = {
            let mut connections = self.connections.lock().unwrap();
            let keys: Vec<_> = connections
                .keys()
                .filter(|(key, _)| key == project)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|key| connections.remove(key))
                .collect()
        };
        if !closed.is_empty() {
            log::info!(
                "[Worldbuilding] Closing {} connection(s) for {}",
                closed.len(),
                project
            );
        }
        for cell in closed {
            if let Some(connection) = cell.get() {
                connection.close();
            }
        }
    }
}

impl std::fmt::Debug for WorldbuildingConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldbuildingConnections")
            .field("open", &self.connections.lock().unwrap().len())
            .field("replicated", &self.remote.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;
    use crate::crdt::MemoryStore;
    use crate::model::{FieldType, SchemaField, SchemaTab};
    use crate::transport::MemoryServer;
    use serde_json::json;
    use std::time::Duration;

    fn project() -> ProjectKey {
        ProjectKey::new("alice", "novel").unwrap()
    }

    fn object(value: Value) -> JsonMap<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn character_schema() -> ElementTypeSchema {
        ElementTypeSchema {
            id: "character".into(),
            name: "Character".into(),
            icon: None,
            tabs: vec![SchemaTab {
                key: "basics".into(),
                label: "Basics".into(),
                fields: vec![
                    SchemaField {
                        key: "age".into(),
                        label: "Age".into(),
                        field_type: FieldType::Number,
                    },
                    SchemaField {
                        key: "appearance.height".into(),
                        label: "Height".into(),
                        field_type: FieldType::Text,
                    },
                ],
            }],
            default_values: json!({ "age": "30" }),
            version: 1,
        }
    }

    #[tokio::test]
    async fn test_concurrent_access_shares_one_connection() {
        let connections = WorldbuildingConnections::new(
            Arc::new(MemoryStore::new()),
            SyncTimings::default(),
        );
        let key = project();
        let (a, b) = tokio::join!(
            connections.connect(&key, "el-1"),
            connections.connect(&key, "el-1")
        );
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connections.open_count(&key), 1);
    }

    #[tokio::test]
    async fn test_save_and_reload_from_store() {
        let store = Arc::new(MemoryStore::new());
        let key = project();
        let connections = WorldbuildingConnections::new(store.clone(), SyncTimings::default());
        connections
            .save_data(&key, "el-1", &object(json!({ "age": "41" })))
            .await
            .unwrap();
        connections
            .save_identity(&key, "el-1", &object(json!({ "description": "Tall" })))
            .await
            .unwrap();
        connections.close_project(&key);
        assert_eq!(connections.open_count(&key), 0);

        let reopened = WorldbuildingConnections::new(store, SyncTimings::default());
        assert_eq!(reopened.get_data(&key, "el-1").await["age"], json!("41"));
        assert_eq!(
            reopened.get_identity(&key, "el-1").await["description"],
            json!("Tall")
        );
    }

    #[tokio::test]
    async fn test_slow_hydration_gives_up_after_timeout() {
        let store = Arc::new(MemoryStore::new());
        let key = project();
        WorldbuildingConnections::new(store.clone(), SyncTimings::default())
            .save_data(&key, "el-1", &object(json!({ "age": "41" })))
            .await
            .unwrap();

        store.set_load_delay(Some(Duration::from_millis(800)));
        let timings = SyncTimings {
            worldbuilding_hydration_timeout: Duration::from_millis(50),
            ..SyncTimings::default()
        };
        let connections = WorldbuildingConnections::new(store.clone(), timings);

        let started = std::time::Instant::now();
        let connection = connections.connect(&key, "el-1").await;
        assert!(started.elapsed() < Duration::from_millis(500));

        // Continues with an empty, writable document
        assert!(connection.get_data().is_empty());
        connection
            .save_data(&object(json!({ "mood": "calm" })))
            .unwrap();
        assert_eq!(connection.get_data()["mood"], json!("calm"));
    }

    #[tokio::test]
    async fn test_initialize_once_from_schema() {
        let connections = WorldbuildingConnections::new(
            Arc::new(MemoryStore::new()),
            SyncTimings::default(),
        );
        let key = project();
        let schema = character_schema();
        assert!(
            connections
                .initialize(&key, "el-1", "Ada", &schema)
                .await
                .unwrap()
        );
        let data = connections.get_data(&key, "el-1").await;
        assert_eq!(data["schemaId"], json!("character"));
        assert_eq!(data["name"], json!("Ada"));
        assert_eq!(data["age"], json!("30"));
        assert_eq!(data["appearance"], json!({ "height": "" }));

        assert!(
            !connections
                .initialize(&key, "el-1", "Ada", &schema)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_observe_changes_until_unsubscribed() {
        let connections = WorldbuildingConnections::new(
            Arc::new(MemoryStore::new()),
            SyncTimings::default(),
        );
        let key = project();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sub = connections
            .observe_changes(&key, "el-1", move |data| {
                seen_clone.lock().unwrap().push(data.clone())
            })
            .await;

        connections
            .save_data(&key, "el-1", &object(json!({ "mood": "calm" })))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);

        sub.unsubscribe();
        connections
            .save_data(&key, "el-1", &object(json!({ "mood": "angry" })))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replicated_connections_converge() {
        let server = MemoryServer::new().with_token("t");
        let remote = WorldbuildingRemote {
            transport: Arc::new(server.clone()),
            tokens: Arc::new(StaticTokenSource::new("t")),
            connectivity: Connectivity::default(),
            base_url: "ws://memory".into(),
        };
        let key = project();
        let a = WorldbuildingConnections::new(Arc::new(MemoryStore::new()), SyncTimings::default())
            .with_remote(remote.clone());
        let b = WorldbuildingConnections::new(Arc::new(MemoryStore::new()), SyncTimings::default())
            .with_remote(remote);

        let first = a.connect(&key, "el-1").await;
        assert!(first.is_replicated());
        b.connect(&key, "el-1").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        a.save_data(&key, "el-1", &object(json!({ "age": "7" })))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(b.get_data(&key, "el-1").await["age"], json!("7"));
        assert!(server.document_state("alice:novel:el-1").is_some());
    }
}
