//! The per-project replicated document.
//!
//! # Structure
//!
//! ```text
//! Y.Doc  (store key "<owner>:<slug>:elements")
//! ├── Y.Array "elements"                 JSON-encoded Element per entry
//! ├── Y.Array "publishPlans"             JSON-encoded PublishPlan per entry
//! ├── Y.Array "relationships"            ...
//! ├── Y.Array "customRelationshipTypes"
//! ├── Y.Array "schemas"
//! ├── Y.Array "elementTags"
//! ├── Y.Array "customTags"
//! └── Y.Map   "projectMeta"              string → string
//! ```
//!
//! Every local transaction is captured as an incremental update and appended
//! to the durable store; the caller decides whether it also goes on the wire.

use std::sync::Arc;

use indexmap::IndexMap;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Array, ArrayRef, Doc, Map, MapRef, Observable, ReadTxn, StateVector, Subscription, Transact,
    TransactionMut, Update,
};

use super::collections::{CollectionItem, CollectionName, CollectionValue};
use super::storage::{DocumentStore, StorageResult};
use super::types::UpdateOrigin;
use crate::error::FolioError;
use crate::model::{Element, ElementType, ProjectMeta};

/// Name of the element seeded into an empty replicated project.
pub const DEFAULT_ELEMENT_NAME: &str = "README";

/// A replicated project document bound to its durable store key.
pub struct ProjectDoc {
    doc: Doc,
    sequences: Vec<(CollectionName, ArrayRef)>,
    meta: MapRef,
    store: Arc<dyn DocumentStore>,
    doc_name: String,
}

impl ProjectDoc {
    /// Create an empty document. Call [`ProjectDoc::hydrate`] to load stored state.
    pub fn new(store: Arc<dyn DocumentStore>, doc_name: impl Into<String>) -> Self {
        let doc = Doc::new();
        let sequences = CollectionName::sequences()
            .map(|name| (name, doc.get_or_insert_array(name.as_str())))
            .collect();
        let meta = doc.get_or_insert_map(CollectionName::ProjectMeta.as_str());

        Self {
            doc,
            sequences,
            meta,
            store,
            doc_name: doc_name.into(),
        }
    }

    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    fn array(&self, name: CollectionName) -> Option<&ArrayRef> {
        self.sequences
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, array)| array)
    }

    // ==================== Persistence ====================

    /// Load the stored snapshot and update log into the document.
    ///
    /// Updates that fail to decode are skipped with a warning.
    pub fn hydrate(&self) -> StorageResult<()> {
        let snapshot = self.store.load_doc(&self.doc_name)?;
        let updates = self.store.get_all_updates(&self.doc_name)?;

        let mut txn = self.doc.transact_mut();
        if let Some(state) = snapshot {
            let update = Update::decode_v1(&state)
                .map_err(|e| FolioError::Crdt(format!("Failed to decode snapshot: {}", e)))?;
            txn.apply_update(update)
                .map_err(|e| FolioError::Crdt(format!("Failed to apply snapshot: {}", e)))?;
        }
        for stored in updates {
            match Update::decode_v1(&stored.data) {
                Ok(update) => {
                    if let Err(e) = txn.apply_update(update) {
                        log::warn!("[ProjectDoc] Skipping update {}: {}", stored.update_id, e);
                    }
                }
                Err(e) => log::warn!("[ProjectDoc] Skipping update {}: {}", stored.update_id, e),
            }
        }
        Ok(())
    }

    /// Append an update produced by this document to the store.
    pub fn persist(&self, update: &[u8], origin: UpdateOrigin) -> StorageResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        self.store.append_update(&self.doc_name, update, origin)?;
        Ok(())
    }

    /// Fold the update log into a snapshot.
    pub fn compact(&self) -> StorageResult<()> {
        self.store.compact(&self.doc_name, 0)
    }

    /// Run `f` in one transaction and return the incremental update it produced.
    fn capture<F>(&self, f: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let sv_before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            f(&mut txn);
        }
        self.doc.transact().encode_state_as_update_v1(&sv_before)
    }

    // ==================== Collections ====================

    /// Snapshot of one collection.
    pub fn read(&self, name: CollectionName) -> CollectionValue {
        let txn = self.doc.transact();
        if name.is_mapping() {
            return CollectionValue::ProjectMeta(self.read_meta_with(&txn));
        }
        match self.array(name) {
            Some(array) => {
                let raw: Vec<String> = array.iter(&txn).map(|v| v.to_string(&txn)).collect();
                CollectionValue::from_json_items(name, raw.iter().map(String::as_str))
            }
            None => CollectionValue::empty(name),
        }
    }

    /// Snapshot of a sequence-valued collection as its record type.
    pub fn read_sequence<T: CollectionItem>(&self) -> Vec<T> {
        let txn = self.doc.transact();
        let Some(array) = self.array(T::COLLECTION) else {
            return Vec::new();
        };
        array
            .iter(&txn)
            .filter_map(|v| serde_json::from_str(&v.to_string(&txn)).ok())
            .collect()
    }

    pub fn read_meta(&self) -> IndexMap<String, String> {
        let txn = self.doc.transact();
        self.read_meta_with(&txn)
    }

    fn read_meta_with<T: ReadTxn>(&self, txn: &T) -> IndexMap<String, String> {
        let mut entries: Vec<(String, String)> = self
            .meta
            .iter(txn)
            .map(|(key, value)| (key.to_string(), value.to_string(txn)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().collect()
    }

    pub fn is_empty(&self, name: CollectionName) -> bool {
        let txn = self.doc.transact();
        match self.array(name) {
            Some(array) => array.len(&txn) == 0,
            None => self.meta.len(&txn) == 0,
        }
    }

    /// Replace a whole collection in one transaction.
    ///
    /// Sequences are cleared and refilled from index 0. The mapping is
    /// updated per field (absent or empty values are deleted) and stamped
    /// with `updatedAt`.
    pub fn replace(&self, value: &CollectionValue) -> StorageResult<Vec<u8>> {
        if let CollectionValue::ProjectMeta(map) = value {
            let mut fields: IndexMap<String, Option<String>> = self
                .read_meta()
                .into_keys()
                .map(|key| (key, None))
                .collect();
            for (key, value) in map {
                fields.insert(key.clone(), Some(value.clone()));
            }
            return Ok(self.set_meta_fields(&fields));
        }

        let items = value.to_json_items()?.unwrap_or_default();
        let array = self
            .array(value.name())
            .ok_or_else(|| FolioError::Crdt(format!("No sequence named {}", value.name())))?;
        Ok(self.capture(|txn| {
            let len = array.len(&*txn);
            if len > 0 {
                array.remove_range(txn, 0, len);
            }
            if !items.is_empty() {
                array.insert_range(txn, 0, items);
            }
        }))
    }

    /// Set or delete individual meta fields and stamp `updatedAt`.
    ///
    /// `None` or an empty string deletes the field.
    pub fn set_meta_fields(&self, fields: &IndexMap<String, Option<String>>) -> Vec<u8> {
        let now = chrono::Utc::now().to_rfc3339();
        self.capture(|txn| {
            for (key, value) in fields {
                if key == ProjectMeta::UPDATED_AT {
                    continue;
                }
                match value.as_deref() {
                    Some(v) if !v.is_empty() => {
                        self.meta.insert(txn, key.as_str(), v.to_string());
                    }
                    _ => {
                        self.meta.remove(txn, key.as_str());
                    }
                }
            }
            self.meta.insert(txn, ProjectMeta::UPDATED_AT, now);
        })
    }

    /// Seed a single README item when `elements` is empty.
    ///
    /// Returns the update when seeding happened.
    pub fn seed_default_if_empty(&self) -> StorageResult<Option<Vec<u8>>> {
        if !self.is_empty(CollectionName::Elements) {
            return Ok(None);
        }
        let readme = Element::new(ElementType::Item, DEFAULT_ELEMENT_NAME);
        log::info!("[ProjectDoc] Seeding {} into {}", DEFAULT_ELEMENT_NAME, self.doc_name);
        self.replace(&CollectionValue::Elements(vec![readme])).map(Some)
    }

    /// Import a legacy flat-JSON payload stored under `legacy_key`.
    ///
    /// The payload is an object keyed by collection name. All collections are
    /// written in one transaction, persisted, and the legacy key is deleted.
    /// Returns `false` when there was nothing to migrate.
    pub fn migrate_legacy(&self, legacy_key: &str) -> StorageResult<bool> {
        let Some(raw) = self.store.get_value(legacy_key)? else {
            return Ok(false);
        };
        let payload: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)?;

        let mut values = Vec::new();
        for (key, value) in payload {
            match key.parse::<CollectionName>() {
                Ok(name) => values.push(CollectionValue::from_json(name, value)?),
                Err(e) => log::warn!("[ProjectDoc] Ignoring legacy field: {}", e),
            }
        }

        let mut encoded = Vec::with_capacity(values.len());
        for value in &values {
            encoded.push((value.name(), value.to_json_items()?));
        }
        let update = self.capture(|txn| {
            for (value, (name, items)) in values.iter().zip(encoded) {
                match (items, value) {
                    (Some(items), _) => {
                        if let Some(array) = self.array(name) {
                            let len = array.len(&*txn);
                            if len > 0 {
                                array.remove_range(txn, 0, len);
                            }
                            if !items.is_empty() {
                                array.insert_range(txn, 0, items);
                            }
                        }
                    }
                    (None, CollectionValue::ProjectMeta(map)) => {
                        for (key, value) in map {
                            self.meta.insert(txn, key.as_str(), value.clone());
                        }
                    }
                    (None, _) => {}
                }
            }
        });

        self.persist(&update, UpdateOrigin::Migration)?;
        self.store.delete_value(legacy_key)?;
        log::info!(
            "[ProjectDoc] Migrated {} legacy collections into {}",
            values.len(),
            self.doc_name
        );
        Ok(true)
    }

    // ==================== Sync ====================

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Full state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Updates the holder of `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> StorageResult<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| FolioError::Crdt(format!("Failed to decode state vector: {}", e)))?;
        Ok(self.doc.transact().encode_state_as_update_v1(&sv))
    }

    /// Apply a remote update and persist it.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> StorageResult<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| FolioError::Crdt(format!("Failed to decode update: {}", e)))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| FolioError::Crdt(format!("Failed to apply update: {}", e)))?;
        }
        self.persist(update, origin)
    }

    // ==================== Observers ====================

    /// Invoke `callback` with the collection name after every transaction that
    /// changes that collection.
    ///
    /// The callback runs while the transaction is committing and must not
    /// open another transaction on this document.
    pub fn observe_collections<F>(&self, callback: F) -> Vec<Subscription>
    where
        F: Fn(CollectionName) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let mut subscriptions = Vec::with_capacity(CollectionName::ALL.len());
        for (name, array) in &self.sequences {
            let name = *name;
            let callback = Arc::clone(&callback);
            subscriptions.push(array.observe(move |_txn, _event| callback(name)));
        }
        let callback = Arc::clone(&callback);
        subscriptions.push(
            self.meta
                .observe(move |_txn, _event| callback(CollectionName::ProjectMeta)),
        );
        subscriptions
    }
}

impl std::fmt::Debug for ProjectDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectDoc")
            .field("doc_name", &self.doc_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::MemoryStore;
    use crate::model::{Relationship, TagAssignment};
    use std::sync::Mutex;

    fn doc_with_store() -> (ProjectDoc, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let doc = ProjectDoc::new(store.clone(), "alice:novel:elements");
        (doc, store)
    }

    fn element(name: &str, element_type: ElementType, level: u32) -> Element {
        let mut element = Element::new(element_type, name);
        element.level = level;
        element
    }

    #[test]
    fn test_replace_and_read_sequence() {
        let (doc, _) = doc_with_store();
        let elements = vec![
            element("Chapters", ElementType::Folder, 0),
            element("One", ElementType::Item, 1),
        ];
        doc.replace(&CollectionValue::Elements(elements.clone()))
            .unwrap();
        assert_eq!(doc.read_sequence::<Element>(), elements);

        doc.replace(&CollectionValue::Elements(vec![elements[1].clone()]))
            .unwrap();
        assert_eq!(
            doc.read(CollectionName::Elements),
            CollectionValue::Elements(vec![elements[1].clone()])
        );
    }

    #[test]
    fn test_local_updates_are_persisted_and_rehydrate() {
        let (doc, store) = doc_with_store();
        let elements = vec![element("A", ElementType::Item, 0)];
        let update = doc
            .replace(&CollectionValue::Elements(elements.clone()))
            .unwrap();
        doc.persist(&update, UpdateOrigin::Local).unwrap();

        let reloaded = ProjectDoc::new(store, "alice:novel:elements");
        reloaded.hydrate().unwrap();
        assert_eq!(reloaded.read_sequence::<Element>(), elements);
    }

    #[test]
    fn test_meta_replace_deletes_missing_and_stamps() {
        let (doc, _) = doc_with_store();
        let mut meta = IndexMap::new();
        meta.insert("name".to_string(), "Novel".to_string());
        meta.insert("description".to_string(), "Draft".to_string());
        doc.replace(&CollectionValue::ProjectMeta(meta)).unwrap();

        let mut next = IndexMap::new();
        next.insert("name".to_string(), "Renamed".to_string());
        doc.replace(&CollectionValue::ProjectMeta(next)).unwrap();

        let stored = doc.read_meta();
        assert_eq!(stored.get("name").map(String::as_str), Some("Renamed"));
        assert!(!stored.contains_key("description"));
        let stamp = stored.get("updatedAt").unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[test]
    fn test_seed_only_when_empty() {
        let (doc, _) = doc_with_store();
        assert!(doc.seed_default_if_empty().unwrap().is_some());
        assert!(doc.seed_default_if_empty().unwrap().is_none());

        let elements = doc.read_sequence::<Element>();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].name, DEFAULT_ELEMENT_NAME);
        assert_eq!(elements[0].element_type, ElementType::Item);
    }

    #[test]
    fn test_migrate_legacy_once() {
        let (doc, store) = doc_with_store();
        let rel = Relationship {
            id: "r1".to_string(),
            source_element_id: "a".to_string(),
            target_element_id: "b".to_string(),
            relationship_type_id: "friend".to_string(),
            note: None,
        };
        let payload = serde_json::json!({
            "elements": [element("Legacy", ElementType::Item, 0)],
            "relationships": [rel],
            "projectMeta": {"name": "Old"},
            "unknown": 1,
        });
        store
            .set_value("legacy:alice:novel", &payload.to_string())
            .unwrap();

        assert!(doc.migrate_legacy("legacy:alice:novel").unwrap());
        assert!(store.get_value("legacy:alice:novel").unwrap().is_none());
        assert_eq!(doc.read_sequence::<Element>()[0].name, "Legacy");
        assert_eq!(doc.read_sequence::<Relationship>(), vec![rel]);
        assert_eq!(doc.read_meta().get("name").map(String::as_str), Some("Old"));

        assert!(!doc.migrate_legacy("legacy:alice:novel").unwrap());
        assert_eq!(store.update_count("alice:novel:elements"), 1);
    }

    #[test]
    fn test_diff_sync_between_docs() {
        let (a, _) = doc_with_store();
        let (b, _) = doc_with_store();
        let tags = vec![TagAssignment {
            id: "t1".to_string(),
            element_id: "e".to_string(),
            tag_id: "red".to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }];
        a.replace(&CollectionValue::ElementTags(tags.clone()))
            .unwrap();

        let diff = a.encode_diff(&b.encode_state_vector()).unwrap();
        b.apply_update(&diff, UpdateOrigin::Sync).unwrap();
        assert_eq!(b.read_sequence::<TagAssignment>(), tags);
    }

    #[test]
    fn test_observer_reports_collection_names() {
        let (doc, _) = doc_with_store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _subs = doc.observe_collections(move |name| seen_clone.lock().unwrap().push(name));

        doc.replace(&CollectionValue::Elements(vec![element("A", ElementType::Item, 0)]))
            .unwrap();
        doc.set_meta_fields(&IndexMap::from([(
            "name".to_string(),
            Some("N".to_string()),
        )]));

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&CollectionName::Elements));
        assert!(seen.contains(&CollectionName::ProjectMeta));
        assert!(!seen.contains(&CollectionName::Schemas));
    }
}
