//! Per-element worldbuilding document.
//!
//! Each worldbuilding element owns a replicated document with two mappings:
//! `worldbuilding` (the schema-conformant payload) and `identity` (the common
//! `image` and `description` fields). JSON objects written into either mapping
//! become nested Y.Maps and JSON arrays become Y.Arrays, so concurrent edits
//! to different nested fields merge.

use std::sync::Arc;

use serde_json::{Map as JsonMap, Value};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, DeepObservable, Doc, Map, MapPrelim, MapRef, Out, ReadTxn,
    StateVector, Subscription, Transact, TransactionMut, Update,
};

use super::storage::{DocumentStore, StorageResult};
use super::types::UpdateOrigin;
use crate::error::FolioError;
use crate::model::{ElementTypeSchema, FieldType};

const WORLDBUILDING_MAP_NAME: &str = "worldbuilding";
const IDENTITY_MAP_NAME: &str = "identity";

/// Which of the two mappings an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldbuildingSection {
    Data,
    Identity,
}

/// Replicated document of one worldbuilding element.
pub struct WorldbuildingDoc {
    doc: Doc,
    data: MapRef,
    identity: MapRef,
    store: Arc<dyn DocumentStore>,
    doc_name: String,
}

impl WorldbuildingDoc {
    pub fn new(store: Arc<dyn DocumentStore>, doc_name: impl Into<String>) -> Self {
        let doc = Doc::new();
        let data = doc.get_or_insert_map(WORLDBUILDING_MAP_NAME);
        let identity = doc.get_or_insert_map(IDENTITY_MAP_NAME);
        Self {
            doc,
            data,
            identity,
            store,
            doc_name: doc_name.into(),
        }
    }

    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    fn section(&self, section: WorldbuildingSection) -> &MapRef {
        match section {
            WorldbuildingSection::Data => &self.data,
            WorldbuildingSection::Identity => &self.identity,
        }
    }

    /// Load stored state into the document.
    pub fn hydrate(&self) -> StorageResult<()> {
        let stored = Self::load_stored(self.store.as_ref(), &self.doc_name)?;
        self.apply_stored(stored);
        Ok(())
    }

    /// Read the snapshot and update log of `doc_name`, oldest first.
    ///
    /// Touches only the store, so it can run on a blocking thread while the
    /// document itself stays untouched.
    pub fn load_stored(store: &dyn DocumentStore, doc_name: &str) -> StorageResult<Vec<Vec<u8>>> {
        let snapshot = store.load_doc(doc_name)?;
        let updates = store.get_all_updates(doc_name)?;
        Ok(snapshot
            .into_iter()
            .chain(updates.into_iter().map(|u| u.data))
            .collect())
    }

    /// Apply updates read by [`WorldbuildingDoc::load_stored`] in one
    /// transaction. Undecodable entries are skipped.
    pub fn apply_stored(&self, stored: Vec<Vec<u8>>) {
        let mut txn = self.doc.transact_mut();
        for data in stored {
            match Update::decode_v1(&data) {
                Ok(update) => {
                    if let Err(e) = txn.apply_update(update) {
                        log::warn!("[WorldbuildingDoc] {}: skipping update: {}", self.doc_name, e);
                    }
                }
                Err(e) => log::warn!("[WorldbuildingDoc] {}: skipping update: {}", self.doc_name, e),
            }
        }
    }

    fn persist(&self, update: &[u8], origin: UpdateOrigin) -> StorageResult<()> {
        if !update.is_empty() {
            self.store.append_update(&self.doc_name, update, origin)?;
        }
        Ok(())
    }

    pub fn compact(&self) -> StorageResult<()> {
        self.store.compact(&self.doc_name, 0)
    }

    // ==================== Data ====================

    pub fn get_data(&self) -> JsonMap<String, Value> {
        self.get(WorldbuildingSection::Data)
    }

    pub fn get_identity(&self) -> JsonMap<String, Value> {
        self.get(WorldbuildingSection::Identity)
    }

    pub fn get(&self, section: WorldbuildingSection) -> JsonMap<String, Value> {
        let txn = self.doc.transact();
        map_to_json(&txn, self.section(section))
    }

    /// Merge `partial` into the payload in one transaction.
    ///
    /// Nested objects reuse an existing nested mapping when present; arrays
    /// are replaced by fresh sequences. Returns the update that was persisted.
    pub fn save_data(&self, partial: &JsonMap<String, Value>) -> StorageResult<Vec<u8>> {
        self.save(WorldbuildingSection::Data, partial)
    }

    pub fn save_identity(&self, partial: &JsonMap<String, Value>) -> StorageResult<Vec<u8>> {
        self.save(WorldbuildingSection::Identity, partial)
    }

    pub fn save(
        &self,
        section: WorldbuildingSection,
        partial: &JsonMap<String, Value>,
    ) -> StorageResult<Vec<u8>> {
        let map = self.section(section);
        let sv_before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            for (key, value) in partial {
                write_entry(&mut txn, map, key, value);
            }
        }
        let update = self.doc.transact().encode_state_as_update_v1(&sv_before);
        self.persist(&update, UpdateOrigin::Local)?;
        Ok(update)
    }

    /// Stamp a freshly created element with its template.
    ///
    /// Writes `schemaId`, an empty slot for every template field (arrays get
    /// `[]`, everything else `""`, dotted keys create nested mappings), the
    /// template defaults, and `id`, `name`, `createdDate`, `lastModified`.
    /// Skipped when the payload already carries a `schemaId`.
    pub fn initialize(
        &self,
        schema: &ElementTypeSchema,
        element_id: &str,
        name: &str,
    ) -> StorageResult<Option<Vec<u8>>> {
        {
            let txn = self.doc.transact();
            if self.data.get(&txn, "schemaId").is_some() {
                return Ok(None);
            }
        }

        let mut payload = JsonMap::new();
        for field in schema.fields() {
            let slot = match field.field_type {
                FieldType::Array => Value::Array(Vec::new()),
                _ => Value::String(String::new()),
            };
            insert_path(&mut payload, &field.key, slot);
        }
        if let Value::Object(defaults) = &schema.default_values {
            merge_json(&mut payload, defaults);
        }

        let now = chrono::Utc::now().to_rfc3339();
        payload.insert("schemaId".into(), Value::String(schema.id.clone()));
        payload.insert("id".into(), Value::String(element_id.to_string()));
        payload.insert("name".into(), Value::String(name.to_string()));
        payload.insert("createdDate".into(), Value::String(now.clone()));
        payload.insert("lastModified".into(), Value::String(now));

        self.save_data(&payload).map(Some)
    }

    // ==================== Sync ====================

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> StorageResult<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| FolioError::Crdt(format!("Failed to decode state vector: {}", e)))?;
        Ok(self.doc.transact().encode_state_as_update_v1(&sv))
    }

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

    /// Subscribe to any change inside a section, including nested values.
    ///
    /// The callback receives the full section snapshot read within the
    /// committing transaction.
    pub fn observe<F>(&self, section: WorldbuildingSection, callback: F) -> Subscription
    where
        F: Fn(&JsonMap<String, Value>) + Send + Sync + 'static,
    {
        let map = self.section(section).clone();
        self.section(section).observe_deep(move |txn, _events| {
            callback(&map_to_json(txn, &map));
        })
    }
}

impl std::fmt::Debug for WorldbuildingDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldbuildingDoc")
            .field("doc_name", &self.doc_name)
            .finish_non_exhaustive()
    }
}

// ==================== JSON <-> yrs ====================

fn write_entry(txn: &mut TransactionMut, map: &MapRef, key: &str, value: &Value) {
    match value {
        Value::Object(fields) => {
            let nested = match map.get(&*txn, key) {
                Some(Out::YMap(existing)) => existing,
                _ => map.insert(txn, key, MapPrelim::default()),
            };
            for (k, v) in fields {
                write_entry(txn, &nested, k, v);
            }
        }
        Value::Array(items) => {
            let array = map.insert(txn, key, ArrayPrelim::default());
            for item in items {
                push_item(txn, &array, item);
            }
        }
        scalar => {
            map.insert(txn, key, scalar_to_any(scalar));
        }
    }
}

fn push_item(txn: &mut TransactionMut, array: &ArrayRef, value: &Value) {
    match value {
        Value::Object(fields) => {
            let nested = array.push_back(txn, MapPrelim::default());
            for (k, v) in fields {
                write_entry(txn, &nested, k, v);
            }
        }
        Value::Array(items) => {
            let nested = array.push_back(txn, ArrayPrelim::default());
            for item in items {
                push_item(txn, &nested, item);
            }
        }
        scalar => {
            array.push_back(txn, scalar_to_any(scalar));
        }
    }
}

fn scalar_to_any(value: &Value) -> Any {
    match value {
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => n.as_f64().map(Any::Number).unwrap_or(Any::Null),
        Value::String(s) => Any::from(s.clone()),
        _ => Any::Null,
    }
}

fn map_to_json<T: ReadTxn>(txn: &T, map: &MapRef) -> JsonMap<String, Value> {
    map.iter(txn)
        .map(|(key, value)| (key.to_string(), out_to_json(txn, value)))
        .collect()
}

fn out_to_json<T: ReadTxn>(txn: &T, value: Out) -> Value {
    match value {
        Out::Any(any) => any_to_json(&any),
        Out::YMap(map) => Value::Object(map_to_json(txn, &map)),
        Out::YArray(array) => Value::Array(array.iter(txn).map(|v| out_to_json(txn, v)).collect()),
        other => Value::String(other.to_string(txn)),
    }
}

fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => {
            if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                Value::from(*n as i64)
            } else {
                serde_json::Number::from_f64(*n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
    }
}

/// Insert `value` at a dotted `path`, creating intermediate objects.
fn insert_path(target: &mut JsonMap<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(JsonMap::new()));
            if !entry.is_object() {
                *entry = Value::Object(JsonMap::new());
            }
            if let Value::Object(nested) = entry {
                insert_path(nested, rest, value);
            }
        }
    }
}

/// Deep-merge `source` into `target`; objects merge, everything else overwrites.
fn merge_json(target: &mut JsonMap<String, Value>, source: &JsonMap<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_json(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
