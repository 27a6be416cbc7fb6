//! In-memory document store.
//!
//! Used by tests and as the fallback when no durable store can be opened.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use super::storage::{DocumentStore, StorageResult, merge_state};
use super::types::{CrdtUpdate, UpdateOrigin};
use crate::error::FolioError;

#[derive(Debug, Clone)]
struct StoredUpdate {
    id: i64,
    data: Vec<u8>,
    timestamp: i64,
    origin: UpdateOrigin,
}

/// In-memory document store. Data is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, Vec<u8>>>,
    updates: RwLock<HashMap<String, Vec<StoredUpdate>>>,
    values: RwLock<HashMap<String, String>>,
    next_id: AtomicI64,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    load_delay: Mutex<Option<Duration>>,
    append_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail, simulating a full or revoked store.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every read fail, simulating an unavailable store.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Block the calling thread for `delay` on every `load_doc`, simulating
    /// a slow disk.
    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.lock().unwrap() = delay;
    }

    /// Block the calling thread for `delay` on every `append_update`.
    pub fn set_append_delay(&self, delay: Option<Duration>) {
        *self.append_delay.lock().unwrap() = delay;
    }

    fn check_write(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FolioError::Storage("store is read-only".to_string()));
        }
        Ok(())
    }

    fn check_read(&self) -> StorageResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(FolioError::Storage("store is unavailable".to_string()));
        }
        Ok(())
    }

    /// Number of updates currently in the log of `name`.
    pub fn update_count(&self, name: &str) -> usize {
        self.updates
            .read()
            .unwrap()
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl DocumentStore for MemoryStore {
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        self.check_read()?;
        let delay = *self.load_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(self.docs.read().unwrap().get(name).cloned())
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        self.check_write()?;
        self.docs
            .write()
            .unwrap()
            .insert(name.to_string(), state.to_vec());
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> StorageResult<()> {
        self.check_write()?;
        self.docs.write().unwrap().remove(name);
        self.updates.write().unwrap().remove(name);
        Ok(())
    }

    fn list_docs(&self) -> StorageResult<Vec<String>> {
        self.check_read()?;
        let mut names: BTreeSet<String> = self.docs.read().unwrap().keys().cloned().collect();
        names.extend(self.updates.read().unwrap().keys().cloned());
        Ok(names.into_iter().collect())
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> StorageResult<i64> {
        self.check_write()?;
        let delay = *self.append_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let stored = StoredUpdate {
            id,
            data: update.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin,
        };
        self.updates
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(stored);
        Ok(id)
    }

    fn get_all_updates(&self, name: &str) -> StorageResult<Vec<CrdtUpdate>> {
        self.check_read()?;
        let updates = self.updates.read().unwrap();
        let doc_updates = updates.get(name).map(|u| u.as_slice()).unwrap_or(&[]);
        Ok(doc_updates
            .iter()
            .map(|u| CrdtUpdate {
                update_id: u.id,
                doc_name: name.to_string(),
                data: u.data.clone(),
                timestamp: u.timestamp,
                origin: u.origin,
            })
            .collect())
    }

    fn compact(&self, name: &str, keep_updates: usize) -> StorageResult<()> {
        self.check_write()?;
        let mut updates = self.updates.write().unwrap();
        let Some(doc_updates) = updates.get_mut(name) else {
            return Ok(());
        };
        if doc_updates.len() <= keep_updates {
            return Ok(());
        }

        let snapshot = self.docs.read().unwrap().get(name).cloned();
        let log: Vec<Vec<u8>> = doc_updates.iter().map(|u| u.data.clone()).collect();
        if let Some(state) = merge_state(snapshot.as_deref(), &log)? {
            self.docs.write().unwrap().insert(name.to_string(), state);
        }

        let drain_count = doc_updates.len() - keep_updates;
        doc_updates.drain(0..drain_count);
        Ok(())
    }

    fn get_value(&self, key: &str) -> StorageResult<Option<String>> {
        self.check_read()?;
        Ok(self.values.read().unwrap().get(key).cloned())
    }

    fn set_value(&self, key: &str, value: &str) -> StorageResult<()> {
        self.check_write()?;
        self.values
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_value(&self, key: &str) -> StorageResult<()> {
        self.check_write()?;
        self.values.write().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Doc, GetString, ReadTxn, Text, Transact};

    fn text_update(doc: &Doc, content: &str) -> Vec<u8> {
        let text = doc.get_or_insert_text("t");
        let mut txn = doc.transact_mut();
        let sv = txn.state_vector();
        let len = text.len(&txn);
        text.insert(&mut txn, len, content);
        txn.encode_state_as_update_v1(&sv)
    }

    #[test]
    fn test_save_and_load_doc() {
        let store = MemoryStore::new();
        store.save_doc("test", b"state").unwrap();
        assert_eq!(store.load_doc("test").unwrap(), Some(b"state".to_vec()));
        assert!(store.load_doc("missing").unwrap().is_none());
    }

    #[test]
    fn test_delete_doc_removes_updates() {
        let store = MemoryStore::new();
        store.save_doc("test", b"data").unwrap();
        store.append_update("test", b"u", UpdateOrigin::Local).unwrap();

        store.delete_doc("test").unwrap();

        assert!(store.load_doc("test").unwrap().is_none());
        assert!(store.get_all_updates("test").unwrap().is_empty());
        assert!(store.list_docs().unwrap().is_empty());
    }

    #[test]
    fn test_append_orders_updates() {
        let store = MemoryStore::new();
        let id1 = store.append_update("d", b"1", UpdateOrigin::Local).unwrap();
        let id2 = store.append_update("d", b"2", UpdateOrigin::Remote).unwrap();
        assert!(id1 < id2);

        let all = store.get_all_updates("d").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].origin, UpdateOrigin::Remote);
        assert_eq!(store.list_docs().unwrap(), vec!["d".to_string()]);
    }

    #[test]
    fn test_compact_folds_log_into_snapshot() {
        let store = MemoryStore::new();
        let doc = Doc::new();
        for part in ["a", "b", "c"] {
            store
                .append_update("d", &text_update(&doc, part), UpdateOrigin::Local)
                .unwrap();
        }

        store.compact("d", 0).unwrap();
        assert_eq!(store.update_count("d"), 0);

        let snapshot = store.load_doc("d").unwrap().unwrap();
        let restored = Doc::new();
        let text = restored.get_or_insert_text("t");
        {
            use yrs::updates::decoder::Decode;
            let mut txn = restored.transact_mut();
            txn.apply_update(yrs::Update::decode_v1(&snapshot).unwrap())
                .unwrap();
        }
        assert_eq!(text.get_string(&restored.transact()), "abc");
    }

    #[test]
    fn test_values() {
        let store = MemoryStore::new();
        store.set_value("k", "{}").unwrap();
        assert_eq!(store.get_value("k").unwrap().as_deref(), Some("{}"));
        store.delete_value("k").unwrap();
        store.delete_value("k").unwrap();
        assert!(store.get_value("k").unwrap().is_none());
    }

    #[test]
    fn test_failure_toggles() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.append_update("d", b"1", UpdateOrigin::Local).is_err());
        store.set_fail_writes(false);
        store.set_fail_reads(true);
        assert!(store.load_doc("d").is_err());
    }
}
