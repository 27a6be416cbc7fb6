//! Storage abstraction for document persistence.
//!
//! This module defines the [`DocumentStore`] trait which abstracts over the
//! durable local store (SQLite, in-memory) holding replicated document state.
//!
//! # Storage Model
//!
//! The store keeps three kinds of data, all addressed by string keys:
//! 1. **Document snapshots**: compacted full state of a replicated document
//! 2. **Update log**: incremental updates appended after every local transaction
//! 3. **Values**: small JSON payloads outside any document (the legacy
//!    migration bucket, the offline project cache)
//!
//! A document is hydrated by applying its snapshot followed by its update log.

use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, Transact, Update};

use super::types::{CrdtUpdate, UpdateOrigin};
use crate::error::{FolioError, Result};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T>;

/// Trait for durable document store backends.
pub trait DocumentStore: Send + Sync {
    /// Load the snapshot of a document. Returns `None` if it doesn't exist.
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Save the full document state, overwriting any previous snapshot.
    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()>;

    /// Delete a document snapshot and its update log.
    fn delete_doc(&self, name: &str) -> StorageResult<()>;

    /// List all document names that have a snapshot or updates.
    fn list_docs(&self) -> StorageResult<Vec<String>>;

    /// Append an incremental update. Returns the id of the new record.
    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> StorageResult<i64>;

    /// All updates of a document, oldest first.
    fn get_all_updates(&self, name: &str) -> StorageResult<Vec<CrdtUpdate>>;

    /// Fold the update log into the snapshot, keeping the last `keep_updates`.
    fn compact(&self, name: &str, keep_updates: usize) -> StorageResult<()>;

    /// Read a standalone value.
    fn get_value(&self, key: &str) -> StorageResult<Option<String>>;

    /// Write a standalone value.
    fn set_value(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Delete a standalone value. Deleting a missing key is not an error.
    fn delete_value(&self, key: &str) -> StorageResult<()>;
}

/// Merge a snapshot and an update log into a single v1 state update.
///
/// Returns `None` when there is neither a snapshot nor any update.
pub fn merge_state(snapshot: Option<&[u8]>, updates: &[Vec<u8>]) -> StorageResult<Option<Vec<u8>>> {
    if snapshot.is_none() && updates.is_empty() {
        return Ok(None);
    }

    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        for data in snapshot.into_iter().chain(updates.iter().map(Vec::as_slice)) {
            let update = Update::decode_v1(data)
                .map_err(|e| FolioError::Crdt(format!("Failed to decode update: {}", e)))?;
            txn.apply_update(update)
                .map_err(|e| FolioError::Crdt(format!("Failed to apply update: {}", e)))?;
        }
    }

    let txn = doc.transact();
    Ok(Some(txn.encode_state_as_update_v1(&Default::default())))
}
