//! SQLite-backed durable document store.
//!
//! Snapshots, the update log and standalone values live in three tables of a
//! single database file.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use super::storage::{DocumentStore, StorageResult, merge_state};
use super::types::{CrdtUpdate, UpdateOrigin};

/// SQLite-backed document store.
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database. Data is lost when dropped.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_name TEXT NOT NULL,
                data BLOB NOT NULL,
                origin TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_updates_doc_id ON updates(doc_name, id);

            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl DocumentStore for SqliteStore {
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT state FROM documents WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT OR REPLACE INTO documents (name, state, updated_at) VALUES (?, ?, ?)",
            params![name, state, now],
        )?;
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM updates WHERE doc_name = ?", params![name])?;
        tx.execute("DELETE FROM documents WHERE name = ?", params![name])?;
        tx.commit()?;
        Ok(())
    }

    fn list_docs(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name FROM documents UNION SELECT doc_name FROM updates ORDER BY 1",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> StorageResult<i64> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO updates (doc_name, data, origin, timestamp) VALUES (?, ?, ?, ?)",
            params![name, update, origin.to_string(), now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_all_updates(&self, name: &str) -> StorageResult<Vec<CrdtUpdate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, data, origin, timestamp FROM updates
             WHERE doc_name = ?
             ORDER BY id ASC",
        )?;

        let updates = stmt
            .query_map(params![name], |row| {
                let origin: String = row.get(2)?;
                Ok(CrdtUpdate {
                    update_id: row.get(0)?,
                    doc_name: name.to_string(),
                    data: row.get(1)?,
                    origin: origin.parse().unwrap_or(UpdateOrigin::Local),
                    timestamp: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(updates)
    }

    fn compact(&self, name: &str, keep_updates: usize) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();

        let rows: Vec<(i64, Vec<u8>)> = {
            let mut stmt =
                conn.prepare("SELECT id, data FROM updates WHERE doc_name = ? ORDER BY id ASC")?;
            stmt.query_map(params![name], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?
        };
        if rows.len() <= keep_updates {
            return Ok(());
        }

        let snapshot: Option<Vec<u8>> = conn
            .query_row(
                "SELECT state FROM documents WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        let log: Vec<Vec<u8>> = rows.iter().map(|(_, data)| data.clone()).collect();
        let Some(full_state) = merge_state(snapshot.as_deref(), &log)? else {
            return Ok(());
        };

        // First id that survives compaction
        let cutoff_id = rows[rows.len() - keep_updates..]
            .first()
            .map(|(id, _)| *id)
            .unwrap_or(i64::MAX);
        let now = chrono::Utc::now().timestamp_millis();

        // Snapshot and truncation commit together
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO documents (name, state, updated_at) VALUES (?, ?, ?)",
            params![name, full_state, now],
        )?;
        tx.execute(
            "DELETE FROM updates WHERE doc_name = ? AND id < ?",
            params![name, cutoff_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_value(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set_value(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_value(&self, key: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM kv WHERE key = ?", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update, updates::decoder::Decode};

    fn text_update(doc: &Doc, content: &str) -> Vec<u8> {
        let text = doc.get_or_insert_text("t");
        let mut txn = doc.transact_mut();
        let sv = txn.state_vector();
        let len = text.len(&txn);
        text.insert(&mut txn, len, content);
        txn.encode_state_as_update_v1(&sv)
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folio.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_doc("a:b:elements", b"state").unwrap();
            store.append_update("a:b:elements", b"u1", UpdateOrigin::Local).unwrap();
            store.set_value("projects:offline", "[]").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_doc("a:b:elements").unwrap(), Some(b"state".to_vec()));
        assert_eq!(store.get_all_updates("a:b:elements").unwrap().len(), 1);
        assert_eq!(store.get_value("projects:offline").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn test_delete_and_list() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_doc("one", b"1").unwrap();
        store.append_update("two", b"2", UpdateOrigin::Remote).unwrap();
        assert_eq!(store.list_docs().unwrap(), vec!["one".to_string(), "two".to_string()]);

        store.delete_doc("two").unwrap();
        assert_eq!(store.list_docs().unwrap(), vec!["one".to_string()]);
        assert!(store.get_all_updates("two").unwrap().is_empty());
    }

    #[test]
    fn test_compact_keeps_recent_updates() {
        let store = SqliteStore::in_memory().unwrap();
        let doc = Doc::new();
        for part in ["a", "b", "c", "d"] {
            store
                .append_update("d", &text_update(&doc, part), UpdateOrigin::Local)
                .unwrap();
        }

        store.compact("d", 1).unwrap();
        assert_eq!(store.get_all_updates("d").unwrap().len(), 1);

        let snapshot = store.load_doc("d").unwrap().unwrap();
        let restored = Doc::new();
        let text = restored.get_or_insert_text("t");
        {
            let mut txn = restored.transact_mut();
            txn.apply_update(Update::decode_v1(&snapshot).unwrap()).unwrap();
        }
        assert_eq!(text.get_string(&restored.transact()), "abcd");
    }

    #[test]
    fn test_compact_noop_when_log_short() {
        let store = SqliteStore::in_memory().unwrap();
        store.append_update("d", b"opaque", UpdateOrigin::Local).unwrap();
        store.compact("d", 5).unwrap();
        assert!(store.load_doc("d").unwrap().is_none());
    }
}
