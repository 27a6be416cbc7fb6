//! Replicated documents and their durable storage.
//!
//! - [`ProjectDoc`]: one per project, eight named collections
//! - [`WorldbuildingDoc`]: one per worldbuilding element
//! - [`DocumentStore`]: snapshot + update log persistence ([`MemoryStore`],
//!   [`SqliteStore`])
//! - [`SyncMessage`]: y-sync framing used on the replication transport

mod collections;
mod memory_storage;
mod project_doc;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
mod sqlite_storage;
mod storage;
mod sync;
mod types;
mod worldbuilding_doc;

pub use collections::{CollectionItem, CollectionName, CollectionValue};
pub use memory_storage::MemoryStore;
pub use project_doc::{DEFAULT_ELEMENT_NAME, ProjectDoc};
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub use sqlite_storage::SqliteStore;
pub use storage::{DocumentStore, StorageResult, merge_state};
pub use sync::{SyncMessage, SyncOutcome, SyncTarget, handle_message};
pub use types::{CrdtUpdate, UpdateOrigin};
pub use worldbuilding_doc::{WorldbuildingDoc, WorldbuildingSection};
