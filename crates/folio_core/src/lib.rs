//! Project synchronization core for Folio.
//!
//! Keeps a writing project (its element tree, schemas, tags, relationships and
//! metadata) in a replicated document that works offline first and converges
//! with the server when a connection and a credential are available.
//!
//! The entry points are [`provider::ProviderFactory`], which builds a local or
//! replicated [`provider::SyncProvider`], and
//! [`coordinator::ProjectCoordinator`], which layers tree editing, visibility
//! and tabs on top of a provider.

use std::future::Future;
use std::pin::Pin;

/// Configuration options
pub mod config;

/// Error (common error types)
pub mod error;

/// Project and document addressing
pub mod project_key;

/// Collection value types
pub mod model;

pub mod observable;

pub mod task;

/// Credential sources for the replication handshake
pub mod auth;

pub mod connectivity;

/// Replicated documents and durable storage
pub mod crdt;

/// Streaming transport, handshake and replication sessions
pub mod transport;

/// Sync providers (local and replicated)
pub mod provider;

/// Per-element worldbuilding documents
pub mod worldbuilding;

/// Project state coordinator
pub mod coordinator;

/// External project and media services
pub mod api;

pub mod background_worker;

pub mod media_sync;

pub mod sync_queue;

/// In-memory collaborators for tests and demos
pub mod test_utils;

/// Boxed future returned by the object-safe service traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
