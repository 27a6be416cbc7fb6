//! Sync providers: one contract, a local-only and a server-replicated variant.
//!
//! A provider attaches to one project at a time and exposes every collection
//! of its document as a snapshot, a subscription and a whole-value update.
//! Updates are optimistic: the new value is published before it is written
//! to the document, persisted, and (when replicated) sent to the server.
//!
//! ```ignore
//! let provider = factory.create();
//! let result = provider.connect(ConnectOptions::new("alice", "novel")).await;
//! assert!(result.success);
//!
//! let mut elements = provider.get_elements();
//! elements.push(Element::new(ElementType::Item, "Notes"));
//! provider.update_elements(elements);
//! ```

mod attached;
mod factory;
mod local;
mod replicated;
mod state;

pub use factory::{ProviderDeps, ProviderFactory};
pub use local::LocalProvider;
pub use replicated::{ReplicatedProvider, UNABLE_TO_CONNECT};
pub use state::ProviderState;

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;

use crate::BoxFuture;
use crate::crdt::{CollectionName, CollectionValue};
use crate::model::{
    Element, ElementTypeSchema, PublishPlan, Relationship, RelationshipType, SyncPhase,
    TagAssignment, TagDefinition,
};
use crate::observable::Subscription;

/// Which project to attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub owner: String,
    pub slug: String,
    /// Overrides the provider's configured transport URL.
    pub transport_url: Option<String>,
}

impl ConnectOptions {
    pub fn new(owner: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            slug: slug.into(),
            transport_url: None,
        }
    }

    pub fn with_transport_url(mut self, url: impl Into<String>) -> Self {
        self.transport_url = Some(url.into());
        self
    }
}

/// Outcome of [`SyncProvider::connect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

pub type CollectionCallback = Box<dyn Fn(&Arc<CollectionValue>) + Send + Sync>;
pub type PhaseCallback = Box<dyn Fn(&Arc<SyncPhase>) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&String) + Send + Sync>;

/// The provider contract.
///
/// Reads are snapshots. Operations never fail across this boundary for
/// transient conditions: `connect` resolves with a [`ConnectResult`], and
/// everything else reports on the error stream.
pub trait SyncProvider: Send + Sync {
    /// Attach to a project, detaching from any previous one first.
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'_, ConnectResult>;

    /// Detach and reset every stream. Idempotent.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Replace a whole collection.
    fn update(&self, value: CollectionValue);

    /// Observable state backing the default methods.
    fn state(&self) -> &ProviderState;

    fn sync_phase(&self) -> SyncPhase {
        self.state().phase()
    }

    fn subscribe_phase(&self, callback: PhaseCallback) -> Subscription {
        self.state().subscribe_phase(callback)
    }

    fn get(&self, name: CollectionName) -> Arc<CollectionValue> {
        self.state().get(name)
    }

    /// The callback is invoked immediately with the current snapshot.
    fn subscribe(&self, name: CollectionName, callback: CollectionCallback) -> Subscription {
        self.state().subscribe(name, callback)
    }

    fn subscribe_errors(&self, callback: ErrorCallback) -> Subscription {
        self.state().subscribe_errors(callback)
    }
}

macro_rules! typed_collections {
    ($($variant:ident: $ty:ty => $get:ident, $subscribe:ident, $update:ident;)*) => {
        /// Typed accessors for each collection.
        pub trait SyncProviderExt: SyncProvider {
            $(
                fn $get(&self) -> $ty {
                    match &*self.get(CollectionName::$variant) {
                        CollectionValue::$variant(value) => value.clone(),
                        _ => Default::default(),
                    }
                }

                fn $subscribe(&self, callback: impl Fn(&$ty) + Send + Sync + 'static) -> Subscription {
                    self.subscribe(
                        CollectionName::$variant,
                        Box::new(move |value| {
                            if let CollectionValue::$variant(value) = &**value {
                                callback(value);
                            }
                        }),
                    )
                }

                fn $update(&self, value: $ty) {
                    self.update(CollectionValue::$variant(value));
                }
            )*
        }

        impl<P: SyncProvider + ?Sized> SyncProviderExt for P {}
    };
}

typed_collections! {
    Elements: Vec<Element> => get_elements, subscribe_elements, update_elements;
    PublishPlans: Vec<PublishPlan> => get_publish_plans, subscribe_publish_plans, update_publish_plans;
    Relationships: Vec<Relationship> => get_relationships, subscribe_relationships, update_relationships;
    CustomRelationshipTypes: Vec<RelationshipType> =>
        get_custom_relationship_types, subscribe_custom_relationship_types, update_custom_relationship_types;
    Schemas: Vec<ElementTypeSchema> => get_schemas, subscribe_schemas, update_schemas;
    ElementTags: Vec<TagAssignment> => get_element_tags, subscribe_element_tags, update_element_tags;
    CustomTags: Vec<TagDefinition> => get_custom_tags, subscribe_custom_tags, update_custom_tags;
    ProjectMeta: IndexMap<String, String> => get_project_meta, subscribe_project_meta, update_project_meta;
}
