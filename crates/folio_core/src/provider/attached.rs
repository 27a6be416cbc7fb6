//! A hydrated project document wired to a [`ProviderState`].
//!
//! Document observers only record which collection changed. A refresh task
//! re-reads that collection outside the committing transaction and publishes
//! a fresh snapshot.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::state::ProviderState;
use crate::crdt::{CollectionName, CollectionValue, ProjectDoc, UpdateOrigin};

/// Collections whose observer emit is currently suppressed.
#[derive(Debug, Default)]
struct ObserverGuard {
    suppressed: Mutex<HashSet<CollectionName>>,
}

impl ObserverGuard {
    fn is_suppressed(&self, name: CollectionName) -> bool {
        self.suppressed.lock().unwrap().contains(&name)
    }

    fn set(&self, name: CollectionName, suppressed: bool) {
        let mut set = self.suppressed.lock().unwrap();
        if suppressed {
            set.insert(name);
        } else {
            set.remove(&name);
        }
    }
}

pub(crate) struct AttachedDoc {
    doc: Arc<ProjectDoc>,
    guard: Arc<ObserverGuard>,
    observers: Vec<yrs::Subscription>,
    refresh: JoinHandle<()>,
}

impl AttachedDoc {
    /// Install observers and the refresh task. Must run inside a tokio runtime.
    pub(crate) fn attach(doc: Arc<ProjectDoc>, state: Arc<ProviderState>) -> Self {
        let (changed_tx, mut changed_rx) = mpsc::unbounded_channel::<CollectionName>();
        let guard = Arc::new(ObserverGuard::default());

        let observer_guard = Arc::clone(&guard);
        let observers = doc.observe_collections(move |name| {
            if !observer_guard.is_suppressed(name) {
                let _ = changed_tx.send(name);
            }
        });

        let refresh_doc = Arc::clone(&doc);
        let refresh = tokio::spawn(async move {
            while let Some(name) = changed_rx.recv().await {
                state.emit(refresh_doc.read(name));
            }
        });

        Self {
            doc,
            guard,
            observers,
            refresh,
        }
    }

    pub(crate) fn doc(&self) -> &Arc<ProjectDoc> {
        &self.doc
    }

    /// Publish every collection from the document.
    pub(crate) fn emit_all(&self, state: &ProviderState) {
        for name in CollectionName::ALL {
            state.emit(self.doc.read(name));
        }
    }

    /// A handle for writing into the document without holding on to `self`.
    pub(crate) fn writer(&self) -> DocWriter {
        DocWriter {
            doc: Arc::clone(&self.doc),
            guard: Arc::clone(&self.guard),
        }
    }

    /// Unbind observers and stop the refresh task, returning the document.
    pub(crate) fn detach(self) -> Arc<ProjectDoc> {
        let doc = Arc::clone(&self.doc);
        drop(self);
        doc
    }
}

/// Write side of an [`AttachedDoc`].
#[derive(Clone)]
pub(crate) struct DocWriter {
    doc: Arc<ProjectDoc>,
    guard: Arc<ObserverGuard>,
}

impl DocWriter {
    /// Run `f` with the observer emit for `name` suppressed.
    pub(crate) fn with_suppressed_observer<R>(&self, name: CollectionName, f: impl FnOnce() -> R) -> R {
        self.guard.set(name, true);
        let result = f();
        self.guard.set(name, false);
        result
    }

    /// Write `value` into the document and persist the update.
    ///
    /// Returns the update so the caller can forward it. Failures are reported
    /// on the error stream; the optimistic value stays published.
    pub(crate) fn write(&self, value: &CollectionValue, state: &ProviderState) -> Option<Vec<u8>> {
        let name = value.name();
        let result = if name.is_mapping() {
            self.with_suppressed_observer(name, || self.doc.replace(value))
        } else {
            self.doc.replace(value)
        };
        let update = match result {
            Ok(update) => update,
            Err(e) => {
                state.error(format!("Failed to update {}: {}", name, e));
                return None;
            }
        };
        if let Err(e) = self.doc.persist(&update, UpdateOrigin::Local) {
            state.error(format!("Failed to save {}: {}", name, e));
        }
        Some(update)
    }
}

impl Drop for AttachedDoc {
    fn drop(&mut self) {
        self.observers.clear();
        self.refresh.abort();
    }
}

impl std::fmt::Debug for AttachedDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedDoc")
            .field("doc", &self.doc)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}
