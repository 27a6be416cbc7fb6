//! Observable state shared by both provider variants.

use std::sync::Arc;

use crate::crdt::{CollectionName, CollectionValue};
use crate::model::SyncPhase;
use crate::observable::{EventStream, Subject, Subscription};

/// One subject per collection, the sync phase, and the error stream.
#[derive(Debug)]
pub struct ProviderState {
    collections: Vec<Subject<CollectionValue>>,
    phase: Subject<SyncPhase>,
    errors: EventStream<String>,
    label: &'static str,
}

impl ProviderState {
    /// `label` prefixes log lines, e.g. `"LocalProvider"`.
    pub fn new(label: &'static str) -> Self {
        Self {
            collections: CollectionName::ALL
                .into_iter()
                .map(|name| Subject::new(CollectionValue::empty(name)))
                .collect(),
            phase: Subject::new(SyncPhase::Unavailable),
            errors: EventStream::new(),
            label,
        }
    }

    fn subject(&self, name: CollectionName) -> &Subject<CollectionValue> {
        &self.collections[name as usize]
    }

    pub fn get(&self, name: CollectionName) -> Arc<CollectionValue> {
        self.subject(name).get()
    }

    /// Publish a new snapshot of one collection.
    pub fn emit(&self, value: CollectionValue) {
        self.subject(value.name()).next(value);
    }

    pub fn subscribe(
        &self,
        name: CollectionName,
        callback: impl Fn(&Arc<CollectionValue>) + Send + Sync + 'static,
    ) -> Subscription {
        self.subject(name).subscribe(callback)
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.get()
    }

    /// Move to `phase`; repeated values are not re-emitted.
    pub fn set_phase(&self, phase: SyncPhase) {
        let current = self.phase();
        if current != phase {
            log::info!("[{}] Sync phase {} -> {}", self.label, current, phase);
            self.phase.next(phase);
        }
    }

    pub fn subscribe_phase(
        &self,
        callback: impl Fn(&Arc<SyncPhase>) + Send + Sync + 'static,
    ) -> Subscription {
        self.phase.subscribe(callback)
    }

    /// Log and publish a human-readable error.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("[{}] {}", self.label, message);
        self.errors.emit(message);
    }

    pub fn subscribe_errors(&self, callback: impl Fn(&String) + Send + Sync + 'static) -> Subscription {
        self.errors.subscribe(callback)
    }

    /// Empty every collection and return to `Unavailable`.
    pub fn reset(&self) {
        for name in CollectionName::ALL {
            self.emit(CollectionValue::empty(name));
        }
        self.set_phase(SyncPhase::Unavailable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Element, ElementType};
    use std::sync::Mutex;

    #[test]
    fn test_subject_per_collection() {
        let state = ProviderState::new("Test");
        for name in CollectionName::ALL {
            assert_eq!(*state.get(name), CollectionValue::empty(name));
        }

        let value = CollectionValue::Elements(vec![Element::new(ElementType::Item, "A")]);
        state.emit(value.clone());
        assert_eq!(*state.get(CollectionName::Elements), value);
        assert_eq!(
            *state.get(CollectionName::Schemas),
            CollectionValue::empty(CollectionName::Schemas)
        );
    }

    #[test]
    fn test_phase_dedup_and_reset() {
        let state = ProviderState::new("Test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = state.subscribe_phase(move |p| seen_clone.lock().unwrap().push(**p));

        state.set_phase(SyncPhase::Offline);
        state.set_phase(SyncPhase::Offline);
        state.emit(CollectionValue::Elements(vec![Element::new(ElementType::Item, "A")]));
        state.reset();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![SyncPhase::Unavailable, SyncPhase::Offline, SyncPhase::Unavailable]
        );
        assert_eq!(
            *state.get(CollectionName::Elements),
            CollectionValue::empty(CollectionName::Elements)
        );
    }
}
