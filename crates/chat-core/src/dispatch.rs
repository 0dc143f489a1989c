use std::{
    collections::HashMap,
    hash::Hash,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, PoisonError, RwLock, Weak},
};

use tracing::{trace, warn};

use crate::{
    cancellable::Cancellable,
    types::{EventType, ServerErrorEvent, ServerErrorKind, ServerEvent},
};

/// Callback invoked for one inbound event.
pub type EventCallback = Arc<dyn Fn(&ServerEvent) + Send + Sync + 'static>;
/// Callback invoked for one inbound error frame.
pub type ErrorCallback = Arc<dyn Fn(&ServerErrorEvent) + Send + Sync + 'static>;

struct Registry<K, C> {
    next_id: u64,
    entries: HashMap<K, Vec<(u64, C)>>,
}

impl<K: Eq + Hash, C: Clone> Registry<K, C> {
    fn new() -> Self {
        Self {
            next_id: 0,
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, key: K, callback: C) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.entry(key).or_default().push((id, callback));
        id
    }

    fn remove(&mut self, key: &K, id: u64) {
        if let Some(list) = self.entries.get_mut(key) {
            list.retain(|(entry_id, _)| *entry_id != id);
            if list.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    fn snapshot(&self, key: &K) -> Vec<C> {
        self.entries
            .get(key)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    fn len(&self, key: &K) -> usize {
        self.entries.get(key).map_or(0, Vec::len)
    }
}

/// Fans decoded inbound events and error frames out to type-keyed
/// subscribers.
///
/// Real transport messages and locally synthesized events go through the
/// same `dispatch` call. Subscribers of one type are invoked in registration
/// order, outside the registry lock, so callbacks may subscribe, cancel or
/// dispatch re-entrantly. A panicking callback is logged and skipped.
pub struct EventDispatcher {
    events: RwLock<Registry<EventType, EventCallback>>,
    any: RwLock<Registry<(), EventCallback>>,
    errors: RwLock<Registry<ServerErrorKind, ErrorCallback>>,
}

impl EventDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: RwLock::new(Registry::new()),
            any: RwLock::new(Registry::new()),
            errors: RwLock::new(Registry::new()),
        })
    }

    pub fn subscribe(
        self: &Arc<Self>,
        event_type: EventType,
        callback: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> Cancellable {
        let id = self
            .events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_type, Arc::new(callback));
        let weak = Arc::downgrade(self);
        Cancellable::new(move || {
            if let Some(dispatcher) = Weak::upgrade(&weak) {
                dispatcher
                    .events
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&event_type, id);
            }
        })
    }

    /// Observe every event regardless of type; invoked after typed
    /// subscribers.
    pub fn subscribe_all(
        self: &Arc<Self>,
        callback: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> Cancellable {
        let id = self
            .any
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((), Arc::new(callback));
        let weak = Arc::downgrade(self);
        Cancellable::new(move || {
            if let Some(dispatcher) = Weak::upgrade(&weak) {
                dispatcher
                    .any
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&(), id);
            }
        })
    }

    pub fn subscribe_error(
        self: &Arc<Self>,
        kind: ServerErrorKind,
        callback: impl Fn(&ServerErrorEvent) + Send + Sync + 'static,
    ) -> Cancellable {
        let id = self
            .errors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, Arc::new(callback));
        let weak = Arc::downgrade(self);
        Cancellable::new(move || {
            if let Some(dispatcher) = Weak::upgrade(&weak) {
                dispatcher
                    .errors
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&kind, id);
            }
        })
    }

    /// Deliver one event. Returns the number of typed subscribers reached.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let event_type = event.event_type();
        let typed = self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot(&event_type);
        let any = self
            .any
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot(&());
        trace!(?event_type, subscribers = typed.len(), "dispatching event");

        for callback in typed.iter().chain(any.iter()) {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(?event_type, "event subscriber panicked; continuing delivery");
            }
        }
        typed.len()
    }

    /// Deliver one error frame. Returns the number of subscribers reached.
    pub fn dispatch_error(&self, error: &ServerErrorEvent) -> usize {
        let callbacks = self
            .errors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot(&error.kind);
        trace!(kind = ?error.kind, subscribers = callbacks.len(), "dispatching error");

        for callback in &callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(error))).is_err() {
                warn!(kind = ?error.kind, "error subscriber panicked; continuing delivery");
            }
        }
        callbacks.len()
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len(&event_type)
    }

    pub fn error_subscriber_count(&self, kind: ServerErrorKind) -> usize {
        self.errors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len(&kind)
    }
}
