use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use chat_core::{
    Cancellable, ChatError, ChatThread, ClientEvent, ErrorCategory, EventType, OutboundEvent,
    ServerErrorKind, normalize_server_error,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ArchiveCallback, OutboundMessage, ThreadAction, ThreadDeps, ThreadHandler, ThreadObserver,
    model::ThreadModel,
};
use crate::pipeline::TriggerCallbacks;

struct PendingArchive {
    subscriptions: Cancellable,
    previous_can_add: bool,
    on_complete: ArchiveCallback,
}

struct ArchiveState {
    deps: ThreadDeps,
    model: Arc<ThreadModel>,
    thread_id: Uuid,
    pending: Mutex<HashMap<Uuid, PendingArchive>>,
}

impl ArchiveState {
    /// Settle one archive request. Later calls for the same event id are
    /// ignored.
    fn finish(&self, event_id: Uuid, result: Result<(), ChatError>) {
        let Some(entry) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&event_id)
        else {
            return;
        };
        entry.subscriptions.cancel();

        match &result {
            Ok(()) => info!(thread_id = %self.thread_id, "thread archived"),
            Err(err) => {
                warn!(thread_id = %self.thread_id, error = %err, "archive failed; rolling back");
                let previous = entry.previous_can_add;
                self.model.update(|thread| ChatThread {
                    can_add_more_messages: previous,
                    ..thread.clone()
                });
            }
        }
        let on_complete = entry.on_complete;
        self.deps
            .context
            .executors
            .post_foreground(move || on_complete(result));
    }
}

/// Multi-thread archival with optimistic lock-out and rollback.
pub struct ArchiveThreadHandler {
    inner: Arc<dyn ThreadHandler>,
    state: Arc<ArchiveState>,
}

impl ArchiveThreadHandler {
    pub fn new(inner: Arc<dyn ThreadHandler>, deps: ThreadDeps, model: Arc<ThreadModel>) -> Self {
        let thread_id = inner.thread_id();
        Self {
            inner,
            state: Arc::new(ArchiveState {
                deps,
                model,
                thread_id,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Archive requests still waiting for confirmation.
    pub fn pending_archives(&self) -> usize {
        self.state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn correlate(&self, event_id: Uuid) -> Cancellable {
        let thread_id = self.state.thread_id;
        let dispatcher = &self.state.deps.context.dispatcher;

        let weak: Weak<ArchiveState> = Arc::downgrade(&self.state);
        let confirmed = dispatcher.subscribe(EventType::ThreadArchived, move |event| {
            if event.thread_id() == Some(thread_id)
                && let Some(state) = weak.upgrade()
            {
                state.finish(event_id, Ok(()));
            }
        });

        let weak: Weak<ArchiveState> = Arc::downgrade(&self.state);
        let failed = dispatcher.subscribe_error(ServerErrorKind::ArchivingThreadFailed, move |error| {
            let matches = match error.event_id {
                Some(id) => id == event_id,
                None => error.thread_id == Some(thread_id),
            };
            if !matches {
                return;
            }
            if let Some(state) = weak.upgrade() {
                state.deps.context.report(normalize_server_error(error));
                state.finish(
                    event_id,
                    Err(ChatError::new(
                        ErrorCategory::Server,
                        "archive_failed",
                        error.message.clone(),
                    )),
                );
            }
        });

        Cancellable::compound([confirmed, failed])
    }
}

impl ThreadHandler for ArchiveThreadHandler {
    fn thread_id(&self) -> Uuid {
        self.inner.thread_id()
    }

    fn get(&self) -> ChatThread {
        self.inner.get()
    }

    fn subscribe(&self, on_update: ThreadObserver) -> Cancellable {
        self.inner.subscribe(on_update)
    }

    fn refresh(&self) -> Result<(), ChatError> {
        self.inner.refresh()
    }

    fn load_more(&self) -> Result<bool, ChatError> {
        self.inner.load_more()
    }

    fn send(&self, message: OutboundMessage) -> Result<Uuid, ChatError> {
        self.inner.send(message)
    }

    fn update(&self, action: ThreadAction) -> Result<(), ChatError> {
        self.inner.update(action)
    }

    fn archive(&self, on_complete: ArchiveCallback) -> Result<(), ChatError> {
        let thread_id = self.state.thread_id;
        let event = OutboundEvent::new(ClientEvent::ArchiveThread { thread_id });
        let event_id = event.event_id;

        let mut previous_can_add = true;
        self.state.model.update(|thread| {
            previous_can_add = thread.can_add_more_messages;
            ChatThread {
                can_add_more_messages: false,
                ..thread.clone()
            }
        });

        let subscriptions = self.correlate(event_id);
        self.state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                event_id,
                PendingArchive {
                    subscriptions,
                    previous_can_add,
                    on_complete,
                },
            );
        debug!(thread_id = %thread_id, event_id = %event_id, "archiving thread");

        let weak = Arc::downgrade(&self.state);
        self.state.deps.events.trigger(
            event,
            TriggerCallbacks::none().on_error(move |err| {
                if let Some(state) = weak.upgrade() {
                    state.finish(event_id, Err(err));
                }
            }),
        );
        Ok(())
    }

    fn end_contact(&self) -> Result<(), ChatError> {
        self.inner.end_contact()
    }

    fn close(&self) {
        let pending: Vec<PendingArchive> = self
            .state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in pending {
            entry.subscriptions.cancel();
        }
        self.inner.close();
    }
}
