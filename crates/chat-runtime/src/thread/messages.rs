use std::sync::{Arc, Mutex, PoisonError};

use chat_core::{
    Cancellable, CaseStatus, ChatError, ChatThread, EventType, ServerErrorKind, ServerEvent,
    ThreadState, normalize_server_error,
};
use tracing::debug;
use uuid::Uuid;

use super::{
    ArchiveCallback, OutboundMessage, ThreadAction, ThreadDeps, ThreadHandler, ThreadObserver,
    model::ThreadModel,
};

const THREAD_EVENTS: [EventType; 10] = [
    EventType::MessageCreated,
    EventType::MoreMessagesLoaded,
    EventType::MessageReadChanged,
    EventType::AgentTyping,
    EventType::AssignedAgentChanged,
    EventType::QueuePositionChanged,
    EventType::CaseStatusChanged,
    EventType::ThreadRecovered,
    EventType::ThreadUpdated,
    EventType::ThreadArchived,
];

const THREAD_ERRORS: [ServerErrorKind; 5] = [
    ServerErrorKind::SendMessageFailed,
    ServerErrorKind::LoadMoreMessagesFailed,
    ServerErrorKind::SettingCustomFieldsFailed,
    ServerErrorKind::RecoveringThreadFailed,
    ServerErrorKind::RecoveringLivechatFailed,
];

/// Merges inbound events addressed to this thread into its model and
/// reports thread-scoped server errors.
pub struct MessagesThreadHandler {
    inner: Arc<dyn ThreadHandler>,
    subscriptions: Mutex<Vec<Cancellable>>,
}

impl MessagesThreadHandler {
    pub fn new(inner: Arc<dyn ThreadHandler>, deps: ThreadDeps, model: Arc<ThreadModel>) -> Self {
        let thread_id = inner.thread_id();
        let context = &deps.context;
        let mut subscriptions = Vec::with_capacity(THREAD_EVENTS.len() + THREAD_ERRORS.len());

        for event_type in THREAD_EVENTS {
            let model = Arc::clone(&model);
            let listener = Arc::clone(context);
            subscriptions.push(context.dispatcher.subscribe(event_type, move |event| {
                if event.thread_id() != Some(thread_id) {
                    return;
                }
                if let ServerEvent::ThreadRecovered { thread } = event {
                    listener.merge_customer_fields(&thread.customer_fields);
                }
                if !model.apply(event) {
                    return;
                }
                debug!(thread_id = %thread_id, ?event_type, "thread updated");
                if let ServerEvent::CaseStatusChanged {
                    status: CaseStatus::Closed,
                    ..
                } = event
                {
                    listener.dispatcher.dispatch(&ServerEvent::ThreadUpdated {
                        thread_id,
                        name: None,
                        can_add_more_messages: Some(false),
                        state: Some(ThreadState::Closed),
                    });
                }
            }));
        }

        for kind in THREAD_ERRORS {
            let reporter = Arc::clone(context);
            subscriptions.push(context.dispatcher.subscribe_error(kind, move |error| {
                if error.thread_id == Some(thread_id) {
                    reporter.report(normalize_server_error(error));
                }
            }));
        }

        Self {
            inner,
            subscriptions: Mutex::new(subscriptions),
        }
    }
}

impl ThreadHandler for MessagesThreadHandler {
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
        self.inner.archive(on_complete)
    }

    fn end_contact(&self) -> Result<(), ChatError> {
        self.inner.end_contact()
    }

    fn close(&self) {
        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for subscription in subscriptions {
            subscription.cancel();
        }
        self.inner.close();
    }
}
