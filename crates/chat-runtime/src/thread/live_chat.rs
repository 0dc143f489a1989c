use std::sync::Arc;

use chat_core::{
    Cancellable, ChatError, ChatThread, ClientEvent, ServerErrorKind, TemplateContext,
    ThreadState, ThreadStateMachine, normalize_background_failure, normalize_server_error,
    resolve_template,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ArchiveCallback, OutboundMessage, ThreadAction, ThreadDeps, ThreadHandler, ThreadObserver,
    model::{ThreadModel, accepts_messages},
    registry::ConversationStart,
};
use crate::pipeline::TriggerCallbacks;

/// Live-chat specifics: the conversation-start sentinel and welcome message
/// sent exactly once per thread id, and ending the contact.
pub struct LiveChatThreadHandler {
    inner: Arc<dyn ThreadHandler>,
    deps: ThreadDeps,
    model: Arc<ThreadModel>,
    conversation: Arc<ConversationStart>,
    end_contact_failed: Cancellable,
}

impl LiveChatThreadHandler {
    pub fn new(
        inner: Arc<dyn ThreadHandler>,
        deps: ThreadDeps,
        model: Arc<ThreadModel>,
        conversation: Arc<ConversationStart>,
    ) -> Self {
        let thread_id = inner.thread_id();
        let reporter = Arc::clone(&deps.context);
        let end_contact_failed = deps.context.dispatcher.subscribe_error(
            ServerErrorKind::EndContactFailed,
            move |error| {
                if error.thread_id == Some(thread_id) {
                    reporter.report(normalize_server_error(error));
                }
            },
        );
        Self {
            inner,
            deps,
            model,
            conversation,
            end_contact_failed,
        }
    }

    fn trigger(&self, payload: ClientEvent, operation: &'static str) {
        let reporter = Arc::clone(&self.deps.context);
        self.deps.events.trigger(
            payload.into(),
            TriggerCallbacks::none().on_error(move |err| {
                reporter.report(normalize_background_failure(operation, err));
            }),
        );
    }

    /// Resolve the welcome template with whatever field data exists now.
    fn resolve_welcome(&self) -> Option<String> {
        let template = self.deps.context.welcome_template()?;
        let connection = self.deps.context.connection();
        let customer_fields = self.deps.context.customer_fields();
        let thread = self.model.snapshot();
        Some(resolve_template(
            &template,
            &TemplateContext {
                customer: &connection.customer,
                customer_fields: &customer_fields,
                contact_fields: &thread.contact_fields,
            },
        ))
    }

    fn start_conversation(&self) {
        let thread_id = self.thread_id();
        info!(thread_id = %thread_id, "starting live-chat conversation");
        self.trigger(ClientEvent::StartConversation { thread_id }, "start_conversation");
        if let Some(text) = self.resolve_welcome() {
            self.trigger(
                ClientEvent::SendOutbound {
                    thread_id,
                    message_id: Uuid::new_v4(),
                    text,
                },
                "send_welcome_message",
            );
        }
    }
}

impl ThreadHandler for LiveChatThreadHandler {
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
        if !accepts_messages(&self.model.snapshot()) {
            return Err(ChatError::thread_archived(self.thread_id()));
        }
        self.conversation.claim_with(|| self.start_conversation());
        self.inner.send(message)
    }

    fn update(&self, action: ThreadAction) -> Result<(), ChatError> {
        self.inner.update(action)
    }

    fn archive(&self, on_complete: ArchiveCallback) -> Result<(), ChatError> {
        self.inner.archive(on_complete)
    }

    fn end_contact(&self) -> Result<(), ChatError> {
        let thread = self.model.snapshot();
        if thread.state == ThreadState::Closed {
            debug!(thread_id = %thread.id, "contact already closed; nothing to end");
            return Ok(());
        }
        ThreadStateMachine::new(thread.state).require(ThreadState::Ready, "end_contact")?;
        self.trigger(
            ClientEvent::EndContact {
                thread_id: thread.id,
                contact_id: thread.contact_id,
            },
            "end_contact",
        );
        Ok(())
    }

    fn close(&self) {
        self.end_contact_failed.cancel();
        self.deps.context.welcome_registry.remove(self.thread_id());
        self.inner.close();
    }
}
