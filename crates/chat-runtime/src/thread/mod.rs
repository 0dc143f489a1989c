//! Per-thread handler pipeline.
//!
//! Inner to outer: primitive (model owner), message ingestion, metadata
//! load (listed multi-thread threads), archival (multi-thread), then either
//! live-chat specifics or the standard welcome orchestrator.

mod archive;
mod live_chat;
mod messages;
mod metadata;
pub mod model;
mod primitive;
mod registry;
mod welcome;

use std::sync::Arc;

use chat_core::{
    Cancellable, ChatError, ChatMode, ChatThread, CustomField, MessageContent, ServerEvent,
};
use chat_platform::AttachmentUpload;
use uuid::Uuid;

pub use archive::ArchiveThreadHandler;
pub use live_chat::LiveChatThreadHandler;
pub use messages::MessagesThreadHandler;
pub use metadata::MetadataThreadHandler;
pub use model::ThreadModel;
pub use primitive::PrimitiveThreadHandler;
pub use registry::{ConversationStart, LiveChatWelcomeRegistry};
pub use welcome::WelcomeThreadHandler;

use crate::{context::SessionContext, pipeline::EventHandler};

/// Message composed by the customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub content: MessageContent,
    pub attachments: Vec<AttachmentUpload>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self::with_content(MessageContent::text(text))
    }

    /// Reply to a quick-reply or rich option carrying a postback payload.
    pub fn postback(text: impl Into<String>, postback: impl Into<String>) -> Self {
        Self::with_content(MessageContent::Text {
            text: text.into(),
            postback: Some(postback.into()),
        })
    }

    pub fn with_content(content: MessageContent) -> Self {
        Self {
            id: Uuid::new_v4(),
            content,
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, upload: AttachmentUpload) -> Self {
        self.attachments.push(upload);
        self
    }
}

/// Thread-scoped operations that only emit an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadAction {
    MarkRead,
    Typing(bool),
    Rename(String),
    SetContactFields(Vec<CustomField>),
}

pub type ArchiveCallback = Box<dyn FnOnce(Result<(), ChatError>) + Send + 'static>;
pub type ThreadObserver = Arc<dyn Fn(&ChatThread) + Send + Sync + 'static>;

/// Operations on one thread. Implemented by a fixed decorator stack; each
/// layer forwards what it does not handle.
pub trait ThreadHandler: Send + Sync {
    fn thread_id(&self) -> Uuid;

    /// Current snapshot. May wait a short bounded grace period for
    /// in-flight enrichment.
    fn get(&self) -> ChatThread;

    /// Observe merged changes; fires once per effective change.
    fn subscribe(&self, on_update: ThreadObserver) -> Cancellable;

    /// Ask the backend to resend the full thread.
    fn refresh(&self) -> Result<(), ChatError>;

    /// Request the next page of older messages. `Ok(false)` when there is
    /// nothing more to load.
    fn load_more(&self) -> Result<bool, ChatError>;

    /// Send a message; returns its id.
    fn send(&self, message: OutboundMessage) -> Result<Uuid, ChatError>;

    fn update(&self, action: ThreadAction) -> Result<(), ChatError>;

    fn archive(&self, on_complete: ArchiveCallback) -> Result<(), ChatError>;

    fn end_contact(&self) -> Result<(), ChatError>;

    /// Release subscriptions and pending work.
    fn close(&self);
}

/// What every thread layer needs from the session.
#[derive(Clone)]
pub struct ThreadDeps {
    pub context: Arc<SessionContext>,
    pub events: Arc<dyn EventHandler>,
}

/// How a handler came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadOrigin {
    /// Created locally by the customer.
    Created,
    /// Delivered by a recovery response.
    Recovered,
    /// Listed by the multi-thread thread list.
    Listed,
}

/// Assemble the handler stack for `thread`.
pub fn build_thread_handler(
    deps: &ThreadDeps,
    thread: ChatThread,
    origin: ThreadOrigin,
) -> Arc<dyn ThreadHandler> {
    let mode = deps.context.mode();
    let thread_id = thread.id;
    let model = ThreadModel::new(thread, deps.context.executors.clone());

    let mut handler: Arc<dyn ThreadHandler> =
        Arc::new(PrimitiveThreadHandler::new(deps.clone(), Arc::clone(&model)));
    handler = Arc::new(MessagesThreadHandler::new(
        handler,
        deps.clone(),
        Arc::clone(&model),
    ));
    if mode == ChatMode::MultiThread {
        if origin == ThreadOrigin::Listed {
            handler = Arc::new(MetadataThreadHandler::new(
                handler,
                deps.clone(),
                Arc::clone(&model),
            ));
        }
        handler = Arc::new(ArchiveThreadHandler::new(
            handler,
            deps.clone(),
            Arc::clone(&model),
        ));
    }
    if mode == ChatMode::LiveChat {
        let cell = match origin {
            ThreadOrigin::Created => deps.context.welcome_registry.arm(thread_id),
            ThreadOrigin::Recovered | ThreadOrigin::Listed => {
                deps.context.welcome_registry.cell(thread_id)
            }
        };
        handler = Arc::new(LiveChatThreadHandler::new(handler, deps.clone(), model, cell));
    } else if origin == ThreadOrigin::Created {
        handler = WelcomeThreadHandler::new(handler, deps.clone(), model);
    }
    handler
}

/// Record seeded from a pending thread and the event that introduced it.
pub fn thread_from_event(thread_id: Uuid, event: &ServerEvent) -> ChatThread {
    model::apply_event(&ChatThread::pending(thread_id), event)
}
