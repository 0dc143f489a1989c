use std::sync::Arc;

use chat_core::{
    Cancellable, ChatError, EventType, ProactiveAction, ServerEvent, normalize_background_failure,
};
use tracing::debug;

use super::ChatSession;
use crate::{
    context::{SessionContext, map_storage_error},
    pipeline::EventPipeline,
};

/// Remembers the latest proactive welcome message so threads can show it
/// before the customer writes anything.
pub struct WelcomeCaptureChatSession {
    inner: Arc<dyn ChatSession>,
    subscription: Cancellable,
}

impl WelcomeCaptureChatSession {
    pub fn new(inner: Arc<dyn ChatSession>) -> Self {
        let context = Arc::clone(inner.context());
        let session = Arc::clone(&context);
        let subscription = context
            .dispatcher
            .subscribe(EventType::ProactiveAction, move |event| {
                if let ServerEvent::ProactiveAction {
                    action: ProactiveAction::WelcomeMessage { action_id, text },
                } = event
                {
                    debug!(action_id = %action_id, "captured welcome message");
                    if let Err(err) = session.storage.set_welcome_template(text) {
                        session.report(normalize_background_failure(
                            "store_welcome_message",
                            map_storage_error(err),
                        ));
                    }
                    session.publish_welcome_template(text.clone());
                }
            });
        Self {
            inner,
            subscription,
        }
    }
}

impl ChatSession for WelcomeCaptureChatSession {
    fn context(&self) -> &Arc<SessionContext> {
        self.inner.context()
    }

    fn events(&self) -> &EventPipeline {
        self.inner.events()
    }

    fn connect(&self) -> Result<(), ChatError> {
        self.inner.connect()
    }

    fn close(&self) {
        self.subscription.cancel();
        self.inner.close();
    }
}
