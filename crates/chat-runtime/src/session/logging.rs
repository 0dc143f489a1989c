use std::sync::Arc;

use chat_core::{Cancellable, ChatError};
use tracing::{debug, info, warn};

use super::ChatSession;
use crate::{
    context::{LifecycleEvent, SessionContext},
    pipeline::EventPipeline,
};

/// Dev-mode tracing of every inbound event and transport transition.
pub struct LoggingChatSession {
    inner: Arc<dyn ChatSession>,
    subscriptions: Cancellable,
}

impl LoggingChatSession {
    pub fn new(inner: Arc<dyn ChatSession>) -> Self {
        let context = inner.context();
        let events = context.dispatcher.subscribe_all(|event| {
            debug!(event_type = ?event.event_type(), thread_id = ?event.thread_id(), "inbound event");
        });
        let lifecycle = context.lifecycle.subscribe(|event| match event {
            LifecycleEvent::Opened => debug!("transport opened"),
            LifecycleEvent::Failed(error) => debug!(error = %error, "transport failed"),
            LifecycleEvent::Closing { code, reason } => {
                debug!(code, reason = %reason, "transport closing");
            }
        });
        Self {
            subscriptions: Cancellable::compound([events, lifecycle]),
            inner,
        }
    }
}

impl ChatSession for LoggingChatSession {
    fn context(&self) -> &Arc<SessionContext> {
        self.inner.context()
    }

    fn events(&self) -> &EventPipeline {
        self.inner.events()
    }

    fn connect(&self) -> Result<(), ChatError> {
        info!(channel_id = %self.context().connection().channel_id, "connecting");
        self.inner.connect().inspect_err(|err| {
            warn!(error = %err, "connect failed");
        })
    }

    fn close(&self) {
        info!("closing session");
        self.subscriptions.cancel();
        self.inner.close();
    }
}
