//! Session-level event handler pipeline.
//!
//! Outer to inner: background dispatch, auth delay, visit guard, token
//! refresh, page-time coalescing, primitive send.

mod auth_delay;
mod background;
mod page_time;
mod primitive;
mod token_refresh;
mod visit;

use std::sync::Arc;

use chat_core::{ChatError, OutboundEvent};

pub use auth_delay::AuthDelayEventHandler;
pub use background::BackgroundEventHandler;
pub use page_time::PageTimeEventHandler;
pub use primitive::PrimitiveEventHandler;
pub use token_refresh::TokenRefreshEventHandler;
pub use visit::VisitEventHandler;

use crate::context::SessionContext;

type SentCallback = Box<dyn FnOnce() + Send + 'static>;
type ErrorCallback = Box<dyn FnOnce(ChatError) + Send + 'static>;

/// Completion callbacks of one triggered event. Each fires at most once.
#[derive(Default)]
pub struct TriggerCallbacks {
    on_sent: Option<SentCallback>,
    on_error: Option<ErrorCallback>,
}

impl TriggerCallbacks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn on_sent(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_sent = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnOnce(ChatError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn sent(self) {
        if let Some(callback) = self.on_sent {
            callback();
        }
    }

    pub fn failed(self, error: ChatError) {
        if let Some(callback) = self.on_error {
            callback(error);
        }
    }
}

impl std::fmt::Debug for TriggerCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerCallbacks")
            .field("on_sent", &self.on_sent.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Sends client events to the backend.
pub trait EventHandler: Send + Sync {
    fn trigger(&self, event: OutboundEvent, callbacks: TriggerCallbacks);
}

/// Assembled pipeline plus the handles session layers need.
#[derive(Clone)]
pub struct EventPipeline {
    pub handler: Arc<dyn EventHandler>,
    pub auth_delay: Arc<AuthDelayEventHandler>,
}

impl EventPipeline {
    pub fn build(context: &Arc<SessionContext>) -> Self {
        let primitive: Arc<dyn EventHandler> = Arc::new(PrimitiveEventHandler::new(Arc::clone(context)));
        let page_time: Arc<dyn EventHandler> =
            Arc::new(PageTimeEventHandler::new(primitive, Arc::clone(context)));
        let token_refresh: Arc<dyn EventHandler> =
            Arc::new(TokenRefreshEventHandler::new(page_time, Arc::clone(context)));
        let visit: Arc<dyn EventHandler> =
            Arc::new(VisitEventHandler::new(token_refresh, Arc::clone(context)));
        let auth_delay = Arc::new(AuthDelayEventHandler::new(visit, Arc::clone(context)));
        let handler: Arc<dyn EventHandler> = Arc::new(BackgroundEventHandler::new(
            Arc::clone(&auth_delay) as Arc<dyn EventHandler>,
            &context.executors,
        ));
        Self {
            handler,
            auth_delay,
        }
    }
}
