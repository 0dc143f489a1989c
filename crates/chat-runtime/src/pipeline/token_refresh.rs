use std::sync::Arc;

use chat_core::{ClientEvent, OutboundEvent};
use tracing::debug;

use super::{EventHandler, TriggerCallbacks};
use crate::context::SessionContext;

/// Fires a token refresh ahead of any event sent while the stored token is
/// about to expire. The refresh is not awaited; the original event follows
/// immediately, and every such event gets its own refresh until a new token
/// is stored.
pub struct TokenRefreshEventHandler {
    inner: Arc<dyn EventHandler>,
    context: Arc<SessionContext>,
}

impl TokenRefreshEventHandler {
    pub fn new(inner: Arc<dyn EventHandler>, context: Arc<SessionContext>) -> Self {
        Self { inner, context }
    }

    fn token_needing_refresh(&self) -> Option<String> {
        let token = self.context.access_token()?;
        let threshold_ms = self.context.config.token_refresh_threshold.as_millis() as u64;
        let now_ms = self.context.clock.now_ms();
        (token.expires_at_ms <= now_ms.saturating_add(threshold_ms)).then_some(token.token)
    }
}

impl EventHandler for TokenRefreshEventHandler {
    fn trigger(&self, event: OutboundEvent, callbacks: TriggerCallbacks) {
        if !event.payload.is_authorization()
            && let Some(token) = self.token_needing_refresh()
        {
            debug!(kind = event.payload.kind(), "access token near expiry; refreshing first");
            self.inner
                .trigger(ClientEvent::RefreshToken { token }.into(), TriggerCallbacks::none());
        }
        self.inner.trigger(event, callbacks);
    }
}
