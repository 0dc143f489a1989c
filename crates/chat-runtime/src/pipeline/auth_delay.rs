use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use chat_core::{ChatError, OutboundEvent};
use tracing::debug;

use super::{EventHandler, TriggerCallbacks};
use crate::context::SessionContext;

#[derive(Default)]
struct DelayState {
    pending: VecDeque<(OutboundEvent, TriggerCallbacks)>,
    disabled: bool,
}

/// Holds events until the customer has a usable access token.
///
/// Authorization and analytics events always pass. Held events are replayed
/// in arrival order by [`flush`](Self::flush). Events that arrive while a
/// flush is replaying may overtake held ones once delaying is disabled.
pub struct AuthDelayEventHandler {
    inner: Arc<dyn EventHandler>,
    context: Arc<SessionContext>,
    state: Mutex<DelayState>,
}

impl AuthDelayEventHandler {
    pub fn new(inner: Arc<dyn EventHandler>, context: Arc<SessionContext>) -> Self {
        let disabled = !context.config.delay_until_authorized;
        Self {
            inner,
            context,
            state: Mutex::new(DelayState {
                pending: VecDeque::new(),
                disabled,
            }),
        }
    }

    /// Replay held events; with `disable_future` nothing is held afterwards.
    pub fn flush(&self, disable_future: bool) {
        let pending = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if disable_future {
                state.disabled = true;
            }
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "replaying events held for authorization");
        }
        for (event, callbacks) in pending {
            self.inner.trigger(event, callbacks);
        }
    }

    /// Fail and drop every held event.
    pub fn clear(&self) {
        let pending = std::mem::take(
            &mut self
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending,
        );
        for (event, callbacks) in pending {
            callbacks.failed(ChatError::invalid_state(
                "Closed",
                format!("send {}", event.payload.kind()),
            ));
        }
    }

    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    fn has_usable_token(&self) -> bool {
        let threshold_ms = self.context.config.token_refresh_threshold.as_millis() as u64;
        let now_ms = self.context.clock.now_ms();
        self.context
            .access_token()
            .is_some_and(|token| token.expires_at_ms > now_ms.saturating_add(threshold_ms))
    }
}

impl EventHandler for AuthDelayEventHandler {
    fn trigger(&self, event: OutboundEvent, callbacks: TriggerCallbacks) {
        let exempt = event.payload.is_authorization() || event.payload.is_analytics();
        if !exempt && !self.has_usable_token() {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.disabled {
                debug!(kind = event.payload.kind(), "holding event until authorized");
                state.pending.push_back((event, callbacks));
                return;
            }
        }
        self.inner.trigger(event, callbacks);
    }
}
