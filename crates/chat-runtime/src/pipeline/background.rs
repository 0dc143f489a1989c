use std::sync::Arc;

use chat_core::OutboundEvent;
use tokio::sync::mpsc;
use tracing::warn;

use super::{EventHandler, TriggerCallbacks};
use crate::executor::Executors;

/// Moves every trigger off the caller onto one background queue.
///
/// A single drain task keeps events in trigger order.
pub struct BackgroundEventHandler {
    queue: mpsc::UnboundedSender<(OutboundEvent, TriggerCallbacks)>,
}

impl BackgroundEventHandler {
    pub fn new(inner: Arc<dyn EventHandler>, executors: &Executors) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<(OutboundEvent, TriggerCallbacks)>();
        // Detached; ends once the handler and its queue are dropped.
        let _drain = executors.spawn_background(async move {
            while let Some((event, callbacks)) = rx.recv().await {
                inner.trigger(event, callbacks);
            }
        });
        Self { queue }
    }
}

impl EventHandler for BackgroundEventHandler {
    fn trigger(&self, event: OutboundEvent, callbacks: TriggerCallbacks) {
        if let Err(mpsc::error::SendError((event, _))) = self.queue.send((event, callbacks)) {
            warn!(kind = event.payload.kind(), "background queue stopped; dropping event");
        }
    }
}
