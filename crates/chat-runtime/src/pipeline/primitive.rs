use std::sync::Arc;

use chat_core::{OutboundEvent, encode_outbound};
use tracing::{debug, warn};

use super::{EventHandler, TriggerCallbacks};
use crate::context::{SessionContext, map_transport_error};

/// Serializes the event into its wire envelope and hands it to the
/// transport. Completion callbacks are delivered on the foreground context.
pub struct PrimitiveEventHandler {
    context: Arc<SessionContext>,
}

impl PrimitiveEventHandler {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self { context }
    }
}

impl EventHandler for PrimitiveEventHandler {
    fn trigger(&self, event: OutboundEvent, callbacks: TriggerCallbacks) {
        let connection = self.context.connection();
        let token = self.context.access_token();
        let result = encode_outbound(&event, &connection, token.as_ref().map(|t| t.token.as_str()))
            .and_then(|frame| {
                self.context
                    .transport
                    .send(&frame)
                    .map_err(map_transport_error)
            });

        match result {
            Ok(()) => {
                debug!(kind = event.payload.kind(), event_id = %event.event_id, "event sent");
                self.context.executors.post_foreground(move || callbacks.sent());
            }
            Err(err) => {
                warn!(kind = event.payload.kind(), error = %err, "event send failed");
                self.context
                    .executors
                    .post_foreground(move || callbacks.failed(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chat_core::ClientEvent;
    use tokio::sync::oneshot;

    use super::*;
    use crate::test_support::Harness;

    #[tokio::test]
    async fn sends_envelope_and_reports_success() {
        let harness = Harness::single_thread();
        harness.open_transport();
        let handler = PrimitiveEventHandler::new(harness.context());
        let (tx, rx) = oneshot::channel();

        handler.trigger(
            ClientEvent::FetchThreadList.into(),
            TriggerCallbacks::none().on_sent(move || {
                let _ = tx.send(());
            }),
        );
        rx.await.expect("sent callback");

        let frames = harness.sent_events();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "fetchThreadList");
        assert_eq!(frames[0]["brandId"], 1086);
    }

    #[tokio::test]
    async fn reports_transport_failure_to_error_callback() {
        let harness = Harness::single_thread();
        let handler = PrimitiveEventHandler::new(harness.context());
        let (tx, rx) = oneshot::channel();

        handler.trigger(
            ClientEvent::FetchThreadList.into(),
            TriggerCallbacks::none().on_error(move |err| {
                let _ = tx.send(err);
            }),
        );
        let err = rx.await.expect("error callback");
        assert_eq!(err.code, "not_connected");
    }
}
