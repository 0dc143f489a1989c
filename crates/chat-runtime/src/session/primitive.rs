use std::sync::{Arc, Weak};

use chat_core::{
    ChatError, Connection, ConnectionState, ErrorCategory, InboundFrame, decode_inbound_frame,
    normalize_background_failure,
};
use chat_platform::{NORMAL_CLOSURE, TransportError, TransportListener};
use tracing::{debug, warn};
use url::Url;

use super::ChatSession;
use crate::{
    context::{LifecycleEvent, SessionContext, map_transport_error},
    pipeline::EventPipeline,
};

/// Bottom of the stack: owns the transport connection and turns inbound
/// frames into dispatched events.
pub struct PrimitiveChatSession {
    context: Arc<SessionContext>,
    events: EventPipeline,
}

impl PrimitiveChatSession {
    pub fn new(context: Arc<SessionContext>) -> Self {
        let events = EventPipeline::build(&context);
        Self { context, events }
    }
}

impl ChatSession for PrimitiveChatSession {
    fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    fn events(&self) -> &EventPipeline {
        &self.events
    }

    fn connect(&self) -> Result<(), ChatError> {
        self.context.emit_state(ConnectionState::Connecting);
        let url = socket_url(&self.context.connection())?;
        debug!(url = %url, "opening chat transport");
        let listener = Arc::new(SessionListener {
            context: Arc::downgrade(&self.context),
        });
        self.context
            .transport
            .open(&url, listener)
            .map_err(map_transport_error)
    }

    fn close(&self) {
        self.events.auth_delay.clear();
        self.context
            .transport
            .close(NORMAL_CLOSURE, "closed by client");
    }
}

/// Socket endpoint with the identifiers the backend routes on.
fn socket_url(connection: &Connection) -> Result<Url, ChatError> {
    let mut url = Url::parse(&connection.environment.socket_url).map_err(|err| {
        ChatError::new(ErrorCategory::Config, "invalid_socket_url", err.to_string())
    })?;
    url.query_pairs_mut()
        .append_pair("brandId", &connection.brand_id.to_string())
        .append_pair("channelId", &connection.channel_id)
        .append_pair("visitorId", &connection.visitor_id.to_string())
        .append_pair("customerId", &connection.customer.id);
    Ok(url)
}

/// Hops transport callbacks onto the foreground context.
struct SessionListener {
    context: Weak<SessionContext>,
}

impl SessionListener {
    fn post(&self, job: impl FnOnce(&SessionContext) + Send + 'static) {
        let Some(context) = self.context.upgrade() else {
            return;
        };
        let weak = Arc::downgrade(&context);
        context.executors.post_foreground(move || {
            if let Some(context) = weak.upgrade() {
                job(&context);
            }
        });
    }
}

impl TransportListener for SessionListener {
    fn on_open(&self) {
        self.post(|context| {
            context.emit_state(ConnectionState::Connected);
            context.lifecycle.publish(&LifecycleEvent::Opened);
        });
    }

    fn on_message(&self, frame: &str) {
        let frame = frame.to_owned();
        self.post(move |context| match decode_inbound_frame(&frame) {
            Ok(InboundFrame::Event(event)) => {
                if context.dispatcher.dispatch(&event) == 0 {
                    debug!(event_type = ?event.event_type(), "no subscriber for event");
                }
            }
            Ok(InboundFrame::Error(error)) => {
                if context.dispatcher.dispatch_error(&error) == 0 {
                    debug!(kind = ?error.kind, "no subscriber for server error");
                }
            }
            Err(err) => {
                warn!(error = %err, "undecodable frame");
                context.report(normalize_background_failure("decode_frame", err));
            }
        });
    }

    fn on_failure(&self, error: &TransportError) {
        let error = error.clone();
        self.post(move |context| {
            context.lifecycle.publish(&LifecycleEvent::Failed(error));
        });
    }

    fn on_closing(&self, code: u16, reason: &str) {
        let reason = reason.to_owned();
        self.post(move |context| {
            context
                .lifecycle
                .publish(&LifecycleEvent::Closing { code, reason });
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chat_core::{ChatNotification, ChatRuntimeError, EventType, ServerErrorKind};

    use super::*;
    use crate::test_support::{Harness, error_frame};

    #[test]
    fn socket_url_carries_routing_identifiers() {
        let url = socket_url(&crate::test_support::connection()).expect("url");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(query[0], ("brandId".to_owned(), "1086".to_owned()));
        assert_eq!(query[1], ("channelId".to_owned(), "chat_web".to_owned()));
        assert_eq!(query[3], ("customerId".to_owned(), "customer-7".to_owned()));
    }

    #[tokio::test]
    async fn open_and_frames_reach_subscribers_in_order() {
        let harness = Harness::single_thread();
        let context = harness.context();
        let session = PrimitiveChatSession::new(Arc::clone(&context));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let lifecycle = {
            let seen = Arc::clone(&seen);
            context
                .lifecycle
                .subscribe(move |event| seen.lock().expect("lock").push(format!("{event:?}")))
        };
        let typing = {
            let seen = Arc::clone(&seen);
            context.dispatcher.subscribe(EventType::AgentTyping, move |_| {
                seen.lock().expect("lock").push("typing".to_owned());
            })
        };

        session.connect().expect("connect");
        harness.transport.deliver(&format!(
            r#"{{"type":"agentTyping","threadId":"{}","isTyping":true}}"#,
            uuid::Uuid::from_u128(1)
        ));
        context.executors.foreground_idle().await;

        assert_eq!(*seen.lock().expect("lock"), vec!["Opened", "typing"]);
        lifecycle.cancel();
        typing.cancel();
    }

    #[tokio::test]
    async fn garbage_frame_is_reported() {
        let harness = Harness::single_thread();
        let context = harness.context();
        let mut stream = context.notifications.subscribe();
        let session = PrimitiveChatSession::new(Arc::clone(&context));

        session.connect().expect("connect");
        harness.transport.deliver("{not json");

        match harness.next_error(&mut stream).await {
            ChatNotification::RuntimeError(ChatRuntimeError::Background { operation, .. }) => {
                assert_eq!(operation, "decode_frame");
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_frames_go_to_error_subscribers() {
        let harness = Harness::single_thread();
        let context = harness.context();
        let session = PrimitiveChatSession::new(Arc::clone(&context));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let _subscription =
            context
                .dispatcher
                .subscribe_error(ServerErrorKind::FetchThreadListFailed, move |error| {
                    if let Some(tx) = tx.lock().expect("lock").take() {
                        let _ = tx.send(error.message.clone());
                    }
                });

        session.connect().expect("connect");
        harness.transport.deliver(&error_frame(
            ServerErrorKind::FetchThreadListFailed,
            None,
            "list unavailable",
        ));

        assert_eq!(rx.await.expect("error delivered"), "list unavailable");
    }

    #[tokio::test]
    async fn failed_open_is_a_network_error() {
        let harness = Harness::single_thread();
        harness.transport.fail_next_opens(1);
        let session = PrimitiveChatSession::new(harness.context());

        let err = session.connect().expect_err("refused");
        assert_eq!(err.code, "connect_failed");
        assert_eq!(err.category, ErrorCategory::Network);
    }
}
