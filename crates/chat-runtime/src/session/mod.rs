//! Chat session decorator stack.
//!
//! Inner to outer: primitive transport session, authorization, welcome
//! capture, thread-mode behaviour, remote payload resolution, server error
//! reporting, reconnection and, in dev mode, logging. Each layer's `close`
//! releases what it owns and then delegates inward.

mod authorization;
mod error_reporter;
mod logging;
mod primitive;
mod reconnecting;
mod remote_payload;
mod thread_mode;
mod welcome_capture;

use std::sync::Arc;

use chat_core::{ChatError, ClientEvent, normalize_background_failure};

pub use authorization::AuthorizationChatSession;
pub use error_reporter::ErrorReportingChatSession;
pub use logging::LoggingChatSession;
pub use primitive::PrimitiveChatSession;
pub use reconnecting::ReconnectingChatSession;
pub use remote_payload::RemotePayloadChatSession;
pub use thread_mode::ThreadModeChatSession;
pub use welcome_capture::WelcomeCaptureChatSession;

use crate::{
    context::SessionContext,
    pipeline::{EventPipeline, TriggerCallbacks},
};

/// One connection to the chat backend plus everything layered on it.
pub trait ChatSession: Send + Sync {
    fn context(&self) -> &Arc<SessionContext>;

    fn events(&self) -> &EventPipeline;

    /// Open the transport. Lifecycle is reported asynchronously.
    fn connect(&self) -> Result<(), ChatError>;

    fn close(&self);
}

/// Assemble the full stack over `context`.
pub fn build_session(context: Arc<SessionContext>) -> Arc<dyn ChatSession> {
    let dev_mode = context.config.dev_mode;
    let session: Arc<dyn ChatSession> = Arc::new(PrimitiveChatSession::new(context));
    let session: Arc<dyn ChatSession> = Arc::new(AuthorizationChatSession::new(session));
    let session: Arc<dyn ChatSession> = Arc::new(WelcomeCaptureChatSession::new(session));
    let session: Arc<dyn ChatSession> = Arc::new(ThreadModeChatSession::new(session));
    let session: Arc<dyn ChatSession> = Arc::new(RemotePayloadChatSession::new(session));
    let session: Arc<dyn ChatSession> = Arc::new(ErrorReportingChatSession::new(session));
    let session: Arc<dyn ChatSession> = ReconnectingChatSession::new(session);
    if dev_mode {
        Arc::new(LoggingChatSession::new(session))
    } else {
        session
    }
}

/// Send `payload` through the pipeline, reporting a failure as background
/// work named `operation`.
pub(crate) fn trigger_reported(
    context: &Arc<SessionContext>,
    events: &EventPipeline,
    payload: ClientEvent,
    operation: &'static str,
) {
    let reporter = Arc::clone(context);
    events.handler.trigger(
        payload.into(),
        TriggerCallbacks::none().on_error(move |err| {
            reporter.report(normalize_background_failure(operation, err));
        }),
    );
}

#[cfg(test)]
mod tests {
    use chat_core::{
        CaseStatus, ChatNotification, ConnectionState, EventType, NotificationStream,
        RecoveredThread, ServerErrorKind, ServerEvent,
    };
    use chat_platform::ChannelConfiguration;
    use uuid::Uuid;

    use super::*;
    use crate::{
        config::RuntimeConfig,
        test_support::{Harness, authorized_frame, error_frame, event_frame},
    };

    /// Backend stand-in answering authorization and recovery requests.
    fn answer_like_backend(harness: &Harness, recover_fails: bool) {
        let expires_at_ms = harness.now_ms() + 3_600_000;
        harness.transport.set_responder(move |frame| {
            let request: serde_json::Value = serde_json::from_str(frame).unwrap_or_default();
            match request["type"].as_str() {
                Some("authorizeCustomer" | "reconnectCustomer") => {
                    vec![authorized_frame("token-1", expires_at_ms)]
                }
                Some("recoverThread") if recover_fails => vec![error_frame(
                    ServerErrorKind::RecoveringThreadFailed,
                    None,
                    "no thread yet",
                )],
                Some("recoverThread") => vec![event_frame(&ServerEvent::ThreadRecovered {
                    thread: RecoveredThread {
                        thread_id: Uuid::from_u128(77),
                        name: None,
                        messages: Vec::new(),
                        scroll_token: None,
                        agent: None,
                        contact_id: None,
                        status: CaseStatus::Open,
                        contact_fields: Vec::new(),
                        customer_fields: Vec::new(),
                        position_in_queue: None,
                    },
                })],
                _ => Vec::new(),
            }
        });
    }

    async fn states_until_ready(
        harness: &Harness,
        stream: &mut NotificationStream,
    ) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        loop {
            if let ChatNotification::ConnectionState(state) =
                harness.next_notification(stream).await
            {
                states.push(state);
                if state == ConnectionState::Ready {
                    return states;
                }
            }
        }
    }

    #[tokio::test]
    async fn single_thread_session_authorizes_and_recovers() {
        let harness = Harness::single_thread();
        answer_like_backend(&harness, false);
        let context = harness.context();
        let mut stream = context.notifications.subscribe();
        let session = build_session(Arc::clone(&context));

        session.connect().expect("connect");
        let states = states_until_ready(&harness, &mut stream).await;

        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Ready
            ]
        );
        assert_eq!(harness.sent_types(), vec!["authorizeCustomer", "recoverThread"]);
        assert_eq!(
            context.access_token().map(|token| token.token),
            Some("token-1".to_owned())
        );
        session.close();
    }

    #[tokio::test]
    async fn failed_recovery_still_reaches_ready() {
        let harness = Harness::single_thread();
        answer_like_backend(&harness, true);
        let context = harness.context();
        let mut stream = context.notifications.subscribe();
        let session = build_session(Arc::clone(&context));

        session.connect().expect("connect");
        let states = states_until_ready(&harness, &mut stream).await;
        assert_eq!(states.last(), Some(&ConnectionState::Ready));
        session.close();
    }

    #[tokio::test]
    async fn close_releases_every_subscription() {
        let harness = Harness::with_config(
            ChannelConfiguration::default(),
            RuntimeConfig {
                dev_mode: true,
                ..RuntimeConfig::default()
            },
        );
        let context = harness.context();
        let session = build_session(Arc::clone(&context));
        assert!(context.lifecycle.observer_count() > 0);

        session.close();

        assert_eq!(context.lifecycle.observer_count(), 0);
        assert_eq!(
            context
                .dispatcher
                .subscriber_count(EventType::CustomerAuthorized),
            0
        );
        assert_eq!(
            context
                .dispatcher
                .error_subscriber_count(ServerErrorKind::SendMessageFailed),
            0
        );
    }
}
