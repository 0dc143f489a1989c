use std::sync::Arc;

use chat_core::{Cancellable, ChatError, ServerErrorKind, normalize_server_error};

use super::ChatSession;
use crate::{context::SessionContext, pipeline::EventPipeline};

/// Server errors that no thread can claim are published as runtime errors.
///
/// Thread-scoped errors are left to the thread handlers subscribed for them.
const REPORTED_KINDS: [ServerErrorKind; 9] = [
    ServerErrorKind::SendMessageFailed,
    ServerErrorKind::ArchivingThreadFailed,
    ServerErrorKind::MetadataLoadFailed,
    ServerErrorKind::LoadMoreMessagesFailed,
    ServerErrorKind::FetchThreadListFailed,
    ServerErrorKind::SettingCustomFieldsFailed,
    ServerErrorKind::EndContactFailed,
    ServerErrorKind::InconsistentData,
    ServerErrorKind::Unknown,
];

pub struct ErrorReportingChatSession {
    inner: Arc<dyn ChatSession>,
    subscriptions: Cancellable,
}

impl ErrorReportingChatSession {
    pub fn new(inner: Arc<dyn ChatSession>) -> Self {
        let context = inner.context();
        let subscriptions = REPORTED_KINDS.map(|kind| {
            let reporter = Arc::clone(context);
            context.dispatcher.subscribe_error(kind, move |error| {
                if error.thread_id.is_none() {
                    reporter.report(normalize_server_error(error));
                }
            })
        });
        Self {
            subscriptions: Cancellable::compound(subscriptions),
            inner,
        }
    }
}

impl ChatSession for ErrorReportingChatSession {
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
        self.subscriptions.cancel();
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use chat_core::{ChatNotification, ChatRuntimeError, ServerErrorEvent};
    use uuid::Uuid;

    use super::*;
    use crate::{session::PrimitiveChatSession, test_support::Harness};

    #[tokio::test]
    async fn unrouted_error_is_reported_and_thread_error_is_not() {
        let harness = Harness::multi_thread();
        let context = harness.context();
        let mut stream = context.notifications.subscribe();
        let session = ErrorReportingChatSession::new(Arc::new(PrimitiveChatSession::new(
            Arc::clone(&context),
        )));

        context.dispatcher.dispatch_error(&ServerErrorEvent {
            kind: ServerErrorKind::SendMessageFailed,
            event_id: None,
            thread_id: Some(Uuid::from_u128(1)),
            message: "thread handles this".into(),
        });
        context.dispatcher.dispatch_error(&ServerErrorEvent {
            kind: ServerErrorKind::FetchThreadListFailed,
            event_id: None,
            thread_id: None,
            message: "list unavailable".into(),
        });

        match harness.next_error(&mut stream).await {
            ChatNotification::RuntimeError(ChatRuntimeError::ServerCommunication {
                kind,
                message,
                ..
            }) => {
                assert_eq!(kind, ServerErrorKind::FetchThreadListFailed);
                assert_eq!(message, "list unavailable");
            }
            other => panic!("unexpected notification: {other:?}"),
        }

        session.close();
        assert_eq!(
            context
                .dispatcher
                .error_subscriber_count(ServerErrorKind::Unknown),
            0
        );
    }
}
