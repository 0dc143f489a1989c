use std::sync::Arc;

use chat_core::{
    Cancellable, ChatError, ErrorCategory, EventType, InboundFrame, ServerEvent,
    decode_inbound_frame, normalize_background_failure,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::ChatSession;
use crate::{
    context::{SessionContext, map_remote_error},
    pipeline::EventPipeline,
};

const OPERATION: &str = "fetch_external_payload";

/// Resolves events whose body was too large to send inline: the referenced
/// document is fetched and dispatched as if it had arrived on the socket.
pub struct RemotePayloadChatSession {
    inner: Arc<dyn ChatSession>,
    subscription: Cancellable,
    // Cancelled on close; in-flight fetches then drop their result.
    closed: CancellationToken,
}

impl RemotePayloadChatSession {
    pub fn new(inner: Arc<dyn ChatSession>) -> Self {
        let context = Arc::clone(inner.context());
        let session = Arc::clone(&context);
        let closed = CancellationToken::new();
        let fetches = closed.clone();
        let subscription = context
            .dispatcher
            .subscribe(EventType::ExternalPayload, move |event| {
                if let ServerEvent::ExternalPayload { url } = event {
                    resolve(&session, url, fetches.clone());
                }
            });
        Self {
            inner,
            subscription,
            closed,
        }
    }
}

fn resolve(context: &Arc<SessionContext>, url: &str, closed: CancellationToken) {
    let url = match Url::parse(url) {
        Ok(url) => url,
        Err(err) => {
            context.report(normalize_background_failure(
                OPERATION,
                ChatError::new(ErrorCategory::Serialization, "invalid_payload_url", err.to_string()),
            ));
            return;
        }
    };
    debug!(url = %url, "fetching external payload");

    let executors = context.executors.clone();
    let context = Arc::clone(context);
    let _fetch = executors.spawn_background(async move {
        let remote = Arc::clone(&context.remote);
        let fetched = tokio::select! {
            _ = closed.cancelled() => return,
            fetched = context.executors.run_blocking(move || remote.fetch_payload(&url)) => fetched,
        };
        if closed.is_cancelled() {
            debug!("session closed; dropping external payload");
            return;
        }
        let body = match fetched {
            Ok(Ok(body)) => body,
            Ok(Err(err)) => {
                context.report(normalize_background_failure(OPERATION, map_remote_error(err)));
                return;
            }
            Err(join) => {
                warn!(error = %join, "payload fetch aborted");
                return;
            }
        };

        match decode_inbound_frame(&body) {
            Ok(InboundFrame::Event(ServerEvent::ExternalPayload { .. })) => {
                context.report(normalize_background_failure(
                    OPERATION,
                    ChatError::new(
                        ErrorCategory::Serialization,
                        "nested_external_payload",
                        "external payload points at another external payload",
                    ),
                ));
            }
            Ok(frame) => {
                let dispatcher = Arc::clone(&context.dispatcher);
                context.executors.post_foreground(move || match frame {
                    InboundFrame::Event(event) => {
                        dispatcher.dispatch(&event);
                    }
                    InboundFrame::Error(error) => {
                        dispatcher.dispatch_error(&error);
                    }
                });
            }
            Err(err) => context.report(normalize_background_failure(OPERATION, err)),
        }
    });
}

impl ChatSession for RemotePayloadChatSession {
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
        self.closed.cancel();
        self.inner.close();
    }
}
