use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chat_core::{
    Cancellable, ChatError, ChatMode, ClientEvent, ConnectionState, EventType, ServerErrorKind,
    normalize_background_failure,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChatSession, trigger_reported};
use crate::{
    context::{SessionContext, map_remote_error},
    pipeline::EventPipeline,
};

/// Decides what "ready" means for the channel's threading mode once the
/// customer is authorized.
///
/// - single thread: recover the one thread, ready when recovery settles
/// - multi thread: ready at once, then fetch the thread list
/// - live chat: ask whether agents are online; recover the live chat if so,
///   otherwise report the channel offline
pub struct ThreadModeChatSession {
    inner: Arc<dyn ChatSession>,
    subscriptions: Cancellable,
    closed: CancellationToken,
}

struct ModeState {
    context: Arc<SessionContext>,
    events: EventPipeline,
    awaiting_recovery: AtomicBool,
    closed: CancellationToken,
}

impl ModeState {
    fn on_authorized(self: &Arc<Self>) {
        match self.context.mode() {
            ChatMode::SingleThread => self.recover(ClientEvent::RecoverThread { thread_id: None }),
            ChatMode::MultiThread => {
                self.context.emit_state(ConnectionState::Ready);
                trigger_reported(
                    &self.context,
                    &self.events,
                    ClientEvent::FetchThreadList,
                    "fetch_thread_list",
                );
            }
            ChatMode::LiveChat => self.check_availability(),
        }
    }

    fn recover(&self, payload: ClientEvent) {
        self.awaiting_recovery.store(true, Ordering::Release);
        let operation = payload.kind();
        trigger_reported(&self.context, &self.events, payload, operation);
    }

    /// Availability is an HTTP call; it runs on the background context.
    fn check_availability(self: &Arc<Self>) {
        let state = Arc::clone(self);
        let context = Arc::clone(&self.context);
        let closed = self.closed.clone();
        let _check = self.context.executors.spawn_background(async move {
            let remote = Arc::clone(&context.remote);
            let connection = context.connection();
            let online = tokio::select! {
                _ = closed.cancelled() => return,
                online = context.executors.run_blocking(move || {
                    remote.channel_availability(connection.brand_id, &connection.channel_id)
                }) => online,
            };
            if closed.is_cancelled() {
                debug!("session closed; ignoring availability answer");
                return;
            }
            let online = match online {
                Ok(Ok(online)) => online,
                Ok(Err(err)) => {
                    context.report(normalize_background_failure(
                        "channel_availability",
                        map_remote_error(err),
                    ));
                    false
                }
                Err(join) => {
                    warn!(error = %join, "availability check aborted");
                    false
                }
            };
            context.set_online(online);
            if online {
                state.recover(ClientEvent::RecoverLiveChat { thread_id: None });
            } else {
                info!("live chat offline");
                context.emit_state(ConnectionState::Offline);
            }
        });
    }

    /// Recovery answered, successfully or not.
    fn on_recovery_settled(&self) {
        if self.awaiting_recovery.swap(false, Ordering::AcqRel) {
            self.context.emit_state(ConnectionState::Ready);
        }
    }
}

impl ThreadModeChatSession {
    pub fn new(inner: Arc<dyn ChatSession>) -> Self {
        let context = Arc::clone(inner.context());
        let state = Arc::new(ModeState {
            context: Arc::clone(&context),
            events: inner.events().clone(),
            awaiting_recovery: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });

        let authorized = {
            let state = Arc::clone(&state);
            context
                .dispatcher
                .subscribe(EventType::CustomerAuthorized, move |_| state.on_authorized())
        };
        let recovered = {
            let state = Arc::clone(&state);
            context
                .dispatcher
                .subscribe(EventType::ThreadRecovered, move |_| state.on_recovery_settled())
        };
        let recovery_failed = [
            ServerErrorKind::RecoveringThreadFailed,
            ServerErrorKind::RecoveringLivechatFailed,
        ]
        .map(|kind| {
            let state = Arc::clone(&state);
            context
                .dispatcher
                .subscribe_error(kind, move |_| state.on_recovery_settled())
        });

        Self {
            inner,
            subscriptions: Cancellable::compound(
                [authorized, recovered].into_iter().chain(recovery_failed),
            ),
            closed: state.closed.clone(),
        }
    }
}

impl ChatSession for ThreadModeChatSession {
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
        self.closed.cancel();
        self.inner.close();
    }
}
