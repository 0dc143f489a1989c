use std::sync::{Arc, Weak};

use chat_core::{Cancellable, ChatError};
use tracing::debug;

use super::ChatSession;
use crate::{
    context::{LifecycleEvent, SessionContext},
    pipeline::EventPipeline,
    reconnect::{ConnectFn, ReconnectPhase, ReconnectionManager},
};

/// Feeds transport lifecycle into a [`ReconnectionManager`] that re-opens
/// the inner session after an unexpected drop.
pub struct ReconnectingChatSession {
    inner: Arc<dyn ChatSession>,
    manager: Arc<ReconnectionManager>,
    lifecycle: Cancellable,
}

impl ReconnectingChatSession {
    pub fn new(inner: Arc<dyn ChatSession>) -> Arc<Self> {
        let context = Arc::clone(inner.context());
        let target: Weak<dyn ChatSession> = Arc::downgrade(&inner);
        let connect: ConnectFn = Arc::new(move || match target.upgrade() {
            Some(session) => session.connect(),
            None => Err(ChatError::invalid_state("Closed", "reconnect")),
        });
        let manager = ReconnectionManager::new(
            context.config.reconnect,
            connect,
            context.executors.clone(),
            context.notifications.clone(),
        );

        let observed = Arc::downgrade(&manager);
        let lifecycle = context.lifecycle.subscribe(move |event| {
            let Some(manager) = observed.upgrade() else {
                return;
            };
            match event {
                LifecycleEvent::Opened => manager.on_connected(),
                LifecycleEvent::Failed(error) => {
                    debug!(error = %error, "transport failed");
                    manager.on_failure();
                }
                LifecycleEvent::Closing { code, .. } => manager.on_closing(*code),
            }
        });

        Arc::new(Self {
            inner,
            manager,
            lifecycle,
        })
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.manager.phase()
    }
}

impl ChatSession for ReconnectingChatSession {
    fn context(&self) -> &Arc<SessionContext> {
        self.inner.context()
    }

    fn events(&self) -> &EventPipeline {
        self.inner.events()
    }

    fn connect(&self) -> Result<(), ChatError> {
        let result = self.inner.connect();
        if result.is_err() {
            self.manager.on_failure();
        }
        result
    }

    fn close(&self) {
        self.manager.close();
        self.lifecycle.cancel();
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chat_core::{ChatNotification, ConnectionState, NotificationStream, ReconnectPolicy};
    use chat_platform::{ChannelConfiguration, NORMAL_CLOSURE, TransportError};

    use super::*;
    use crate::{config::RuntimeConfig, session::PrimitiveChatSession, test_support::Harness};

    fn session(harness: &Harness) -> Arc<ReconnectingChatSession> {
        ReconnectingChatSession::new(Arc::new(PrimitiveChatSession::new(harness.context())))
    }

    fn fast_harness() -> Harness {
        Harness::with_config(
            ChannelConfiguration::default(),
            RuntimeConfig {
                reconnect: ReconnectPolicy::new(5, 0, 0, 20, 3),
                ..RuntimeConfig::default()
            },
        )
    }

    async fn wait_for_state(
        harness: &Harness,
        stream: &mut NotificationStream,
        wanted: ConnectionState,
    ) {
        loop {
            if harness.next_notification(stream).await == ChatNotification::ConnectionState(wanted)
            {
                return;
            }
        }
    }

    #[tokio::test]
    async fn first_connect_failure_gives_up_immediately() {
        let harness = fast_harness();
        harness.transport.fail_next_opens(1);
        let mut stream = harness.context().notifications.subscribe();
        let session = session(&harness);

        session.connect().expect_err("refused");

        wait_for_state(&harness, &mut stream, ConnectionState::UnexpectedDisconnect).await;
        assert_eq!(session.phase(), ReconnectPhase::GivenUp);
        assert_eq!(harness.transport.open_count(), 1);
    }

    #[tokio::test]
    async fn drop_after_connect_reopens_transport() {
        let harness = fast_harness();
        let mut stream = harness.context().notifications.subscribe();
        let session = session(&harness);

        session.connect().expect("connect");
        wait_for_state(&harness, &mut stream, ConnectionState::Connected).await;
        harness.context().executors.foreground_idle().await;
        assert_eq!(session.phase(), ReconnectPhase::Connected);

        harness
            .transport
            .simulate_failure(TransportError::Io("reset by peer".into()));
        wait_for_state(&harness, &mut stream, ConnectionState::Reconnecting).await;
        wait_for_state(&harness, &mut stream, ConnectionState::Connected).await;
        harness.context().executors.foreground_idle().await;

        assert_eq!(harness.transport.open_count(), 2);
        assert_eq!(session.phase(), ReconnectPhase::Connected);
    }

    #[tokio::test]
    async fn normal_close_does_not_reconnect() {
        let harness = fast_harness();
        let session = session(&harness);
        session.connect().expect("connect");
        harness.context().executors.foreground_idle().await;

        harness.transport.simulate_close(NORMAL_CLOSURE, "bye");
        harness.context().executors.foreground_idle().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(session.phase(), ReconnectPhase::Disconnected);
        assert_eq!(harness.transport.open_count(), 1);
    }

    #[tokio::test]
    async fn close_stops_pending_attempts() {
        let harness = fast_harness();
        let session = session(&harness);
        session.connect().expect("connect");
        harness.context().executors.foreground_idle().await;

        harness.transport.fail_next_opens(5);
        harness.transport.simulate_close(4000, "server restart");
        harness.context().executors.foreground_idle().await;
        session.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(session.phase(), ReconnectPhase::Closed);
        assert_eq!(harness.transport.open_count(), 1);
        assert_eq!(harness.context().lifecycle.observer_count(), 0);
    }
}
