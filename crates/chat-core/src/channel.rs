use tokio::sync::broadcast;

use crate::{error::ChatRuntimeError, types::ConnectionState};

/// Application-facing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatNotification {
    /// The connection moved to a new state.
    ConnectionState(ConnectionState),
    /// A failure that has no call site to return to.
    RuntimeError(ChatRuntimeError),
}

/// Broadcast stream type used by application subscribers.
pub type NotificationStream = broadcast::Receiver<ChatNotification>;

/// Fan-out channel for connection state and runtime errors.
#[derive(Clone, Debug)]
pub struct NotificationChannel {
    tx: broadcast::Sender<ChatNotification>,
}

impl NotificationChannel {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    /// Subscribe to emitted notifications.
    pub fn subscribe(&self) -> NotificationStream {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<ChatNotification> {
        self.tx.clone()
    }

    /// Emit to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, notification: ChatNotification) {
        let _ = self.tx.send(notification);
    }

    pub fn emit_state(&self, state: ConnectionState) {
        self.emit(ChatNotification::ConnectionState(state));
    }

    pub fn emit_error(&self, error: ChatRuntimeError) {
        self.emit(ChatNotification::RuntimeError(error));
    }
}

impl Default for NotificationChannel {
    fn default() -> Self {
        Self::new(64)
    }
}
