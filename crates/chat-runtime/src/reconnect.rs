//! Reconnection after an established connection drops.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chat_core::{
    Backoff, Cancellable, ChatError, ConnectionState, NotificationChannel, ReconnectPolicy,
};
use chat_platform::NORMAL_CLOSURE;
use rand::{SeedableRng, rngs::StdRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::Executors;

/// Reconnect function supplied by the session; blocks until the transport
/// open call returns.
pub type ConnectFn = Arc<dyn Fn() -> Result<(), ChatError> + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    NeverConnected,
    Connected,
    /// Closed normally; nothing is scheduled.
    Disconnected,
    Reconnecting,
    /// Attempts exhausted, or the first connect failed.
    GivenUp,
    /// The manager was closed.
    Closed,
}

struct ReconnectState {
    phase: ReconnectPhase,
    ever_connected: bool,
    backoff: Backoff,
    rng: StdRng,
    pending: Option<Cancellable>,
    generation: u64,
}

/// Watches the transport lifecycle and re-opens the connection with
/// exponential backoff.
///
/// At most one attempt is outstanding; a new failure cancels the previous
/// one before scheduling its own.
pub struct ReconnectionManager {
    connect: ConnectFn,
    executors: Executors,
    notifications: NotificationChannel,
    state: Mutex<ReconnectState>,
    weak: Weak<Self>,
}

impl ReconnectionManager {
    pub fn new(
        policy: ReconnectPolicy,
        connect: ConnectFn,
        executors: Executors,
        notifications: NotificationChannel,
    ) -> Arc<Self> {
        Self::with_rng(policy, connect, executors, notifications, StdRng::from_os_rng())
    }

    pub fn with_rng(
        policy: ReconnectPolicy,
        connect: ConnectFn,
        executors: Executors,
        notifications: NotificationChannel,
        rng: StdRng,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            connect,
            executors,
            notifications,
            state: Mutex::new(ReconnectState {
                phase: ReconnectPhase::NeverConnected,
                ever_connected: false,
                backoff: Backoff::new(policy),
                rng,
                pending: None,
                generation: 0,
            }),
            weak: weak.clone(),
        })
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.lock().phase
    }

    /// Attempts scheduled since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.lock().backoff.attempt()
    }

    pub fn has_pending_attempt(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub fn on_connected(&self) {
        let mut state = self.lock();
        if state.phase == ReconnectPhase::Closed {
            return;
        }
        if state.ever_connected {
            info!(attempts = state.backoff.attempt(), "reconnected");
        }
        state.phase = ReconnectPhase::Connected;
        state.ever_connected = true;
        state.backoff.reset();
        Self::cancel_pending(&mut state);
    }

    /// Transport failure or failed connect attempt.
    pub fn on_failure(&self) {
        let mut state = self.lock();
        match state.phase {
            ReconnectPhase::Closed | ReconnectPhase::Disconnected => return,
            _ if !state.ever_connected => {
                warn!("connection failed before it was ever established; not retrying");
                state.phase = ReconnectPhase::GivenUp;
                drop(state);
                self.notifications
                    .emit_state(ConnectionState::UnexpectedDisconnect);
                return;
            }
            _ => {}
        }
        self.schedule(state);
    }

    pub fn on_closing(&self, code: u16) {
        if code != NORMAL_CLOSURE {
            debug!(code, "abnormal close");
            self.on_failure();
            return;
        }
        let mut state = self.lock();
        if state.phase != ReconnectPhase::Closed {
            state.phase = ReconnectPhase::Disconnected;
        }
        Self::cancel_pending(&mut state);
    }

    /// Stop reconnecting; cancels the pending timer and ignores an in-flight
    /// connect call.
    pub fn close(&self) {
        let mut state = self.lock();
        state.phase = ReconnectPhase::Closed;
        Self::cancel_pending(&mut state);
    }

    fn schedule(&self, mut state: MutexGuard<'_, ReconnectState>) {
        Self::cancel_pending(&mut state);
        let inner = &mut *state;
        let Some(delay) = inner.backoff.next(&mut inner.rng) else {
            warn!(attempts = inner.backoff.attempt(), "reconnect attempts exhausted");
            inner.phase = ReconnectPhase::GivenUp;
            drop(state);
            self.notifications
                .emit_state(ConnectionState::UnexpectedDisconnect);
            return;
        };

        inner.phase = ReconnectPhase::Reconnecting;
        inner.generation += 1;
        let generation = inner.generation;
        let attempt = inner.backoff.attempt();
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak = self.weak.clone();
        let connect = Arc::clone(&self.connect);
        let executors = self.executors.clone();
        let task = self.executors.spawn_background(async move {
            tokio::select! {
                _ = cancelled.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let result = executors.run_blocking(move || connect()).await;
            if cancelled.is_cancelled() {
                return;
            }
            let Some(manager) = weak.upgrade() else {
                return;
            };
            manager.finish_attempt(generation, result);
        });
        state.pending = Some(Cancellable::compound([Cancellable::new(move || token.cancel()), task]));
        drop(state);
        self.notifications.emit_state(ConnectionState::Reconnecting);
    }

    fn finish_attempt(
        &self,
        generation: u64,
        result: Result<Result<(), ChatError>, tokio::task::JoinError>,
    ) {
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.pending = None;
        }
        match result {
            Ok(Ok(())) => debug!(generation, "reconnect call returned"),
            Ok(Err(err)) => {
                warn!(error = %err, "reconnect attempt failed");
                self.on_failure();
            }
            Err(join) => {
                warn!(error = %join, "reconnect call aborted");
                self.on_failure();
            }
        }
    }

    fn cancel_pending(state: &mut ReconnectState) {
        if let Some(pending) = state.pending.take() {
            pending.cancel();
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReconnectState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
