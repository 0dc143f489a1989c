use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use url::Url;

/// Close code for a requested shutdown. Any other code is abnormal.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport failure: {0}")]
    Io(String),
}

/// Lifecycle and message callbacks of one duplex connection.
pub trait TransportListener: Send + Sync {
    fn on_open(&self);

    fn on_message(&self, frame: &str);

    fn on_failure(&self, error: &TransportError);

    fn on_closing(&self, code: u16, reason: &str);
}

/// Opaque duplex message channel.
pub trait Transport: Send + Sync {
    /// Start connecting; lifecycle is reported through `listener`.
    fn open(&self, url: &Url, listener: Arc<dyn TransportListener>) -> Result<(), TransportError>;

    fn send(&self, frame: &str) -> Result<(), TransportError>;

    fn close(&self, code: u16, reason: &str);
}

type Responder = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

#[derive(Default)]
struct LoopbackState {
    listener: Option<Arc<dyn TransportListener>>,
    connected: bool,
    opens: u32,
    failing_opens: u32,
    sent: Vec<String>,
    responder: Option<Responder>,
}

/// In-process transport that records outbound frames and lets the caller
/// drive lifecycle and inbound traffic.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `open` fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failing_opens = count;
    }

    /// Answer every sent frame with the frames `responder` returns.
    pub fn set_responder(&self, responder: impl Fn(&str) -> Vec<String> + Send + Sync + 'static) {
        self.lock().responder = Some(Arc::new(responder));
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    pub fn open_count(&self) -> u32 {
        self.lock().opens
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Feed one inbound frame to the listener.
    pub fn deliver(&self, frame: &str) {
        if let Some(listener) = self.listener() {
            listener.on_message(frame);
        }
    }

    pub fn simulate_failure(&self, error: TransportError) {
        let listener = {
            let mut state = self.lock();
            state.connected = false;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_failure(&error);
        }
    }

    pub fn simulate_close(&self, code: u16, reason: &str) {
        let listener = {
            let mut state = self.lock();
            state.connected = false;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_closing(code, reason);
        }
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.lock().listener.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for LoopbackTransport {
    fn open(&self, url: &Url, listener: Arc<dyn TransportListener>) -> Result<(), TransportError> {
        {
            let mut state = self.lock();
            state.opens += 1;
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(TransportError::Connect(format!("{url} refused")));
            }
            state.connected = true;
            state.listener = Some(Arc::clone(&listener));
        }
        listener.on_open();
        Ok(())
    }

    fn send(&self, frame: &str) -> Result<(), TransportError> {
        let (listener, responder) = {
            let mut state = self.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.sent.push(frame.to_owned());
            (state.listener.clone(), state.responder.clone())
        };
        if let (Some(listener), Some(responder)) = (listener, responder) {
            for reply in responder(frame) {
                listener.on_message(&reply);
            }
        }
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        let listener = {
            let mut state = self.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_closing(code, reason);
        }
    }
}
