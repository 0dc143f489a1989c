//! Shared fixtures for the runtime's unit tests.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use chat_core::{
    AccessToken, ChatNotification, Connection, CustomerIdentity, Environment, ManualClock,
    NotificationStream, OutboundEvent, ServerErrorKind, ServerEvent,
};
use chat_platform::{
    AttachmentUpload, ChannelConfiguration, ChatStorage, LoopbackTransport, RemoteError,
    RemoteService, Transport, TransportError, TransportListener,
};
use url::Url;
use uuid::Uuid;

use crate::{
    config::RuntimeConfig,
    context::{SessionContext, SessionParts},
    executor::Executors,
    pipeline::{EventHandler, EventPipeline, TriggerCallbacks},
    thread::{LiveChatWelcomeRegistry, ThreadDeps},
};

pub const BRAND_ID: u64 = 1086;
pub const CHANNEL_ID: &str = "chat_web";
pub const START_MS: u64 = 1_700_000_000_000;

/// Remote service with scripted answers.
#[derive(Default)]
pub struct ScriptedRemote {
    configuration: Mutex<ChannelConfiguration>,
    offline: AtomicBool,
    failing_configurations: AtomicU32,
    failing_uploads: AtomicU32,
    configuration_calls: AtomicU32,
    uploads: Mutex<Vec<String>>,
    payloads: Mutex<HashMap<String, String>>,
    latency: Mutex<Duration>,
}

impl ScriptedRemote {
    pub fn new(configuration: ChannelConfiguration) -> Self {
        Self {
            configuration: Mutex::new(configuration),
            ..Self::default()
        }
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    pub fn fail_configurations(&self, count: u32) {
        self.failing_configurations.store(count, Ordering::SeqCst);
    }

    pub fn fail_uploads(&self, count: u32) {
        self.failing_uploads.store(count, Ordering::SeqCst);
    }

    pub fn configuration_calls(&self) -> u32 {
        self.configuration_calls.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().expect("uploads lock").clone()
    }

    /// Make availability checks and payload fetches block this long.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().expect("latency lock") = latency;
    }

    fn wait_latency(&self) {
        let latency = *self.latency.lock().expect("latency lock");
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
    }

    pub fn add_payload(&self, url: &str, body: &str) {
        self.payloads
            .lock()
            .expect("payloads lock")
            .insert(url.to_owned(), body.to_owned());
    }

    fn consume_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl RemoteService for ScriptedRemote {
    fn channel_configuration(
        &self,
        _brand_id: u64,
        _channel_id: &str,
    ) -> Result<ChannelConfiguration, RemoteError> {
        self.configuration_calls.fetch_add(1, Ordering::SeqCst);
        if Self::consume_failure(&self.failing_configurations) {
            return Err(RemoteError::Http {
                status: 503,
                message: "warming up".into(),
            });
        }
        Ok(*self.configuration.lock().expect("configuration lock"))
    }

    fn channel_availability(&self, _brand_id: u64, _channel_id: &str) -> Result<bool, RemoteError> {
        self.wait_latency();
        Ok(!self.offline.load(Ordering::SeqCst))
    }

    fn upload_attachment(&self, upload: &AttachmentUpload) -> Result<Url, RemoteError> {
        if Self::consume_failure(&self.failing_uploads) {
            return Err(RemoteError::Network("connection reset".into()));
        }
        self.uploads
            .lock()
            .expect("uploads lock")
            .push(upload.file_name.clone());
        Url::parse("https://files.example.test/")
            .and_then(|base| base.join(&upload.file_name))
            .map_err(|err| RemoteError::Decode(err.to_string()))
    }

    fn fetch_payload(&self, url: &Url) -> Result<String, RemoteError> {
        self.wait_latency();
        self.payloads
            .lock()
            .expect("payloads lock")
            .get(url.as_str())
            .cloned()
            .ok_or(RemoteError::Http {
                status: 404,
                message: format!("no payload at {url}"),
            })
    }
}

/// Event handler that records what it is asked to send.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<OutboundEvent>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<OutboundEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events()
            .iter()
            .map(|event| event.payload.kind())
            .collect()
    }
}

impl EventHandler for RecordingHandler {
    fn trigger(&self, event: OutboundEvent, callbacks: TriggerCallbacks) {
        self.events.lock().expect("events lock").push(event);
        callbacks.sent();
    }
}

struct IgnoringListener;

impl TransportListener for IgnoringListener {
    fn on_open(&self) {}
    fn on_message(&self, _frame: &str) {}
    fn on_failure(&self, _error: &TransportError) {}
    fn on_closing(&self, _code: u16, _reason: &str) {}
}

pub fn connection() -> Connection {
    Connection {
        brand_id: BRAND_ID,
        channel_id: CHANNEL_ID.into(),
        customer: CustomerIdentity::new("customer-7"),
        visitor_id: Uuid::from_u128(9),
        environment: Environment {
            socket_url: "wss://chat.example.test/ws".into(),
            chat_url: "https://chat.example.test".into(),
        },
    }
}

/// Wire frame carrying `event`.
pub fn event_frame(event: &ServerEvent) -> String {
    serde_json::to_string(event).expect("server event serializes")
}

pub fn authorized_frame(token: &str, expires_at_ms: u64) -> String {
    event_frame(&ServerEvent::CustomerAuthorized {
        access_token: AccessToken {
            token: token.to_owned(),
            expires_at_ms,
        },
        customer: None,
    })
}

/// Error frame as the backend sends it.
pub fn error_frame(kind: ServerErrorKind, thread_id: Option<Uuid>, message: &str) -> String {
    serde_json::json!({
        "type": "error",
        "kind": kind,
        "threadId": thread_id,
        "message": message,
    })
    .to_string()
}

/// One session's worth of collaborators with a lazily built context.
pub struct Harness {
    pub transport: LoopbackTransport,
    pub remote: Arc<ScriptedRemote>,
    pub storage: ChatStorage,
    pub clock: Arc<ManualClock>,
    pub recorder: Arc<RecordingHandler>,
    pub registry: Arc<LiveChatWelcomeRegistry>,
    pub config: RuntimeConfig,
    pub channel: ChannelConfiguration,
    context: OnceLock<Arc<SessionContext>>,
}

impl Harness {
    pub fn single_thread() -> Self {
        Self::with_config(ChannelConfiguration::default(), RuntimeConfig::default())
    }

    pub fn multi_thread() -> Self {
        Self::with_config(
            ChannelConfiguration {
                is_multi_thread: true,
                ..ChannelConfiguration::default()
            },
            RuntimeConfig::default(),
        )
    }

    pub fn live_chat() -> Self {
        Self::with_config(
            ChannelConfiguration {
                is_live_chat: true,
                ..ChannelConfiguration::default()
            },
            RuntimeConfig::default(),
        )
    }

    pub fn with_config(channel: ChannelConfiguration, config: RuntimeConfig) -> Self {
        Self {
            transport: LoopbackTransport::new(),
            remote: Arc::new(ScriptedRemote::new(channel)),
            storage: ChatStorage::in_memory("test"),
            clock: Arc::new(ManualClock::new(START_MS)),
            recorder: Arc::new(RecordingHandler::default()),
            registry: Arc::new(LiveChatWelcomeRegistry::default()),
            config,
            channel,
            context: OnceLock::new(),
        }
    }

    /// Collaborators for a session; building more than one context shares
    /// transport, storage, clock and registry.
    pub fn parts(&self) -> SessionParts {
        SessionParts {
            config: self.config.clone(),
            channel: self.channel,
            connection: connection(),
            storage: self.storage.clone(),
            remote: Arc::clone(&self.remote) as Arc<dyn RemoteService>,
            transport: Arc::new(self.transport.clone()),
            executors: Executors::current(),
            clock: Arc::clone(&self.clock) as Arc<dyn chat_core::Clock>,
            welcome_registry: Arc::clone(&self.registry),
        }
    }

    /// Context built on first use, so storage seeded before then is seen.
    pub fn context(&self) -> Arc<SessionContext> {
        Arc::clone(
            self.context
                .get_or_init(|| SessionContext::new(self.parts())),
        )
    }

    /// Thread dependencies backed by the full event pipeline.
    pub fn deps(&self) -> ThreadDeps {
        let context = self.context();
        let pipeline = EventPipeline::build(&context);
        pipeline.auth_delay.flush(true);
        ThreadDeps {
            context,
            events: pipeline.handler,
        }
    }

    /// Thread dependencies that only record triggered events.
    pub fn recording_deps(&self) -> ThreadDeps {
        ThreadDeps {
            context: self.context(),
            events: Arc::clone(&self.recorder) as Arc<dyn EventHandler>,
        }
    }

    pub fn recorded_events(&self) -> Vec<OutboundEvent> {
        self.recorder.events()
    }

    pub fn recorded_kinds(&self) -> Vec<&'static str> {
        self.recorder.kinds()
    }

    pub fn now_ms(&self) -> u64 {
        chat_core::Clock::now_ms(self.clock.as_ref())
    }

    pub fn open_transport(&self) {
        let url = Url::parse(&connection().environment.socket_url).expect("socket url");
        self.transport
            .open(&url, Arc::new(IgnoringListener))
            .expect("loopback opens");
    }

    pub fn sent_events(&self) -> Vec<serde_json::Value> {
        self.transport
            .sent_frames()
            .iter()
            .map(|frame| serde_json::from_str(frame).expect("sent frame is JSON"))
            .collect()
    }

    /// Wire `type` of every sent frame.
    pub fn sent_types(&self) -> Vec<String> {
        self.sent_events()
            .iter()
            .map(|frame| frame["type"].as_str().unwrap_or_default().to_owned())
            .collect()
    }

    pub async fn wait_for_frames(&self, count: usize) {
        self.wait_until(|| self.transport.sent_frames().len() >= count)
            .await;
    }

    /// Poll `condition` until it holds; panics after five seconds.
    pub async fn wait_until(&self, mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    pub async fn next_notification(&self, stream: &mut NotificationStream) -> ChatNotification {
        tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("notification in time")
            .expect("notification channel open")
    }

    /// Next notification that is not a connection-state change.
    pub async fn next_error(&self, stream: &mut NotificationStream) -> ChatNotification {
        loop {
            let notification = self.next_notification(stream).await;
            if matches!(notification, ChatNotification::RuntimeError(_)) {
                return notification;
            }
        }
    }
}
