use std::sync::{
    Arc, PoisonError, RwLock, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use chat_core::{
    Cancellable, ChatError, ChatMode, ChatNotification, ChatRuntimeError, Clock, Connection,
    ConnectionState, CustomField, ErrorCategory, EventDispatcher, NotificationChannel,
    classify_http_status, merge_custom_fields,
};
use chat_platform::{
    ChannelConfiguration, ChatStorage, RemoteError, RemoteService, StorageError, StoredToken,
    Transport, TransportError,
};
use tokio::sync::watch;
use tracing::warn;

use crate::{config::RuntimeConfig, executor::Executors, thread::LiveChatWelcomeRegistry};

/// Transport lifecycle signal fanned out to session layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Opened,
    Failed(TransportError),
    Closing { code: u16, reason: String },
}

type LifecycleCallback = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Observers of transport lifecycle, in registration order.
#[derive(Default)]
pub struct LifecycleHub {
    next_id: AtomicU64,
    observers: RwLock<Vec<(u64, LifecycleCallback)>>,
}

impl LifecycleHub {
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&LifecycleEvent) + Send + Sync + 'static,
    ) -> Cancellable {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        let weak: Weak<Self> = Arc::downgrade(self);
        Cancellable::new(move || {
            if let Some(hub) = weak.upgrade() {
                hub.observers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(entry, _)| *entry != id);
            }
        })
    }

    pub fn publish(&self, event: &LifecycleEvent) {
        let observers: Vec<LifecycleCallback> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for observer in observers {
            observer(event);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Code exchanged for an access token on channels with authorization
/// enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code: String,
    pub verifier: Option<String>,
}

/// Collaborators handed to a session and everything built on top of it.
pub struct SessionParts {
    pub config: RuntimeConfig,
    pub channel: ChannelConfiguration,
    pub connection: Connection,
    pub storage: ChatStorage,
    pub remote: Arc<dyn RemoteService>,
    pub transport: Arc<dyn Transport>,
    pub executors: Executors,
    pub clock: Arc<dyn Clock>,
    pub welcome_registry: Arc<LiveChatWelcomeRegistry>,
}

/// State shared by every layer of one chat session.
pub struct SessionContext {
    pub config: RuntimeConfig,
    pub channel: ChannelConfiguration,
    pub storage: ChatStorage,
    pub remote: Arc<dyn RemoteService>,
    pub transport: Arc<dyn Transport>,
    pub executors: Executors,
    pub dispatcher: Arc<EventDispatcher>,
    pub notifications: NotificationChannel,
    pub clock: Arc<dyn Clock>,
    pub lifecycle: Arc<LifecycleHub>,
    pub welcome_registry: Arc<LiveChatWelcomeRegistry>,
    connection: RwLock<Connection>,
    customer_fields: RwLock<Vec<CustomField>>,
    authorization_code: RwLock<Option<AuthorizationCode>>,
    welcome_template: watch::Sender<Option<String>>,
    online: AtomicBool,
}

impl SessionContext {
    pub fn new(parts: SessionParts) -> Arc<Self> {
        let cached_template = parts.storage.welcome_template().unwrap_or_else(|err| {
            warn!(error = %err, "cached welcome template unreadable; ignoring");
            None
        });
        let (welcome_template, _) = watch::channel(cached_template);
        Arc::new(Self {
            config: parts.config,
            channel: parts.channel,
            storage: parts.storage,
            remote: parts.remote,
            transport: parts.transport,
            executors: parts.executors,
            dispatcher: EventDispatcher::new(),
            notifications: NotificationChannel::default(),
            clock: parts.clock,
            lifecycle: Arc::new(LifecycleHub::default()),
            welcome_registry: parts.welcome_registry,
            connection: RwLock::new(parts.connection),
            customer_fields: RwLock::new(Vec::new()),
            authorization_code: RwLock::new(None),
            welcome_template,
            online: AtomicBool::new(true),
        })
    }

    pub fn mode(&self) -> ChatMode {
        if self.channel.is_live_chat {
            ChatMode::LiveChat
        } else if self.channel.is_multi_thread {
            ChatMode::MultiThread
        } else {
            ChatMode::SingleThread
        }
    }

    pub fn connection(&self) -> Connection {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap the connection descriptor wholesale.
    pub fn replace_connection(&self, connection: Connection) {
        *self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = connection;
    }

    pub fn customer_fields(&self) -> Vec<CustomField> {
        self.customer_fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn merge_customer_fields(&self, incoming: &[CustomField]) {
        let mut fields = self
            .customer_fields
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *fields = merge_custom_fields(&fields, incoming);
    }

    pub fn authorization_code(&self) -> Option<AuthorizationCode> {
        self.authorization_code
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_authorization_code(&self, code: Option<AuthorizationCode>) {
        *self
            .authorization_code
            .write()
            .unwrap_or_else(PoisonError::into_inner) = code;
    }

    /// Stored access token; unreadable storage counts as no token.
    pub fn access_token(&self) -> Option<StoredToken> {
        self.storage.token().unwrap_or_else(|err| {
            warn!(error = %err, "stored access token unreadable");
            None
        })
    }

    pub fn welcome_template(&self) -> Option<String> {
        self.welcome_template.borrow().clone()
    }

    pub fn watch_welcome_template(&self) -> watch::Receiver<Option<String>> {
        self.welcome_template.subscribe()
    }

    pub fn publish_welcome_template(&self, template: String) {
        self.welcome_template.send_replace(Some(template));
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn emit_state(&self, state: ConnectionState) {
        self.notifications
            .emit(ChatNotification::ConnectionState(state));
    }

    pub fn report(&self, error: ChatRuntimeError) {
        warn!(error = %error, "runtime error");
        self.notifications.emit(ChatNotification::RuntimeError(error));
    }
}

pub fn map_storage_error(err: StorageError) -> ChatError {
    match err {
        StorageError::NotFound => ChatError::new(ErrorCategory::Storage, "not_found", "value not found"),
        StorageError::Malformed { key, reason } => ChatError::new(
            ErrorCategory::Storage,
            "storage_malformed",
            format!("{key}: {reason}"),
        ),
        StorageError::Backend(message) => {
            ChatError::new(ErrorCategory::Storage, "storage_backend", message)
        }
    }
}

pub fn map_remote_error(err: RemoteError) -> ChatError {
    match err {
        RemoteError::Http { status, message } => {
            ChatError::new(classify_http_status(status), format!("http_{status}"), message)
        }
        RemoteError::Network(message) => ChatError::network("remote_unreachable", message),
        RemoteError::Decode(message) => {
            ChatError::new(ErrorCategory::Serialization, "remote_decode", message)
        }
    }
}

pub fn map_transport_error(err: TransportError) -> ChatError {
    match err {
        TransportError::Connect(message) => ChatError::network("connect_failed", message),
        TransportError::NotConnected => {
            ChatError::network("not_connected", "transport is not connected")
        }
        TransportError::Io(message) => ChatError::network("transport_io", message),
    }
}
