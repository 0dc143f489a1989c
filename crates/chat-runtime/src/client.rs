//! Application-facing entry point: builds a session for one brand channel
//! and keeps a handler for every thread the customer can see.

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak},
};

use chat_core::{
    Cancellable, ChatError, ChatMode, ChatThread, ClientEvent, Clock, Connection,
    CustomField, CustomerIdentity, Environment, ErrorCategory, EventType, FixedRetry,
    NotificationStream, ServerEvent, SystemClock, ThreadState, ThreadSummary,
};
use chat_platform::{ChannelConfiguration, ChatStorage, RemoteService, Transport};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::RuntimeConfig,
    context::{AuthorizationCode, SessionContext, SessionParts, map_remote_error, map_storage_error},
    executor::Executors,
    session::{ChatSession, build_session, trigger_reported},
    thread::{
        LiveChatWelcomeRegistry, ThreadDeps, ThreadHandler, ThreadOrigin, build_thread_handler,
        thread_from_event,
    },
};

/// Process-wide welcome registry used unless the builder is given one.
static WELCOME_REGISTRY: LazyLock<Arc<LiveChatWelcomeRegistry>> =
    LazyLock::new(|| Arc::new(LiveChatWelcomeRegistry::default()));

/// Collects what a [`ChatClient`] needs and connects it.
pub struct ChatClientBuilder {
    brand_id: u64,
    channel_id: String,
    environment: Environment,
    remote: Arc<dyn RemoteService>,
    transport: Arc<dyn Transport>,
    config: RuntimeConfig,
    storage: Option<ChatStorage>,
    clock: Arc<dyn Clock>,
    customer: Option<CustomerIdentity>,
    authorization: Option<AuthorizationCode>,
    welcome_registry: Option<Arc<LiveChatWelcomeRegistry>>,
    configuration_retry: FixedRetry,
}

impl ChatClientBuilder {
    pub fn new(
        brand_id: u64,
        channel_id: impl Into<String>,
        environment: Environment,
        remote: Arc<dyn RemoteService>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            brand_id,
            channel_id: channel_id.into(),
            environment,
            remote,
            transport,
            config: RuntimeConfig::default(),
            storage: None,
            clock: Arc::new(SystemClock),
            customer: None,
            authorization: None,
            welcome_registry: None,
            configuration_retry: FixedRetry::default(),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: ChatStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Act for a known customer instead of the stored or a generated one.
    pub fn customer(mut self, customer: CustomerIdentity) -> Self {
        self.customer = Some(customer);
        self
    }

    pub fn authorization_code(mut self, code: AuthorizationCode) -> Self {
        self.authorization = Some(code);
        self
    }

    pub fn welcome_registry(mut self, registry: Arc<LiveChatWelcomeRegistry>) -> Self {
        self.welcome_registry = Some(registry);
        self
    }

    pub fn configuration_retry(mut self, retry: FixedRetry) -> Self {
        self.configuration_retry = retry;
        self
    }

    /// Fetch the channel configuration, restore or create the visitor and
    /// customer identities, and open the session.
    pub async fn connect(self) -> Result<ChatClient, ChatError> {
        let executors = Executors::current();
        let storage = self.storage.unwrap_or_else(|| {
            ChatStorage::in_memory(format!("{}:{}", self.brand_id, self.channel_id))
        });
        let channel = fetch_channel_configuration(
            &executors,
            &self.remote,
            self.brand_id,
            &self.channel_id,
            self.configuration_retry,
        )
        .await?;
        info!(
            brand_id = self.brand_id,
            channel_id = %self.channel_id,
            multi_thread = channel.is_multi_thread,
            live_chat = channel.is_live_chat,
            "channel configuration loaded"
        );

        let visitor_id = match storage.visitor_id().map_err(map_storage_error)? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                storage.set_visitor_id(id).map_err(map_storage_error)?;
                id
            }
        };
        let customer = match self.customer {
            Some(customer) => customer,
            None => CustomerIdentity::new(
                storage
                    .customer_id()
                    .map_err(map_storage_error)?
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
        };
        storage
            .set_customer_id(&customer.id)
            .map_err(map_storage_error)?;

        let context = SessionContext::new(SessionParts {
            config: self.config,
            channel,
            connection: Connection {
                brand_id: self.brand_id,
                channel_id: self.channel_id,
                customer,
                visitor_id,
                environment: self.environment,
            },
            storage,
            remote: self.remote,
            transport: self.transport,
            executors: executors.clone(),
            clock: self.clock,
            welcome_registry: self
                .welcome_registry
                .unwrap_or_else(|| Arc::clone(&*WELCOME_REGISTRY)),
        });
        context.set_authorization_code(self.authorization);

        let client = ChatClient::new(build_session(context));
        let session = Arc::clone(&client.session);
        let opened = match executors.run_blocking(move || session.connect()).await {
            Ok(result) => result,
            Err(join) => Err(ChatError::internal(join.to_string())),
        };
        match opened {
            Ok(()) => Ok(client),
            Err(err) => {
                client.close();
                Err(err)
            }
        }
    }
}

async fn fetch_channel_configuration(
    executors: &Executors,
    remote: &Arc<dyn RemoteService>,
    brand_id: u64,
    channel_id: &str,
    retry: FixedRetry,
) -> Result<ChannelConfiguration, ChatError> {
    retry
        .run(
            |attempt| {
                let remote = Arc::clone(remote);
                let channel_id = channel_id.to_owned();
                let call = executors
                    .run_blocking(move || remote.channel_configuration(brand_id, &channel_id));
                async move {
                    debug!(attempt, "fetching channel configuration");
                    match call.await {
                        Ok(result) => result.map_err(map_remote_error),
                        Err(join) => Err(ChatError::internal(join.to_string())),
                    }
                }
            },
            ChatError::is_retryable,
        )
        .await
}

struct ClientState {
    deps: ThreadDeps,
    threads: Mutex<HashMap<Uuid, Arc<dyn ThreadHandler>>>,
}

impl ClientState {
    fn threads(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<dyn ThreadHandler>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn adopt_recovered(&self, event: &ServerEvent) {
        let ServerEvent::ThreadRecovered { thread } = event else {
            return;
        };
        let mut threads = self.threads();
        if threads.contains_key(&thread.thread_id) {
            return;
        }
        debug!(thread_id = %thread.thread_id, "adopting recovered thread");
        let handler = build_thread_handler(
            &self.deps,
            thread_from_event(thread.thread_id, event),
            ThreadOrigin::Recovered,
        );
        threads.insert(thread.thread_id, handler);
    }

    fn adopt_listed(&self, summaries: &[ThreadSummary]) {
        let mut threads = self.threads();
        for summary in summaries {
            if threads.contains_key(&summary.thread_id) {
                continue;
            }
            let thread = ChatThread {
                name: summary.name.clone(),
                can_add_more_messages: summary.can_add_more_messages,
                ..ChatThread::pending(summary.thread_id)
            };
            let handler = build_thread_handler(&self.deps, thread, ThreadOrigin::Listed);
            threads.insert(summary.thread_id, handler);
        }
        debug!(count = threads.len(), "thread list applied");
    }
}

/// A connected chat session and the threads it exposes.
pub struct ChatClient {
    session: Arc<dyn ChatSession>,
    state: Arc<ClientState>,
    subscriptions: Cancellable,
}

impl ChatClient {
    fn new(session: Arc<dyn ChatSession>) -> Self {
        let context = session.context();
        let state = Arc::new(ClientState {
            deps: ThreadDeps {
                context: Arc::clone(context),
                events: Arc::clone(&session.events().handler),
            },
            threads: Mutex::new(HashMap::new()),
        });

        let weak: Weak<ClientState> = Arc::downgrade(&state);
        let recovered = context
            .dispatcher
            .subscribe(EventType::ThreadRecovered, move |event| {
                if let Some(state) = weak.upgrade() {
                    state.adopt_recovered(event);
                }
            });
        let weak: Weak<ClientState> = Arc::downgrade(&state);
        let listed = context
            .dispatcher
            .subscribe(EventType::ThreadListFetched, move |event| {
                if let (Some(state), ServerEvent::ThreadListFetched { threads }) =
                    (weak.upgrade(), event)
                {
                    state.adopt_listed(threads);
                }
            });

        Self {
            subscriptions: Cancellable::compound([recovered, listed]),
            state,
            session,
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        self.session.context()
    }

    pub fn mode(&self) -> ChatMode {
        self.context().mode()
    }

    /// Connection state changes and runtime errors.
    pub fn subscribe_notifications(&self) -> NotificationStream {
        self.context().notifications.subscribe()
    }

    pub fn connection(&self) -> Connection {
        self.context().connection()
    }

    pub fn thread(&self, thread_id: Uuid) -> Option<Arc<dyn ThreadHandler>> {
        self.state.threads().get(&thread_id).cloned()
    }

    pub fn threads(&self) -> Vec<Arc<dyn ThreadHandler>> {
        self.state.threads().values().cloned().collect()
    }

    /// Start a new thread, subject to the channel's threading rules.
    pub fn create_thread(&self) -> Result<Arc<dyn ThreadHandler>, ChatError> {
        let context = self.context();
        let mut threads = self.state.threads();
        match context.mode() {
            ChatMode::SingleThread if !threads.is_empty() => {
                return Err(ChatError::new(
                    ErrorCategory::InvalidState,
                    "thread_limit_reached",
                    "single-thread channels allow one thread",
                ));
            }
            ChatMode::LiveChat if !context.is_online() => {
                return Err(ChatError::new(
                    ErrorCategory::InvalidState,
                    "channel_offline",
                    "no agents are online",
                ));
            }
            ChatMode::LiveChat
                if threads
                    .values()
                    .any(|handler| handler.get().state != ThreadState::Closed) =>
            {
                return Err(ChatError::new(
                    ErrorCategory::InvalidState,
                    "open_thread_exists",
                    "finish the open live chat first",
                ));
            }
            _ => {}
        }

        let thread_id = Uuid::new_v4();
        info!(thread_id = %thread_id, "creating thread");
        let handler = build_thread_handler(
            &self.state.deps,
            ChatThread::pending(thread_id),
            ThreadOrigin::Created,
        );
        threads.insert(thread_id, Arc::clone(&handler));
        Ok(handler)
    }

    /// Customer-level custom fields; they also feed welcome templates.
    pub fn set_customer_custom_fields(&self, fields: Vec<CustomField>) {
        self.context().merge_customer_fields(&fields);
        self.trigger(
            ClientEvent::SetCustomerCustomFields { fields },
            "set_customer_custom_fields",
        );
    }

    /// Replace the customer's name on the local connection. Welcome templates
    /// and locally shown messages use it; no event is sent to the backend.
    pub fn set_customer_name(&self, first_name: Option<String>, last_name: Option<String>) {
        let connection = self.connection();
        let customer = CustomerIdentity {
            first_name,
            last_name,
            ..connection.customer.clone()
        };
        self.context()
            .replace_connection(connection.with_customer(customer));
    }

    pub fn page_view_started(&self, uri: impl Into<String>, title: impl Into<String>) {
        self.trigger(
            ClientEvent::PageViewStarted {
                uri: uri.into(),
                title: title.into(),
            },
            "page_view_started",
        );
    }

    pub fn page_view_ended(&self, uri: impl Into<String>, title: impl Into<String>) {
        self.trigger(
            ClientEvent::PageViewEnded {
                uri: uri.into(),
                title: title.into(),
            },
            "page_view_ended",
        );
    }

    pub fn proactive_action_displayed(&self, action_id: Uuid) {
        self.trigger(
            ClientEvent::ProactiveActionDisplayed { action_id },
            "proactive_action_displayed",
        );
    }

    pub fn proactive_action_clicked(&self, action_id: Uuid) {
        self.trigger(
            ClientEvent::ProactiveActionClicked { action_id },
            "proactive_action_clicked",
        );
    }

    pub fn report_conversion(&self, conversion_type: impl Into<String>, value: f64) {
        self.trigger(
            ClientEvent::ConversionReported {
                conversion_type: conversion_type.into(),
                value,
            },
            "report_conversion",
        );
    }

    /// Forget everything stored for this channel and close the session.
    pub fn sign_out(&self) -> Result<(), ChatError> {
        info!("signing out");
        let cleared = self.context().storage.clear().map_err(map_storage_error);
        self.close();
        cleared
    }

    /// Close every thread handler, then the session.
    pub fn close(&self) {
        self.subscriptions.cancel();
        let handlers: Vec<Arc<dyn ThreadHandler>> =
            self.state.threads().drain().map(|(_, handler)| handler).collect();
        for handler in handlers {
            handler.close();
        }
        self.session.close();
    }

    fn trigger(&self, payload: ClientEvent, operation: &'static str) {
        trigger_reported(self.context(), self.session.events(), payload, operation);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chat_core::ServerErrorKind;

    use super::*;
    use crate::test_support::{
        BRAND_ID, CHANNEL_ID, Harness, authorized_frame, connection, error_frame, event_frame,
    };

    fn builder(harness: &Harness) -> ChatClientBuilder {
        ChatClientBuilder::new(
            BRAND_ID,
            CHANNEL_ID,
            connection().environment,
            Arc::clone(&harness.remote) as Arc<dyn RemoteService>,
            Arc::new(harness.transport.clone()) as Arc<dyn Transport>,
        )
        .storage(harness.storage.clone())
        .clock(Arc::clone(&harness.clock) as Arc<dyn Clock>)
        .welcome_registry(Arc::clone(&harness.registry))
        .config(harness.config.clone())
        .configuration_retry(FixedRetry::new(3, Duration::from_millis(5)))
    }

    /// Answers like the backend: authorization always succeeds, recovery
    /// either yields `recovered` or fails, the thread list is `listed`.
    fn backend(harness: &Harness, recovered: Option<Uuid>, listed: Vec<ThreadSummary>) {
        let expires_at_ms = harness.now_ms() + 3_600_000;
        harness.transport.set_responder(move |frame| {
            let request: serde_json::Value = serde_json::from_str(frame).unwrap_or_default();
            match request["type"].as_str() {
                Some("authorizeCustomer" | "reconnectCustomer") => {
                    vec![authorized_frame("token-1", expires_at_ms)]
                }
                Some(kind @ ("recoverThread" | "recoverLiveChat")) => match recovered {
                    Some(thread_id) => vec![
                        serde_json::json!({
                            "type": "threadRecovered",
                            "thread": { "threadId": thread_id, "status": "open" },
                        })
                        .to_string(),
                    ],
                    None if kind == "recoverThread" => vec![error_frame(
                        ServerErrorKind::RecoveringThreadFailed,
                        None,
                        "nothing to recover",
                    )],
                    None => vec![error_frame(
                        ServerErrorKind::RecoveringLivechatFailed,
                        None,
                        "nothing to recover",
                    )],
                },
                Some("fetchThreadList") => vec![event_frame(&ServerEvent::ThreadListFetched {
                    threads: listed.clone(),
                })],
                _ => Vec::new(),
            }
        });
    }

    /// Wait until `request` went out and its reply has been dispatched.
    async fn wait_for_reply(harness: &Harness, client: &ChatClient, request: &str) {
        harness
            .wait_until(|| harness.sent_types().iter().any(|kind| kind == request))
            .await;
        client.context().executors.foreground_idle().await;
    }

    #[tokio::test]
    async fn single_thread_adopts_recovered_thread_and_refuses_a_second() {
        let harness = Harness::single_thread();
        let thread_id = Uuid::from_u128(40);
        backend(&harness, Some(thread_id), Vec::new());

        let client = builder(&harness).connect().await.expect("connect");
        harness.wait_until(|| client.thread(thread_id).is_some()).await;

        let err = client.create_thread().err().expect("limit");
        assert_eq!(err.code, "thread_limit_reached");
        assert_eq!(
            harness.storage.visitor_id().expect("read"),
            Some(client.connection().visitor_id)
        );
        client.close();
    }

    #[tokio::test]
    async fn single_thread_without_history_creates_one() {
        let harness = Harness::single_thread();
        backend(&harness, None, Vec::new());

        let client = builder(&harness).connect().await.expect("connect");
        wait_for_reply(&harness, &client, "recoverThread").await;

        let thread = client.create_thread().expect("first thread");
        assert_eq!(thread.get().state, ThreadState::Pending);
        assert_eq!(client.threads().len(), 1);
        client.close();
    }

    #[tokio::test]
    async fn multi_thread_lists_threads_and_loads_metadata() {
        let harness = Harness::multi_thread();
        let listed = vec![
            ThreadSummary {
                thread_id: Uuid::from_u128(1),
                name: Some("Order 1".into()),
                can_add_more_messages: true,
            },
            ThreadSummary {
                thread_id: Uuid::from_u128(2),
                name: None,
                can_add_more_messages: false,
            },
        ];
        backend(&harness, None, listed);

        let client = builder(&harness).connect().await.expect("connect");
        harness.wait_until(|| client.threads().len() == 2).await;
        harness
            .wait_until(|| {
                harness
                    .sent_types()
                    .iter()
                    .filter(|kind| *kind == "loadThreadMetadata")
                    .count()
                    == 2
            })
            .await;

        let archived = client.thread(Uuid::from_u128(2)).expect("listed");
        assert!(!archived.get().can_add_more_messages);
        client.create_thread().expect("multi-thread allows more");
        assert_eq!(client.threads().len(), 3);
        client.close();
    }

    #[tokio::test]
    async fn offline_live_chat_refuses_new_threads() {
        let harness = Harness::live_chat();
        harness.remote.set_online(false);
        backend(&harness, None, Vec::new());

        let client = builder(&harness).connect().await.expect("connect");
        harness.wait_until(|| !client.context().is_online()).await;

        let err = client.create_thread().err().expect("offline");
        assert_eq!(err.code, "channel_offline");
        client.close();
    }

    #[tokio::test]
    async fn live_chat_allows_one_open_thread() {
        let harness = Harness::live_chat();
        backend(&harness, None, Vec::new());

        let client = builder(&harness).connect().await.expect("connect");
        wait_for_reply(&harness, &client, "recoverLiveChat").await;

        client.create_thread().expect("first live chat");
        let err = client.create_thread().err().expect("one open chat");
        assert_eq!(err.code, "open_thread_exists");
        client.close();
        assert!(harness.registry.is_empty());
    }

    #[tokio::test]
    async fn channel_configuration_is_retried() {
        let harness = Harness::single_thread();
        harness.remote.fail_configurations(2);
        backend(&harness, None, Vec::new());

        let client = builder(&harness).connect().await.expect("connect");
        assert_eq!(harness.remote.configuration_calls(), 3);
        client.close();
    }

    #[tokio::test]
    async fn refused_transport_fails_connect() {
        let harness = Harness::single_thread();
        harness.transport.fail_next_opens(1);

        let err = builder(&harness).connect().await.err().expect("refused");
        assert_eq!(err.code, "connect_failed");
    }

    #[tokio::test]
    async fn analytics_bypass_authorization_delay() {
        let harness = Harness::single_thread();
        let client = builder(&harness).connect().await.expect("connect");

        client.page_view_started("/pricing", "Pricing");
        harness
            .wait_until(|| harness.sent_types().contains(&"pageViewStarted".to_owned()))
            .await;
        client.close();
    }

    #[tokio::test]
    async fn customer_fields_merge_and_are_sent() {
        let harness = Harness::single_thread();
        backend(&harness, None, Vec::new());
        let client = builder(&harness).connect().await.expect("connect");

        client.set_customer_custom_fields(vec![CustomField::new("plan", "pro")]);
        client.set_customer_name(Some("Ada".into()), None);

        assert_eq!(
            client.context().customer_fields(),
            vec![CustomField::new("plan", "pro")]
        );
        assert_eq!(client.connection().display_name().as_deref(), Some("Ada"));
        harness
            .wait_until(|| {
                harness
                    .sent_types()
                    .contains(&"setCustomerCustomFields".to_owned())
            })
            .await;
        client.close();
    }

    #[tokio::test]
    async fn customer_name_stays_local() {
        let harness = Harness::single_thread();
        backend(&harness, None, Vec::new());
        let client = builder(&harness).connect().await.expect("connect");

        client.set_customer_name(Some("Ada".into()), Some("Lovelace".into()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(
            client.connection().display_name().as_deref(),
            Some("Ada Lovelace")
        );
        assert!(
            !harness
                .sent_types()
                .iter()
                .any(|kind| kind.to_lowercase().contains("name")),
            "name is not sent: {:?}",
            harness.sent_types()
        );
        client.close();
    }

    #[tokio::test]
    async fn sign_out_clears_storage_and_closes() {
        let harness = Harness::single_thread();
        backend(&harness, None, Vec::new());
        let client = builder(&harness).connect().await.expect("connect");
        harness
            .wait_until(|| harness.storage.token().ok().flatten().is_some())
            .await;

        client.sign_out().expect("sign out");

        assert_eq!(harness.storage.token().expect("read"), None);
        assert_eq!(harness.storage.visitor_id().expect("read"), None);
        assert!(!harness.transport.is_connected());
    }
}
