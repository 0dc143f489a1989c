use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use chat_core::{
    Cancellable, ChatError, ChatThread, ClientEvent, EventType, Message, MessageContent,
    MessageDirection, ServerEvent, TemplateContext, normalize_background_failure,
    resolve_template,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ArchiveCallback, OutboundMessage, ThreadAction, ThreadDeps, ThreadHandler, ThreadObserver,
    model::{ThreadModel, accepts_messages, local_echo, with_message, without_message},
};
use crate::{executor::Executors, pipeline::TriggerCallbacks};

#[derive(Default)]
struct WelcomeState {
    preparation: Option<Cancellable>,
    placeholder: Option<Message>,
    preparing: bool,
    // Customer messages waiting behind the welcome, in send order.
    held: Option<VecDeque<OutboundMessage>>,
    delivery: Option<Cancellable>,
}

struct Orchestrator {
    deps: ThreadDeps,
    model: Arc<ThreadModel>,
    thread_id: Uuid,
    state: Mutex<WelcomeState>,
    settled: Condvar,
}

/// Where a customer message goes.
enum Route {
    /// Straight to the inner handler.
    Direct(OutboundMessage),
    /// Welcome first; the message is now the head of the outbox.
    WelcomeFirst(Message),
    /// Queued behind an outbox that is already draining.
    Held,
}

impl Orchestrator {
    fn lock(&self) -> MutexGuard<'_, WelcomeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn template(&self) -> Option<String> {
        if let Some(template) = self.deps.context.welcome_template() {
            return Some(template);
        }
        debug!(thread_id = %self.thread_id, "waiting for welcome template");
        let mut updates = self.deps.context.watch_welcome_template();
        let published = updates.wait_for(Option::is_some).await;
        published.ok().and_then(|template| template.clone())
    }

    async fn prepare(&self) {
        let Some(template) = self.template().await else {
            self.stop_preparing();
            return;
        };
        let connection = self.deps.context.connection();
        let customer_fields = self.deps.context.customer_fields();
        let contact_fields = self.model.snapshot().contact_fields;
        let text = resolve_template(
            &template,
            &TemplateContext {
                customer: &connection.customer,
                customer_fields: &customer_fields,
                contact_fields: &contact_fields,
            },
        );
        let placeholder = Message {
            id: Uuid::new_v4(),
            thread_id: self.thread_id,
            direction: MessageDirection::ToClient,
            content: MessageContent::text(text),
            created_at_ms: self.deps.context.clock.now_ms(),
            author_name: None,
            attachments: Vec::new(),
            seen_at_ms: None,
            read_at_ms: None,
        };

        let mut state = self.lock();
        if !state.preparing {
            return;
        }
        state.preparing = false;
        state.preparation = None;
        state.placeholder = Some(placeholder.clone());
        self.model.update(|thread| with_message(thread, placeholder));
        drop(state);
        self.settled.notify_all();
        debug!(thread_id = %self.thread_id, "welcome placeholder ready");
    }

    /// Stop any pending preparation and hand out the placeholder, if any.
    fn take(&self) -> Option<Message> {
        let mut state = self.lock();
        if let Some(preparation) = state.preparation.take() {
            preparation.cancel();
        }
        state.preparing = false;
        let placeholder = state.placeholder.take();
        drop(state);
        self.settled.notify_all();
        placeholder
    }

    /// Decide under one lock whether `message` goes out now, after the
    /// welcome, or behind messages already held for it.
    fn route(&self, message: OutboundMessage) -> Route {
        let mut state = self.lock();
        if let Some(held) = state.held.as_mut() {
            self.stage(&message);
            held.push_back(message);
            return Route::Held;
        }
        if let Some(preparation) = state.preparation.take() {
            preparation.cancel();
        }
        state.preparing = false;
        let route = match state.placeholder.take() {
            Some(placeholder) => {
                self.stage(&message);
                state.held = Some(VecDeque::from([message]));
                Route::WelcomeFirst(placeholder)
            }
            None => Route::Direct(message),
        };
        drop(state);
        self.settled.notify_all();
        route
    }

    /// Show a held message in the thread right away.
    fn stage(&self, message: &OutboundMessage) {
        let local = local_echo(
            self.thread_id,
            message,
            self.deps.context.clock.now_ms(),
            self.deps.context.connection().display_name(),
        );
        self.model.update(|thread| with_message(thread, local));
    }

    /// After the settle delay, hand held messages to `inner` one by one. The
    /// outbox closes only once it is empty, so later sends never overtake.
    async fn deliver(&self, inner: Arc<dyn ThreadHandler>) {
        tokio::time::sleep(self.deps.context.config.welcome_settle_delay).await;
        loop {
            let next = {
                let mut state = self.lock();
                match state.held.as_mut().and_then(VecDeque::pop_front) {
                    Some(message) => message,
                    None => {
                        state.held = None;
                        state.delivery = None;
                        return;
                    }
                }
            };
            if let Err(err) = inner.send(next) {
                self.deps
                    .context
                    .report(normalize_background_failure("send_message", err));
            }
        }
    }

    /// Drop held messages and stop delivering them.
    fn abandon_outbox(&self) {
        let mut state = self.lock();
        if let Some(delivery) = state.delivery.take() {
            delivery.cancel();
        }
        if let Some(held) = state.held.take()
            && !held.is_empty()
        {
            debug!(thread_id = %self.thread_id, held = held.len(), "dropping messages held behind welcome");
        }
    }

    fn stop_preparing(&self) {
        self.lock().preparing = false;
        self.settled.notify_all();
    }

    /// Real messages arrived; the placeholder is no longer wanted.
    fn discard(&self, arrived: Uuid) {
        {
            let state = self.lock();
            let owns = state.placeholder.as_ref().is_some_and(|message| message.id == arrived);
            if owns || (state.placeholder.is_none() && !state.preparing) {
                return;
            }
        }
        if let Some(placeholder) = self.take() {
            self.model
                .update(|thread| without_message(thread, placeholder.id));
            debug!(thread_id = %self.thread_id, "welcome placeholder discarded");
        }
    }
}

/// Greets a freshly created thread without racing the customer's first
/// message.
///
/// A placeholder greeting is prepared in the background from the cached or
/// awaited template. When the customer sends while it is shown, the real
/// welcome goes out first and the customer's messages follow, in order,
/// after a short settle delay; they show in the thread immediately. A send
/// before the placeholder exists cancels the preparation; so do real
/// messages arriving from the backend.
pub struct WelcomeThreadHandler {
    inner: Arc<dyn ThreadHandler>,
    orchestrator: Arc<Orchestrator>,
    messages_watch: Cancellable,
}

impl WelcomeThreadHandler {
    pub fn new(
        inner: Arc<dyn ThreadHandler>,
        deps: ThreadDeps,
        model: Arc<ThreadModel>,
    ) -> Arc<Self> {
        let thread_id = inner.thread_id();
        let orchestrator = Arc::new(Orchestrator {
            deps,
            model,
            thread_id,
            state: Mutex::new(WelcomeState {
                preparing: true,
                ..WelcomeState::default()
            }),
            settled: Condvar::new(),
        });

        let weak = Arc::downgrade(&orchestrator);
        let messages_watch = orchestrator.deps.context.dispatcher.subscribe(
            EventType::MessageCreated,
            move |event| {
                if let ServerEvent::MessageCreated { message } = event
                    && message.thread_id == thread_id
                    && let Some(orchestrator) = weak.upgrade()
                {
                    orchestrator.discard(message.id);
                }
            },
        );

        let preparing = Arc::clone(&orchestrator);
        let preparation = orchestrator
            .deps
            .context
            .executors
            .spawn_background(async move { preparing.prepare().await });
        {
            let mut state = orchestrator.lock();
            if state.preparing {
                state.preparation = Some(preparation);
            }
        }

        Arc::new(Self {
            inner,
            orchestrator,
            messages_watch,
        })
    }

    fn send_welcome(&self, placeholder: Message) {
        let thread_id = self.orchestrator.thread_id;
        let text = match &placeholder.content {
            MessageContent::Text { text, .. } => text.clone(),
            other => format!("{other:?}"),
        };
        info!(thread_id = %thread_id, "sending welcome message ahead of first message");

        let reporter = Arc::clone(&self.orchestrator.deps.context);
        self.orchestrator.deps.events.trigger(
            ClientEvent::SendOutbound {
                thread_id,
                message_id: placeholder.id,
                text,
            }
            .into(),
            TriggerCallbacks::none().on_error(move |err| {
                reporter.report(normalize_background_failure("send_welcome_message", err));
            }),
        );
        self.orchestrator
            .model
            .update(|thread| without_message(thread, placeholder.id));

        let orchestrator = Arc::clone(&self.orchestrator);
        let inner = Arc::clone(&self.inner);
        let delivery = self
            .orchestrator
            .deps
            .context
            .executors
            .spawn_background(async move { orchestrator.deliver(inner).await });
        let mut state = self.orchestrator.lock();
        if state.held.is_some() {
            state.delivery = Some(delivery);
        }
    }
}

impl ThreadHandler for WelcomeThreadHandler {
    fn thread_id(&self) -> Uuid {
        self.inner.thread_id()
    }

    fn get(&self) -> ChatThread {
        // Preparation may need the foreground itself; never park it.
        if Executors::on_foreground() {
            return self.inner.get();
        }
        let grace = self.orchestrator.deps.context.config.snapshot_grace;
        let state = self.orchestrator.lock();
        let (_state, timeout) = self
            .orchestrator
            .settled
            .wait_timeout_while(state, grace, |state| state.preparing)
            .unwrap_or_else(PoisonError::into_inner);
        if timeout.timed_out() {
            debug!(thread_id = %self.orchestrator.thread_id, "welcome still preparing; returning current snapshot");
        }
        self.inner.get()
    }

    fn subscribe(&self, on_update: ThreadObserver) -> Cancellable {
        self.inner.subscribe(on_update)
    }

    fn refresh(&self) -> Result<(), ChatError> {
        self.inner.refresh()
    }

    fn load_more(&self) -> Result<bool, ChatError> {
        self.inner.load_more()
    }

    fn send(&self, message: OutboundMessage) -> Result<Uuid, ChatError> {
        if !accepts_messages(&self.orchestrator.model.snapshot()) {
            return Err(ChatError::thread_archived(self.orchestrator.thread_id));
        }
        let message_id = message.id;
        match self.orchestrator.route(message) {
            Route::Direct(message) => self.inner.send(message),
            Route::WelcomeFirst(placeholder) => {
                self.send_welcome(placeholder);
                Ok(message_id)
            }
            Route::Held => Ok(message_id),
        }
    }

    fn update(&self, action: ThreadAction) -> Result<(), ChatError> {
        self.inner.update(action)
    }

    fn archive(&self, on_complete: ArchiveCallback) -> Result<(), ChatError> {
        self.inner.archive(on_complete)
    }

    fn end_contact(&self) -> Result<(), ChatError> {
        self.inner.end_contact()
    }

    fn close(&self) {
        self.messages_watch.cancel();
        self.orchestrator.take();
        self.orchestrator.abandon_outbox();
        self.inner.close();
    }
}
