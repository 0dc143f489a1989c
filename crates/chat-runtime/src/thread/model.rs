use std::sync::{
    Arc, Mutex, PoisonError, RwLock, Weak,
    atomic::{AtomicU64, Ordering},
};

use chat_core::{
    Cancellable, CaseStatus, ChatThread, Message, MessageDirection, ServerEvent, ThreadState,
    ThreadStateMachine, ThreadTransition, Timeline, TimelineOp, merge_custom_fields,
};
use tracing::{debug, trace};

use crate::executor::Executors;

type ThreadObserver = Arc<dyn Fn(&ChatThread) + Send + Sync>;

/// Mutable record of one thread.
///
/// Every mutation replaces the whole record under the mutex. Observers get
/// a snapshot on the foreground context, once per effective change, after
/// the mutex is released.
pub struct ThreadModel {
    state: Mutex<ChatThread>,
    next_observer: AtomicU64,
    observers: RwLock<Vec<(u64, ThreadObserver)>>,
    executors: Executors,
}

impl ThreadModel {
    pub fn new(thread: ChatThread, executors: Executors) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(thread),
            next_observer: AtomicU64::new(0),
            observers: RwLock::new(Vec::new()),
            executors,
        })
    }

    pub fn snapshot(&self) -> ChatThread {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the record with `change(current)`. Returns whether it changed.
    pub fn update(&self, change: impl FnOnce(&ChatThread) -> ChatThread) -> bool {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let next = change(&state);
            if next == *state {
                return false;
            }
            *state = next;
            state.clone()
        };
        self.notify(snapshot);
        true
    }

    /// Merge one inbound event. Returns whether the record changed.
    pub fn apply(&self, event: &ServerEvent) -> bool {
        self.update(|thread| apply_event(thread, event))
    }

    pub fn subscribe(
        self: &Arc<Self>,
        observer: impl Fn(&ChatThread) + Send + Sync + 'static,
    ) -> Cancellable {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(observer)));
        let weak: Weak<Self> = Arc::downgrade(self);
        Cancellable::new(move || {
            if let Some(model) = weak.upgrade() {
                model
                    .observers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(entry, _)| *entry != id);
            }
        })
    }

    fn notify(&self, snapshot: ChatThread) {
        let observers: Vec<ThreadObserver> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        if observers.is_empty() {
            return;
        }
        trace!(thread_id = %snapshot.id, observers = observers.len(), "thread changed");
        self.executors.post_foreground(move || {
            for observer in observers {
                observer(&snapshot);
            }
        });
    }
}

/// Apply the merge rules for `event` to `thread`, returning the new record.
pub fn apply_event(thread: &ChatThread, event: &ServerEvent) -> ChatThread {
    let mut next = thread.clone();
    let mut machine = ThreadStateMachine::new(thread.state);

    match event {
        ServerEvent::MessageCreated { message } => {
            merge_messages(&mut next, TimelineOp::Merge(vec![message.clone()]));
        }
        ServerEvent::MoreMessagesLoaded {
            messages,
            scroll_token,
            ..
        } => {
            merge_messages(&mut next, TimelineOp::PrependOlder(messages.clone()));
            next.scroll_token = scroll_token.clone();
        }
        ServerEvent::MessageReadChanged {
            message_id,
            seen_at_ms,
            read_at_ms,
            ..
        } => {
            merge_messages(
                &mut next,
                TimelineOp::PatchStatus {
                    message_id: *message_id,
                    seen_at_ms: *seen_at_ms,
                    read_at_ms: *read_at_ms,
                },
            );
        }
        ServerEvent::AgentTyping { is_typing, .. } => {
            if let Some(agent) = next.agent.as_mut() {
                agent.is_typing = *is_typing;
            }
        }
        ServerEvent::AssignedAgentChanged { agent, .. } => {
            next.agent = agent.clone();
            next.position_in_queue = None;
            machine.apply(ThreadTransition::AssigneeChanged);
        }
        ServerEvent::QueuePositionChanged {
            position,
            has_online_agent,
            ..
        } => {
            next.position_in_queue = Some(*position);
            next.has_online_agent = *has_online_agent;
        }
        ServerEvent::CaseStatusChanged {
            contact_id, status, ..
        } => {
            if contact_id.is_some() {
                next.contact_id = contact_id.clone();
            }
            if *status == CaseStatus::Closed {
                next.can_add_more_messages = false;
            }
            machine.apply(ThreadTransition::StatusChanged(*status));
        }
        ServerEvent::ThreadRecovered { thread: recovered } => {
            merge_messages(&mut next, TimelineOp::Merge(recovered.messages.clone()));
            next.scroll_token = recovered.scroll_token.clone();
            if recovered.name.is_some() {
                next.name = recovered.name.clone();
            }
            next.agent = recovered.agent.clone();
            if recovered.contact_id.is_some() {
                next.contact_id = recovered.contact_id.clone();
            }
            next.contact_fields = merge_custom_fields(&next.contact_fields, &recovered.contact_fields);
            next.position_in_queue = recovered.position_in_queue;
            machine.apply(ThreadTransition::Recovered);
            if recovered.status == CaseStatus::Closed {
                next.can_add_more_messages = false;
                machine.apply(ThreadTransition::Closed);
            }
        }
        ServerEvent::ThreadMetadataLoaded {
            last_message, agent, ..
        } => {
            if let Some(message) = last_message {
                merge_messages(&mut next, TimelineOp::Merge(vec![message.clone()]));
            }
            if agent.is_some() {
                next.agent = agent.clone();
            }
            machine.apply(ThreadTransition::MetadataLoaded);
        }
        ServerEvent::ThreadUpdated {
            name,
            can_add_more_messages,
            state,
            ..
        } => {
            if name.is_some() {
                next.name = name.clone();
            }
            if let Some(can_add) = can_add_more_messages {
                next.can_add_more_messages = *can_add;
            }
            if let Some(state) = state {
                machine.advance_to(*state);
            }
        }
        ServerEvent::ThreadArchived { .. } => {
            next.can_add_more_messages = false;
            machine.apply(ThreadTransition::Closed);
        }
        ServerEvent::CustomerAuthorized { .. }
        | ServerEvent::TokenRefreshed { .. }
        | ServerEvent::ThreadListFetched { .. }
        | ServerEvent::ProactiveAction { .. }
        | ServerEvent::ExternalPayload { .. } => {}
    }

    next.state = machine.state();
    next
}

/// Append a locally created message.
pub fn with_message(thread: &ChatThread, message: Message) -> ChatThread {
    let mut next = thread.clone();
    merge_messages(&mut next, TimelineOp::Merge(vec![message]));
    next
}

/// Drop one message by id; missing ids leave the record unchanged.
pub fn without_message(thread: &ChatThread, message_id: uuid::Uuid) -> ChatThread {
    let mut next = thread.clone();
    merge_messages(&mut next, TimelineOp::Remove { message_id });
    next
}

fn merge_messages(thread: &mut ChatThread, op: TimelineOp) {
    let mut timeline = Timeline::new(std::mem::take(&mut thread.messages));
    if let Err(err) = timeline.apply_ops(std::slice::from_ref(&op)) {
        debug!(thread_id = %thread.id, error = %err, "timeline op skipped");
    }
    thread.messages = timeline.into_messages();
}

/// Local copy of a customer message, shown until the backend echoes it.
pub fn local_echo(
    thread_id: uuid::Uuid,
    message: &super::OutboundMessage,
    created_at_ms: u64,
    author_name: Option<String>,
) -> Message {
    Message {
        id: message.id,
        thread_id,
        direction: MessageDirection::ToAgent,
        content: message.content.clone(),
        created_at_ms,
        author_name,
        attachments: Vec::new(),
        seen_at_ms: None,
        read_at_ms: None,
    }
}

/// Whether the thread still accepts new messages from the customer.
pub fn accepts_messages(thread: &ChatThread) -> bool {
    thread.can_add_more_messages && thread.state != ThreadState::Closed
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use chat_core::{
        Agent, CustomField, MessageContent, MessageDirection, RecoveredThread,
    };
    use uuid::Uuid;

    use super::*;

    const THREAD: Uuid = Uuid::from_u128(77);

    fn message(id: u128, created_at_ms: u64, text: &str) -> Message {
        Message {
            id: Uuid::from_u128(id),
            thread_id: THREAD,
            direction: MessageDirection::ToClient,
            content: MessageContent::text(text),
            created_at_ms,
            author_name: None,
            attachments: Vec::new(),
            seen_at_ms: None,
            read_at_ms: None,
        }
    }

    fn agent() -> Agent {
        Agent {
            id: 9,
            first_name: "Kim".into(),
            last_name: "Ode".into(),
            nickname: None,
            image_url: None,
            is_typing: false,
        }
    }

    fn created(id: u128, at: u64, text: &str) -> ServerEvent {
        ServerEvent::MessageCreated {
            message: message(id, at, text),
        }
    }

    #[test]
    fn out_of_order_redelivery_yields_sorted_unique_messages() {
        let mut thread = ChatThread::pending(THREAD);
        for event in [
            created(3, 30, "c"),
            created(1, 10, "a"),
            created(3, 30, "c2"),
            created(2, 20, "b"),
        ] {
            thread = apply_event(&thread, &event);
        }
        let ids: Vec<u128> = thread.messages.iter().map(|m| m.id.as_u128()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(thread.messages[2].content, MessageContent::text("c2"));
    }

    #[test]
    fn typing_is_noop_without_agent() {
        let thread = ChatThread::pending(THREAD);
        let next = apply_event(
            &thread,
            &ServerEvent::AgentTyping {
                thread_id: THREAD,
                is_typing: true,
            },
        );
        assert_eq!(next, thread);

        let mut with_agent = thread.clone();
        with_agent.agent = Some(agent());
        let next = apply_event(
            &with_agent,
            &ServerEvent::AgentTyping {
                thread_id: THREAD,
                is_typing: true,
            },
        );
        assert!(next.agent.expect("agent").is_typing);
    }

    #[test]
    fn assignment_clears_queue_and_marks_ready() {
        let mut thread = ChatThread::pending(THREAD);
        thread = apply_event(
            &thread,
            &ServerEvent::QueuePositionChanged {
                thread_id: THREAD,
                position: 4,
                has_online_agent: true,
            },
        );
        assert_eq!(thread.position_in_queue, Some(4));

        thread = apply_event(
            &thread,
            &ServerEvent::AssignedAgentChanged {
                thread_id: THREAD,
                agent: Some(agent()),
            },
        );
        assert_eq!(thread.position_in_queue, None);
        assert_eq!(thread.state, ThreadState::Ready);
    }

    #[test]
    fn case_closed_blocks_new_messages() {
        let thread = apply_event(
            &ChatThread::pending(THREAD),
            &ServerEvent::CaseStatusChanged {
                thread_id: THREAD,
                contact_id: Some("contact-1".into()),
                status: CaseStatus::Closed,
            },
        );
        assert!(!thread.can_add_more_messages);
        assert_eq!(thread.state, ThreadState::Closed);
        assert_eq!(thread.contact_id.as_deref(), Some("contact-1"));
        assert!(!accepts_messages(&thread));
    }

    #[test]
    fn recovery_fills_record_and_merges_fields() {
        let mut thread = ChatThread::pending(THREAD);
        thread.contact_fields = vec![CustomField::new("topic", "sales")];
        let recovered = RecoveredThread {
            thread_id: THREAD,
            name: Some("Billing".into()),
            messages: vec![message(1, 10, "hi")],
            scroll_token: Some("page-2".into()),
            agent: Some(agent()),
            contact_id: Some("contact-2".into()),
            status: CaseStatus::Open,
            contact_fields: vec![CustomField::new("lang", "en")],
            customer_fields: Vec::new(),
            position_in_queue: None,
        };
        let next = apply_event(&thread, &ServerEvent::ThreadRecovered { thread: recovered });

        assert_eq!(next.state, ThreadState::Ready);
        assert_eq!(next.name.as_deref(), Some("Billing"));
        assert!(next.has_more_messages_to_load());
        assert_eq!(next.contact_fields.len(), 2);
    }

    #[test]
    fn pagination_prepends_and_replaces_token() {
        let mut thread = apply_event(&ChatThread::pending(THREAD), &created(5, 50, "new"));
        thread.scroll_token = Some("a".into());
        let next = apply_event(
            &thread,
            &ServerEvent::MoreMessagesLoaded {
                thread_id: THREAD,
                messages: vec![message(4, 40, "older")],
                scroll_token: None,
            },
        );
        assert_eq!(next.messages.first().map(|m| m.id), Some(Uuid::from_u128(4)));
        assert!(!next.has_more_messages_to_load());
    }

    #[test]
    fn read_receipts_patch_in_place() {
        let thread = apply_event(&ChatThread::pending(THREAD), &created(1, 10, "x"));
        let next = apply_event(
            &thread,
            &ServerEvent::MessageReadChanged {
                thread_id: THREAD,
                message_id: Uuid::from_u128(1),
                seen_at_ms: Some(11),
                read_at_ms: Some(12),
            },
        );
        assert_eq!(next.messages[0].read_at_ms, Some(12));

        let unknown = apply_event(
            &next,
            &ServerEvent::MessageReadChanged {
                thread_id: THREAD,
                message_id: Uuid::from_u128(99),
                seen_at_ms: Some(1),
                read_at_ms: None,
            },
        );
        assert_eq!(unknown, next);
    }

    #[tokio::test]
    async fn observers_fire_once_per_effective_change() {
        let executors = Executors::current();
        let model = ThreadModel::new(ChatThread::pending(THREAD), executors.clone());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = model.subscribe(move |thread| {
            sink.lock().expect("lock").push(thread.messages.len());
        });

        assert!(model.apply(&created(1, 10, "a")));
        assert!(!model.apply(&created(1, 10, "a")), "redelivery is not a change");
        assert!(model.apply(&created(2, 20, "b")));
        executors.foreground_idle().await;
        assert_eq!(*seen.lock().expect("lock"), vec![1, 2]);

        subscription.cancel();
        model.apply(&created(3, 30, "c"));
        executors.foreground_idle().await;
        assert_eq!(seen.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn observer_may_reenter_model() {
        let executors = Executors::current();
        let model = ThreadModel::new(ChatThread::pending(THREAD), executors.clone());
        let reentrant = Arc::clone(&model);
        let _subscription = model.subscribe(move |_| {
            let _ = reentrant.snapshot();
        });
        model.apply(&created(1, 10, "a"));
        executors.foreground_idle().await;
        assert_eq!(model.snapshot().messages.len(), 1);
    }
}
