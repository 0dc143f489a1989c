use std::sync::Arc;

use chat_core::{
    Cancellable, ChatError, ChatThread, ClientEvent, EventType, ServerErrorKind,
    normalize_background_failure, normalize_server_error,
};
use tracing::debug;
use uuid::Uuid;

use super::{
    ArchiveCallback, OutboundMessage, ThreadAction, ThreadDeps, ThreadHandler, ThreadObserver,
    model::ThreadModel,
};
use crate::pipeline::TriggerCallbacks;

/// Loads the summary metadata (last message, assignee) of a thread that was
/// only listed, moving it to `Loaded`.
pub struct MetadataThreadHandler {
    inner: Arc<dyn ThreadHandler>,
    subscriptions: Cancellable,
}

impl MetadataThreadHandler {
    pub fn new(inner: Arc<dyn ThreadHandler>, deps: ThreadDeps, model: Arc<ThreadModel>) -> Self {
        let thread_id = inner.thread_id();
        let context = &deps.context;

        let loaded = context
            .dispatcher
            .subscribe(EventType::ThreadMetadataLoaded, move |event| {
                if event.thread_id() == Some(thread_id) && model.apply(event) {
                    debug!(thread_id = %thread_id, "thread metadata loaded");
                }
            });
        let reporter = Arc::clone(context);
        let failed = context
            .dispatcher
            .subscribe_error(ServerErrorKind::MetadataLoadFailed, move |error| {
                if error.thread_id == Some(thread_id) {
                    reporter.report(normalize_server_error(error));
                }
            });

        let reporter = Arc::clone(context);
        deps.events.trigger(
            ClientEvent::LoadThreadMetadata { thread_id }.into(),
            TriggerCallbacks::none().on_error(move |err| {
                reporter.report(normalize_background_failure("load_thread_metadata", err));
            }),
        );

        Self {
            inner,
            subscriptions: Cancellable::compound([loaded, failed]),
        }
    }
}

impl ThreadHandler for MetadataThreadHandler {
    fn thread_id(&self) -> Uuid {
        self.inner.thread_id()
    }

    fn get(&self) -> ChatThread {
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
        self.inner.send(message)
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
        self.subscriptions.cancel();
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use chat_core::{Agent, ServerEvent, ThreadState};

    use super::*;
    use crate::{test_support::Harness, thread::PrimitiveThreadHandler};

    #[tokio::test]
    async fn requests_metadata_and_moves_to_loaded() {
        let harness = Harness::multi_thread();
        let thread_id = Uuid::from_u128(11);
        let deps = harness.recording_deps();
        let model = ThreadModel::new(
            ChatThread::pending(thread_id),
            harness.context().executors.clone(),
        );
        let primitive = Arc::new(PrimitiveThreadHandler::new(deps.clone(), Arc::clone(&model)));
        let handler = MetadataThreadHandler::new(primitive, deps, model);
        assert_eq!(harness.recorded_kinds(), vec!["load_thread_metadata"]);

        harness
            .context()
            .dispatcher
            .dispatch(&ServerEvent::ThreadMetadataLoaded {
                thread_id,
                last_message: None,
                agent: Some(Agent {
                    id: 5,
                    first_name: "Ada".into(),
                    last_name: "Byron".into(),
                    nickname: None,
                    image_url: None,
                    is_typing: false,
                }),
            });

        let snapshot = handler.get();
        assert_eq!(snapshot.state, ThreadState::Loaded);
        assert_eq!(snapshot.agent.map(|agent| agent.first_name).as_deref(), Some("Ada"));

        handler.close();
        assert_eq!(
            harness
                .context()
                .dispatcher
                .subscriber_count(EventType::ThreadMetadataLoaded),
            0
        );
    }
}
