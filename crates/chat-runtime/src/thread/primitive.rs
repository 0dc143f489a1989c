use std::sync::Arc;

use chat_core::{
    Attachment, Cancellable, ChatError, ChatMode, ChatThread, ClientEvent, FixedRetry, Message,
    OutboundEvent, ThreadState, merge_custom_fields, normalize_background_failure,
};
use chat_platform::AttachmentUpload;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ArchiveCallback, OutboundMessage, ThreadAction, ThreadDeps, ThreadHandler, ThreadObserver,
    model::{ThreadModel, accepts_messages, local_echo, with_message},
};
use crate::{
    context::{SessionContext, map_remote_error},
    pipeline::TriggerCallbacks,
};

/// Innermost thread layer: owns the model and turns operations into events.
pub struct PrimitiveThreadHandler {
    deps: ThreadDeps,
    model: Arc<ThreadModel>,
    thread_id: Uuid,
}

impl PrimitiveThreadHandler {
    pub fn new(deps: ThreadDeps, model: Arc<ThreadModel>) -> Self {
        let thread_id = model.snapshot().id;
        Self {
            deps,
            model,
            thread_id,
        }
    }

    fn context(&self) -> &Arc<SessionContext> {
        &self.deps.context
    }

    fn trigger_reporting(&self, payload: ClientEvent, operation: &'static str) {
        let context = Arc::clone(self.context());
        self.deps.events.trigger(
            payload.into(),
            TriggerCallbacks::none().on_error(move |err| {
                context.report(normalize_background_failure(operation, err));
            }),
        );
    }

    fn local_message(&self, message: &OutboundMessage) -> Message {
        // Already staged by an outer layer: keep its place in the timeline.
        let created_at_ms = self
            .model
            .snapshot()
            .messages
            .iter()
            .find(|staged| staged.id == message.id)
            .map_or_else(|| self.context().clock.now_ms(), |staged| staged.created_at_ms);
        local_echo(
            self.thread_id,
            message,
            created_at_ms,
            self.context().connection().display_name(),
        )
    }

    fn send_with_uploads(&self, local: Message, uploads: Vec<AttachmentUpload>) {
        let context = Arc::clone(self.context());
        let events = Arc::clone(&self.deps.events);
        let model = Arc::clone(&self.model);
        let thread_id = self.thread_id;
        let executors = context.executors.clone();

        // Detached; the upload outlives the caller.
        let _upload = executors.spawn_background(async move {
            let mut attachments = Vec::with_capacity(uploads.len());
            for upload in uploads {
                match upload_attachment(&context, upload).await {
                    Ok(attachment) => attachments.push(attachment),
                    Err(err) => {
                        context.report(normalize_background_failure("upload_attachment", err));
                        return;
                    }
                }
            }

            let mut uploaded = local;
            uploaded.attachments = attachments.clone();
            model.update(|thread| with_message(thread, uploaded.clone()));

            let reporter = Arc::clone(&context);
            events.trigger(
                OutboundEvent::new(ClientEvent::SendMessage {
                    thread_id,
                    message_id: uploaded.id,
                    content: uploaded.content,
                    attachments,
                }),
                TriggerCallbacks::none().on_error(move |err| {
                    reporter.report(normalize_background_failure("send_message", err));
                }),
            );
        });
    }
}

async fn upload_attachment(
    context: &Arc<SessionContext>,
    upload: AttachmentUpload,
) -> Result<Attachment, ChatError> {
    let friendly_name = upload.file_name.clone();
    let mime_type = upload.mime_type.clone();
    let upload = Arc::new(upload);
    let url = FixedRetry::default()
        .run(
            |attempt| {
                let remote = Arc::clone(&context.remote);
                let upload = Arc::clone(&upload);
                let call = context
                    .executors
                    .run_blocking(move || remote.upload_attachment(&upload));
                async move {
                    debug!(attempt, "uploading attachment");
                    match call.await {
                        Ok(result) => result.map_err(map_remote_error),
                        Err(join) => Err(ChatError::internal(join.to_string())),
                    }
                }
            },
            ChatError::is_retryable,
        )
        .await?;
    Ok(Attachment {
        url: url.to_string(),
        friendly_name,
        mime_type,
    })
}

impl ThreadHandler for PrimitiveThreadHandler {
    fn thread_id(&self) -> Uuid {
        self.thread_id
    }

    fn get(&self) -> ChatThread {
        self.model.snapshot()
    }

    fn subscribe(&self, on_update: ThreadObserver) -> Cancellable {
        self.model.subscribe(move |thread| on_update(thread))
    }

    fn refresh(&self) -> Result<(), ChatError> {
        let snapshot = self.model.snapshot();
        if snapshot.state == ThreadState::Pending && snapshot.messages.is_empty() {
            debug!(thread_id = %self.thread_id, "thread not yet known to the backend; skipping refresh");
            return Ok(());
        }
        let payload = match self.context().mode() {
            ChatMode::LiveChat => ClientEvent::RecoverLiveChat {
                thread_id: Some(self.thread_id),
            },
            ChatMode::SingleThread | ChatMode::MultiThread => ClientEvent::RecoverThread {
                thread_id: Some(self.thread_id),
            },
        };
        self.trigger_reporting(payload, "refresh_thread");
        Ok(())
    }

    fn load_more(&self) -> Result<bool, ChatError> {
        let snapshot = self.model.snapshot();
        let Some(scroll_token) = snapshot.scroll_token.filter(|token| !token.is_empty()) else {
            return Ok(false);
        };
        self.trigger_reporting(
            ClientEvent::LoadMoreMessages {
                thread_id: self.thread_id,
                scroll_token,
                oldest_message_id: snapshot.messages.first().map(|message| message.id),
            },
            "load_more_messages",
        );
        Ok(true)
    }

    fn send(&self, message: OutboundMessage) -> Result<Uuid, ChatError> {
        if !accepts_messages(&self.model.snapshot()) {
            return Err(ChatError::thread_archived(self.thread_id));
        }
        let local = self.local_message(&message);
        self.model.update(|thread| with_message(thread, local.clone()));
        info!(thread_id = %self.thread_id, message_id = %message.id, "sending message");

        if message.attachments.is_empty() {
            self.trigger_reporting(
                ClientEvent::SendMessage {
                    thread_id: self.thread_id,
                    message_id: message.id,
                    content: message.content,
                    attachments: Vec::new(),
                },
                "send_message",
            );
        } else {
            self.send_with_uploads(local, message.attachments);
        }
        Ok(message.id)
    }

    fn update(&self, action: ThreadAction) -> Result<(), ChatError> {
        let thread_id = self.thread_id;
        let payload = match action {
            ThreadAction::MarkRead => ClientEvent::MarkThreadRead { thread_id },
            ThreadAction::Typing(is_typing) => ClientEvent::SetTyping {
                thread_id,
                is_typing,
            },
            ThreadAction::Rename(name) => {
                let renamed = name.clone();
                self.model.update(|thread| ChatThread {
                    name: Some(renamed),
                    ..thread.clone()
                });
                ClientEvent::UpdateThreadName { thread_id, name }
            }
            ThreadAction::SetContactFields(fields) => {
                self.model.update(|thread| ChatThread {
                    contact_fields: merge_custom_fields(&thread.contact_fields, &fields),
                    ..thread.clone()
                });
                ClientEvent::SetContactCustomFields { thread_id, fields }
            }
        };
        self.trigger_reporting(payload, "update_thread");
        Ok(())
    }

    fn archive(&self, _on_complete: ArchiveCallback) -> Result<(), ChatError> {
        Err(ChatError::unsupported("archive"))
    }

    fn end_contact(&self) -> Result<(), ChatError> {
        Err(ChatError::unsupported("end_contact"))
    }

    fn close(&self) {
        debug!(thread_id = %self.thread_id, "thread handler closed");
    }
}
