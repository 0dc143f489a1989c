//! Drives a full client against an in-process backend: connect, authorize,
//! recover, create a thread, send a message, close.

mod logging;

use std::{env, process, sync::Arc, time::Duration};

use chat_core::{
    AccessToken, ChatNotification, ChatThread, Environment, Message, MessageContent,
    MessageDirection, ServerErrorKind, ServerEvent,
};
use chat_platform::{
    AttachmentUpload, ChannelConfiguration, LoopbackTransport, RemoteError, RemoteService,
};
use chat_runtime::{ChatClientBuilder, OutboundMessage, RuntimeConfig};
use serde_json::{Value, json};
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

const DEFAULT_BRAND_ID: u64 = 1000;
const DEFAULT_CHANNEL_ID: &str = "chat_smoke";

/// Always-online single-thread channel that echoes uploads back as URLs.
struct DemoRemote;

impl RemoteService for DemoRemote {
    fn channel_configuration(
        &self,
        _brand_id: u64,
        _channel_id: &str,
    ) -> Result<ChannelConfiguration, RemoteError> {
        Ok(ChannelConfiguration::default())
    }

    fn channel_availability(&self, _brand_id: u64, _channel_id: &str) -> Result<bool, RemoteError> {
        Ok(true)
    }

    fn upload_attachment(&self, upload: &AttachmentUpload) -> Result<Url, RemoteError> {
        Url::parse(&format!("https://files.chat.invalid/{}", upload.file_name))
            .map_err(|err| RemoteError::Decode(err.to_string()))
    }

    fn fetch_payload(&self, url: &Url) -> Result<String, RemoteError> {
        Err(RemoteError::Http {
            status: 404,
            message: format!("no payload at {url}"),
        })
    }
}

/// Answers the frames a single-thread session sends.
fn respond(frame: &str) -> Vec<String> {
    let request: Value = serde_json::from_str(frame).unwrap_or_default();
    let events = match request["type"].as_str() {
        Some("authorizeCustomer" | "reconnectCustomer") => vec![ServerEvent::CustomerAuthorized {
            access_token: AccessToken {
                token: Uuid::new_v4().to_string(),
                expires_at_ms: u64::MAX / 2,
            },
            customer: None,
        }],
        Some("recoverThread") => {
            return vec![
                json!({
                    "type": "error",
                    "kind": ServerErrorKind::RecoveringThreadFailed,
                    "message": "no thread yet",
                })
                .to_string(),
            ];
        }
        Some("sendMessage") => echo(&request).into_iter().collect(),
        _ => Vec::new(),
    };
    events
        .iter()
        .filter_map(|event| serde_json::to_string(event).ok())
        .collect()
}

fn echo(request: &Value) -> Option<ServerEvent> {
    let thread_id: Uuid = serde_json::from_value(request["threadId"].clone()).ok()?;
    let content: MessageContent = serde_json::from_value(request["content"].clone()).ok()?;
    let text = match content {
        MessageContent::Text { text, .. } => text,
        _ => return None,
    };
    Some(ServerEvent::MessageCreated {
        message: Message {
            id: Uuid::new_v4(),
            thread_id,
            direction: MessageDirection::ToClient,
            content: MessageContent::Text {
                text: format!("echo: {text}"),
                postback: None,
            },
            created_at_ms: 0,
            author_name: Some("Smoke Agent".to_owned()),
            attachments: Vec::new(),
            seen_at_ms: None,
            read_at_ms: None,
        },
    })
}

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(err) = run().await {
        error!(error = %err, "smoke run failed");
        process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = RuntimeConfig::from_env()?;
    let brand_id = env::var("CHAT_SMOKE_BRAND_ID")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_BRAND_ID);
    let channel_id =
        env::var("CHAT_SMOKE_CHANNEL_ID").unwrap_or_else(|_| DEFAULT_CHANNEL_ID.to_owned());

    let transport = Arc::new(LoopbackTransport::new());
    transport.set_responder(respond);

    let client = ChatClientBuilder::new(
        brand_id,
        channel_id,
        Environment {
            socket_url: "wss://chat.invalid/socket".to_owned(),
            chat_url: "https://chat.invalid".to_owned(),
        },
        Arc::new(DemoRemote),
        transport.clone(),
    )
    .config(config)
    .connect()
    .await?;

    let mut notifications = client.subscribe_notifications();
    let _watch = tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            match notification {
                ChatNotification::ConnectionState(state) => info!(?state, "connection state"),
                ChatNotification::RuntimeError(err) => warn!(error = ?err, "runtime error"),
            }
        }
    });

    let thread = client.create_thread()?;
    let _updates = thread.subscribe(Arc::new(|thread: &ChatThread| {
        info!(
            thread_id = %thread.id,
            messages = thread.messages.len(),
            "thread updated"
        );
    }));
    let message_id = thread.send(OutboundMessage::text("hello from chat-smoke"))?;
    info!(%message_id, "message sent");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot = thread.get();
    info!(
        thread_id = %snapshot.id,
        state = ?snapshot.state,
        messages = snapshot.messages.len(),
        "final thread snapshot"
    );
    info!(frames = transport.sent_frames().len(), "frames exchanged");

    client.close();
    Ok(())
}
