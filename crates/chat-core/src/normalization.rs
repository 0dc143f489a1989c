use crate::{
    error::{ChatError, ChatRuntimeError, ErrorCategory},
    types::{
        Connection, OutboundEnvelope, OutboundEvent, ServerErrorEvent, ServerErrorKind,
        ServerEvent,
    },
};

/// Wire `type` value that marks an error frame.
pub const ERROR_FRAME_TYPE: &str = "error";

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Event(ServerEvent),
    Error(ServerErrorEvent),
}

/// Decode a raw transport message.
pub fn decode_inbound_frame(raw: &str) -> Result<InboundFrame, ChatError> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(ChatError::serialization)?;
    let is_error = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|kind| kind == ERROR_FRAME_TYPE);

    if is_error {
        serde_json::from_value(value)
            .map(InboundFrame::Error)
            .map_err(ChatError::serialization)
    } else {
        serde_json::from_value(value)
            .map(InboundFrame::Event)
            .map_err(ChatError::serialization)
    }
}

/// Serialize an outbound event with the connection metadata the backend
/// expects on every frame.
pub fn encode_outbound(
    event: &OutboundEvent,
    connection: &Connection,
    access_token: Option<&str>,
) -> Result<String, ChatError> {
    let envelope = OutboundEnvelope {
        event_id: event.event_id,
        brand_id: connection.brand_id,
        channel_id: &connection.channel_id,
        visitor_id: connection.visitor_id,
        customer_id: &connection.customer.id,
        access_token,
        payload: &event.payload,
    };
    serde_json::to_string(&envelope).map_err(ChatError::serialization)
}

/// Convert a server error frame to the runtime error published to the
/// application.
pub fn normalize_server_error(error: &ServerErrorEvent) -> ChatRuntimeError {
    match error.kind {
        ServerErrorKind::CustomerAuthorizationFailed => ChatRuntimeError::Authorization {
            message: error.message.clone(),
        },
        kind => ChatRuntimeError::ServerCommunication {
            kind,
            thread_id: error.thread_id,
            event_id: error.event_id,
            message: error.message.clone(),
        },
    }
}

/// Wrap a local failure of background work.
pub fn normalize_background_failure(operation: &'static str, error: ChatError) -> ChatRuntimeError {
    ChatRuntimeError::Background { operation, error }
}

/// Default error for a transport send that did not go through.
pub fn transport_send_error(message: impl Into<String>) -> ChatError {
    ChatError::new(ErrorCategory::Network, "send_failed", message.into())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::types::{ClientEvent, CustomerIdentity, Environment};

    fn connection() -> Connection {
        Connection {
            brand_id: 1086,
            channel_id: "chat_web".into(),
            customer: CustomerIdentity::new("customer-7"),
            visitor_id: Uuid::from_u128(9),
            environment: Environment {
                socket_url: "wss://chat.example.com".into(),
                chat_url: "https://chat.example.com".into(),
            },
        }
    }

    #[test]
    fn decodes_event_frames() {
        let thread_id = Uuid::from_u128(42);
        let raw = format!(r#"{{"type":"agentTyping","threadId":"{thread_id}","isTyping":true}}"#);
        let frame = decode_inbound_frame(&raw).expect("valid frame");
        assert_eq!(
            frame,
            InboundFrame::Event(ServerEvent::AgentTyping {
                thread_id,
                is_typing: true
            })
        );
    }

    #[test]
    fn decodes_error_frames_with_unknown_kind() {
        let raw = r#"{"type":"error","kind":"somethingNew","message":"nope"}"#;
        match decode_inbound_frame(raw).expect("valid error frame") {
            InboundFrame::Error(err) => {
                assert_eq!(err.kind, ServerErrorKind::Unknown);
                assert_eq!(err.message, "nope");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        let err = decode_inbound_frame("{not json").expect_err("malformed");
        assert_eq!(err.code, "serialization_failed");
        let err = decode_inbound_frame(r#"{"type":"noSuchEvent"}"#).expect_err("unknown type");
        assert_eq!(err.category, ErrorCategory::Serialization);
    }

    #[test]
    fn encodes_envelope_with_flattened_payload() {
        let event = OutboundEvent {
            event_id: Uuid::from_u128(1),
            payload: ClientEvent::ArchiveThread {
                thread_id: Uuid::from_u128(2),
            },
        };
        let raw = encode_outbound(&event, &connection(), Some("tok")).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");

        assert_eq!(value["type"], "archiveThread");
        assert_eq!(value["brandId"], 1086);
        assert_eq!(value["customerId"], "customer-7");
        assert_eq!(value["accessToken"], "tok");
        assert_eq!(value["threadId"], Uuid::from_u128(2).to_string());
        assert_eq!(value["eventId"], Uuid::from_u128(1).to_string());
    }

    #[test]
    fn omits_missing_access_token() {
        let event = OutboundEvent::new(ClientEvent::FetchThreadList);
        let raw = encode_outbound(&event, &connection(), None).expect("encode");
        assert!(!raw.contains("accessToken"));
    }

    #[test]
    fn maps_authorization_failures_to_terminal_error() {
        let err = ServerErrorEvent {
            kind: ServerErrorKind::CustomerAuthorizationFailed,
            event_id: None,
            thread_id: None,
            message: "bad code".into(),
        };
        assert_eq!(
            normalize_server_error(&err),
            ChatRuntimeError::Authorization {
                message: "bad code".into()
            }
        );

        let err = ServerErrorEvent {
            kind: ServerErrorKind::SendMessageFailed,
            thread_id: Some(Uuid::from_u128(3)),
            ..err
        };
        match normalize_server_error(&err) {
            ChatRuntimeError::ServerCommunication { kind, thread_id, .. } => {
                assert_eq!(kind, ServerErrorKind::SendMessageFailed);
                assert_eq!(thread_id, Some(Uuid::from_u128(3)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
