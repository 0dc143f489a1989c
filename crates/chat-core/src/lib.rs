//! Core chat contract shared between the runtime and application code.
//!
//! This crate defines the wire protocol, event dispatch, cancellation
//! handles, retry and timeline helpers, template resolution, and common
//! error/notification abstractions.

/// Idempotent cancellation handles.
pub mod cancellable;
/// Application notification channel.
pub mod channel;
/// Wall-clock abstraction.
pub mod clock;
/// Typed event and error fan-out.
pub mod dispatch;
/// Stable chat error types and HTTP classification helpers.
pub mod error;
/// Frame decoding/encoding and server error normalization.
pub mod normalization;
/// Reconnect backoff and fixed-interval retry.
pub mod retry;
/// Forward-only thread state machine.
pub mod state_machine;
/// Welcome message template placeholders.
pub mod template;
/// Ordered, deduplicated message timeline.
pub mod timeline;
/// Protocol types (events, payloads, thread snapshots).
pub mod types;

pub use cancellable::Cancellable;
pub use channel::{ChatNotification, NotificationChannel, NotificationStream};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{ErrorCallback, EventCallback, EventDispatcher};
pub use error::{ChatError, ChatRuntimeError, ErrorCategory, classify_http_status};
pub use normalization::{
    InboundFrame, decode_inbound_frame, encode_outbound, normalize_background_failure,
    normalize_server_error, transport_send_error,
};
pub use retry::{Backoff, FixedRetry, ReconnectPolicy};
pub use state_machine::{ThreadStateMachine, ThreadTransition};
pub use template::{TemplateContext, resolve_template};
pub use timeline::{Timeline, TimelineMergeError, TimelineOp};
pub use types::{
    AccessToken, Agent, Attachment, CaseStatus, ChatMode, ChatThread, ClientEvent, Connection,
    ConnectionState, CustomField, CustomFieldScope, CustomerIdentity, Environment, EventType,
    Message, MessageContent, MessageDirection, OutboundEnvelope, OutboundEvent, ProactiveAction,
    QuickReplyOption, RecoveredThread, ServerErrorEvent, ServerErrorKind, ServerEvent,
    ThreadState, ThreadSummary, merge_custom_fields,
};
