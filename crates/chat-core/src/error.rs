use std::{fmt::Debug, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::ServerErrorKind;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input or configuration.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Backend rejected or failed an operation.
    Server,
    /// Operation not allowed in the current local state.
    InvalidState,
    /// Local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload returned across the runtime API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Standard invalid-state-transition error.
    pub fn invalid_state(current: impl Debug, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::InvalidState,
            "invalid_state_transition",
            format!("cannot run '{action}' while in state {current:?}"),
        )
    }

    /// Send attempted on a thread that no longer accepts messages.
    pub fn thread_archived(thread_id: Uuid) -> Self {
        Self::new(
            ErrorCategory::InvalidState,
            "thread_archived",
            format!("thread {thread_id} does not accept new messages"),
        )
    }

    /// Operation not offered by the channel's threading mode.
    pub fn unsupported(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::InvalidState,
            "unsupported_operation",
            format!("'{action}' is not supported for this channel"),
        )
    }

    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, code, message)
    }

    pub fn serialization(err: serde_json::Error) -> Self {
        Self::new(ErrorCategory::Serialization, "serialization_failed", err.to_string())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, "internal", message)
    }

    /// Whether the backoff helpers may retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category, ErrorCategory::Network)
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        408 | 429 => ErrorCategory::Network,
        400..=499 => ErrorCategory::Config,
        500..=599 => ErrorCategory::Network,
        _ => ErrorCategory::Internal,
    }
}

/// Runtime failure published to the application instead of being returned
/// at a call site.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatRuntimeError {
    /// The backend failed an operation the client requested.
    #[error("server operation {kind:?} failed: {message}")]
    ServerCommunication {
        kind: ServerErrorKind,
        thread_id: Option<Uuid>,
        event_id: Option<Uuid>,
        message: String,
    },
    /// Authorization was rejected; the session should be ended.
    #[error("authorization failed: {message}")]
    Authorization { message: String },
    /// Background work failed locally (upload, decoding, delayed send).
    #[error("background operation '{operation}' failed: {error}")]
    Background {
        operation: &'static str,
        error: ChatError,
    },
}
