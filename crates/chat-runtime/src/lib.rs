//! Chat client runtime: connection lifecycle, session decorators, the
//! outbound event pipeline, and per-thread handler stacks.
//!
//! Applications construct a [`ChatClient`] through [`ChatClientBuilder`],
//! then observe it through the notification stream from `chat-core`.

/// Application-facing client and builder.
pub mod client;
/// Environment-driven runtime configuration.
pub mod config;
/// Shared per-session state and collaborator handles.
pub mod context;
/// Foreground queue and background task spawning.
pub mod executor;
/// Outbound event handler stack.
pub mod pipeline;
/// Reconnect scheduling after unexpected transport loss.
pub mod reconnect;
/// Session decorator stack.
pub mod session;
/// Thread state and thread handler stack.
pub mod thread;

#[cfg(test)]
mod test_support;

pub use client::{ChatClient, ChatClientBuilder};
pub use config::{ConfigError, RuntimeConfig};
pub use context::{AuthorizationCode, LifecycleEvent, SessionContext, SessionParts};
pub use executor::Executors;
pub use pipeline::{EventHandler, EventPipeline, TriggerCallbacks};
pub use reconnect::{ReconnectPhase, ReconnectionManager};
pub use session::{ChatSession, build_session};
pub use thread::{
    LiveChatWelcomeRegistry, OutboundMessage, ThreadAction, ThreadHandler, ThreadModel,
};
