use thiserror::Error;
use url::Url;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("remote unreachable: {0}")]
    Network(String),
    #[error("remote response could not be decoded: {0}")]
    Decode(String),
}

/// Channel settings served by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelConfiguration {
    pub is_multi_thread: bool,
    pub is_live_chat: bool,
    pub is_authorization_enabled: bool,
}

/// Bytes queued for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub file_name: String,
}

/// HTTP side of the backend.
///
/// Calls block; the runtime only invokes them from its background context.
pub trait RemoteService: Send + Sync {
    fn channel_configuration(
        &self,
        brand_id: u64,
        channel_id: &str,
    ) -> Result<ChannelConfiguration, RemoteError>;

    /// Whether a live-chat channel currently has agents online.
    fn channel_availability(&self, brand_id: u64, channel_id: &str) -> Result<bool, RemoteError>;

    /// Upload one attachment and return where it can be fetched from.
    fn upload_attachment(&self, upload: &AttachmentUpload) -> Result<Url, RemoteError>;

    /// Fetch an event body that was too large to send inline.
    fn fetch_payload(&self, url: &Url) -> Result<String, RemoteError>;
}

impl RemoteError {
    /// Whether the same call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::Decode(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_failures() {
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(
            RemoteError::Http {
                status: 503,
                message: "busy".into()
            }
            .is_transient()
        );
        assert!(
            !RemoteError::Http {
                status: 404,
                message: "missing".into()
            }
            .is_transient()
        );
        assert!(!RemoteError::Decode("eof".into()).is_transient());
    }
}
