//! External collaborator contracts consumed by the chat runtime.

/// Remote HTTP service contract.
pub mod remote;
/// Persisted key-value storage.
pub mod storage;
/// Duplex wire transport contract and loopback implementation.
pub mod transport;

pub use remote::{AttachmentUpload, ChannelConfiguration, RemoteError, RemoteService};
pub use storage::{
    ChatStorage, InMemoryKeyValueStore, KeyValueStore, StorageError, StoredToken, StoredVisit,
};
pub use transport::{
    LoopbackTransport, NORMAL_CLOSURE, Transport, TransportError, TransportListener,
};
