//! offsync-sync: offline-first sync engine with a durable mutation queue,
//! timestamp-window conflict detection, pluggable resolution strategies and a
//! realtime channel with bounded reconnect.

pub mod checksum;
pub mod conflict;
pub mod coordinator;
pub mod encryption;
pub mod nats;
pub mod network;
pub mod protocol;
pub mod queue;
pub mod realtime;
pub mod remote;
pub mod resolve;
pub mod state;
pub mod stats;
pub mod store;

pub use conflict::{ConflictDetector, ConflictKind, ConflictRecord, Detection};
pub use coordinator::{Collaborators, CoordinatorSettings, Settled, SyncCoordinator};
pub use encryption::{Encryptor, PlaintextEncryptor};
pub use network::{NetworkEvent, NetworkMonitor};
pub use queue::{NewItem, QueueSnapshot, RetryOutcome, SyncQueue};
pub use realtime::{
    ChannelEvent, ChannelState, Connection, Credentials, MessageSink, RealtimeChannel,
    RealtimeTransport, ReconnectPolicy,
};
pub use remote::RemoteApi;
pub use resolve::{ConflictResolver, Resolution, Strategy, Winner};
pub use state::{SyncMeta, TenantState};
pub use stats::{DropReason, SyncEvent, SyncMode, SyncReport, SyncStats};
pub use store::{JsonFileStore, LocalStore, MemoryStore};

#[cfg(feature = "http")]
pub use remote::HttpRemote;

#[cfg(feature = "nats")]
pub use nats::NatsTransport;
