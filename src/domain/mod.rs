//! Domain layer: channels, snapshot payloads and credentials.
//!
//! These types carry no I/O. The connection layer in [`crate::stream`]
//! consumes them and the registry in [`crate::registry`] fans them out.

pub mod channel;
pub mod credential;
pub mod snapshot;

pub use channel::{Channel, ChannelKind, MonitorEventsChannel, StatusChannel, WorkerStatusChannel};
pub use credential::{Credential, CredentialProvider, CredentialStore};
pub use snapshot::{
    MonitorEvent, MonitorEventsSnapshot, QueuedItem, Snapshot, StatusSnapshot, WorkerHealth,
    WorkerMetrics, WorkerStatusSnapshot,
};
