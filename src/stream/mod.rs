//! Connection layer: state machine, SSE decoding, transport and driver.
//!
//! Each channel with observers owns exactly one [`ConnectionManager`],
//! which owns exactly one transport at a time.

pub mod connection;
pub mod machine;
pub mod sse;
pub mod timer;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectionDeps, ConnectionManager, ConnectionStatus, RetryPolicy, SnapshotSink};
pub use machine::{ConnectionEvent, ConnectionState, transition};
pub use timer::{Timer, TokioTimer};
pub use transport::{FrameStream, HttpTransport, Transport};
