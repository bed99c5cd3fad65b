//! # pipeline-feed
//!
//! Live event distribution client for the processing pipeline dashboard.
//!
//! The controller publishes three server-driven snapshot streams (queue
//! status, worker health, event history). This crate keeps at most one
//! authenticated streaming connection per channel, shares it between all
//! interested observers, fans every snapshot out to them in registration
//! order, and silently reconnects after a fixed delay when the connection
//! fails.
//!
//! ## Architecture
//!
//! ```text
//! Presentation code
//!     │
//!     ├── ObserverBinding (observer)        {value, is_loading}
//!     │
//!     ├── ChannelRegistry (registry/)       observers, coalescing, fan-out
//!     │
//!     ├── ConnectionManager (stream/)       Idle/Connecting/Open/Errored/Backoff
//!     │     ├── Transport (HTTP + SSE)
//!     │     ├── Timer (backoff)
//!     │     └── CredentialProvider (domain/)
//!     │
//!     └── Pipeline controller (/status, /monitor/worker, /monitor/events)
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod observer;
pub mod registry;
pub mod stream;

pub use config::FeedConfig;
pub use domain::{Channel, Credential, CredentialProvider, CredentialStore, Snapshot};
pub use error::FeedError;
pub use observer::{BindingView, ObserverBinding};
pub use registry::{ChannelRegistry, Subscription};
