//! Per-channel connection state machine.
//!
//! [`transition`] is a pure function over [`ConnectionState`] and
//! [`ConnectionEvent`]; the async driver in [`super::connection`] feeds it
//! events and performs the side effects each new state implies.
//!
//! ```text
//!            Subscribed                Opened / Frame
//!   Idle ───────────────▶ Connecting ─────────────────▶ Open ◀─┐ Frame
//!    ▲  ◀─────────────────    │  ▲                        │ └──┘ MalformedFrame
//!    │   CredentialMissing    │  │ BackoffElapsed         │
//!    │                        │  │                        │ TransportFailed
//!    │         TransportFailed▼  │                        ▼
//!    │                      Backoff ◀──── RetryScheduled ── Errored
//!    │                                                      │
//!    └──────────────── Drained (from any state) ────────────┘
//!                      CredentialRejected (opt-in)
//! ```

use std::fmt;

use serde::Serialize;

/// Lifecycle state of one channel's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport and no pending timer.
    #[default]
    Idle,
    /// Resolving the credential and opening the transport.
    Connecting,
    /// Transport open; frames are being delivered.
    Open,
    /// Transport failed; about to schedule a retry.
    Errored,
    /// Waiting out the fixed delay before reconnecting.
    Backoff,
}

impl ConnectionState {
    /// Returns the state name as a static string slice.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Errored => "errored",
            Self::Backoff => "backoff",
        }
    }

    /// Returns `true` if a driver task is expected to be running in this
    /// state.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// An observer asked for the channel while it was idle.
    Subscribed,
    /// The credential provider returned nothing.
    CredentialMissing,
    /// The transport finished its handshake.
    Opened,
    /// A frame decoded successfully.
    Frame,
    /// A frame failed to decode. Never leaves `Open`.
    MalformedFrame,
    /// The transport failed, closed, or refused to open.
    TransportFailed,
    /// The server refused the credential and retries are disabled for that case.
    CredentialRejected,
    /// The retry timer was armed.
    RetryScheduled,
    /// The retry timer fired.
    BackoffElapsed,
    /// The last observer left, or the connection was suspended.
    Drained,
}

/// Computes the next state, or `None` if `event` is not meaningful in
/// `state` and should be ignored.
#[must_use]
pub const fn transition(state: ConnectionState, event: ConnectionEvent) -> Option<ConnectionState> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    let next = match (state, event) {
        (_, E::Drained) => S::Idle,
        (S::Idle, E::Subscribed) => S::Connecting,
        (S::Connecting, E::CredentialMissing) => S::Idle,
        (S::Connecting, E::Opened | E::Frame) => S::Open,
        (S::Connecting | S::Open, E::TransportFailed) => S::Errored,
        (S::Connecting | S::Open, E::CredentialRejected) => S::Idle,
        (S::Open, E::Frame | E::MalformedFrame) => S::Open,
        (S::Errored, E::RetryScheduled) => S::Backoff,
        (S::Backoff, E::BackoffElapsed) => S::Connecting,
        _ => return None,
    };
    Some(next)
}
