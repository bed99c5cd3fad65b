//! Channel identifiers for the live dashboard streams.
//!
//! A [`Channel`] names one server-driven snapshot stream. The set is fixed
//! at compile time; adding a channel means adding a variant here, a payload
//! type in [`super::snapshot`] and a marker in [`ChannelKind`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::snapshot::{MonitorEventsSnapshot, Snapshot, StatusSnapshot, WorkerStatusSnapshot};
use crate::error::FeedError;

/// One of the live snapshot streams published by the pipeline controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    /// Queue depth, in-flight items, completed items and per-item errors.
    Status,
    /// Per-worker health and resource metrics.
    WorkerStatus,
    /// Rolling history of pipeline events.
    MonitorEvents,
}

impl Channel {
    /// Every defined channel, in declaration order.
    pub const ALL: [Self; 3] = [Self::Status, Self::WorkerStatus, Self::MonitorEvents];

    /// Wire name used by the dashboard (`status`, `workerStatus`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::WorkerStatus => "workerStatus",
            Self::MonitorEvents => "monitorEvents",
        }
    }

    /// Path of the streaming endpoint, relative to the controller base URL.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Status => "/status",
            Self::WorkerStatus => "/monitor/worker",
            Self::MonitorEvents => "/monitor/events",
        }
    }

    /// Decodes one frame's JSON text into this channel's snapshot type.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::FrameParse`] if the text is not JSON or does not
    /// match the channel's payload shape.
    pub fn parse_frame(self, text: &str) -> Result<Snapshot, FeedError> {
        let wrap = |source| FeedError::FrameParse {
            channel: self,
            source,
        };
        let snapshot = match self {
            Self::Status => Snapshot::Status(serde_json::from_str(text).map_err(wrap)?),
            Self::WorkerStatus => Snapshot::WorkerStatus(serde_json::from_str(text).map_err(wrap)?),
            Self::MonitorEvents => {
                Snapshot::MonitorEvents(serde_json::from_str(text).map_err(wrap)?)
            }
        };
        Ok(snapshot)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| FeedError::UnknownChannel(s.to_string()))
    }
}

/// Compile-time binding between a [`Channel`] and its payload type.
///
/// Implemented by zero-sized markers so that typed subscriptions receive
/// `&Self::Snapshot` without matching on [`Snapshot`] themselves.
pub trait ChannelKind: Send + Sync + 'static {
    /// Payload delivered on every frame of this channel.
    type Snapshot: Clone + Send + Sync + 'static;

    /// The channel this marker stands for.
    const CHANNEL: Channel;

    /// Borrows the typed payload out of a channel-tagged snapshot.
    fn extract(snapshot: &Snapshot) -> Option<&Self::Snapshot>;
}

/// Marker for [`Channel::Status`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusChannel;

/// Marker for [`Channel::WorkerStatus`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStatusChannel;

/// Marker for [`Channel::MonitorEvents`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorEventsChannel;

impl ChannelKind for StatusChannel {
    type Snapshot = StatusSnapshot;
    const CHANNEL: Channel = Channel::Status;

    fn extract(snapshot: &Snapshot) -> Option<&Self::Snapshot> {
        match snapshot {
            Snapshot::Status(s) => Some(s),
            _ => None,
        }
    }
}

impl ChannelKind for WorkerStatusChannel {
    type Snapshot = WorkerStatusSnapshot;
    const CHANNEL: Channel = Channel::WorkerStatus;

    fn extract(snapshot: &Snapshot) -> Option<&Self::Snapshot> {
        match snapshot {
            Snapshot::WorkerStatus(s) => Some(s),
            _ => None,
        }
    }
}

impl ChannelKind for MonitorEventsChannel {
    type Snapshot = MonitorEventsSnapshot;
    const CHANNEL: Channel = Channel::MonitorEvents;

    fn extract(snapshot: &Snapshot) -> Option<&Self::Snapshot> {
        match snapshot {
            Snapshot::MonitorEvents(s) => Some(s),
            _ => None,
        }
    }
}
