//! Full-state snapshot payloads, one type per channel.
//!
//! Every frame carries the complete current state of its channel, never a
//! delta. All fields default when absent so that partial documents from
//! older controllers still decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use super::Channel;

/// A decoded frame, tagged by the channel it arrived on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Snapshot {
    /// Payload of [`Channel::Status`].
    Status(StatusSnapshot),
    /// Payload of [`Channel::WorkerStatus`].
    WorkerStatus(WorkerStatusSnapshot),
    /// Payload of [`Channel::MonitorEvents`].
    MonitorEvents(MonitorEventsSnapshot),
}

impl Snapshot {
    /// Returns the channel this snapshot belongs to.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        match self {
            Self::Status(_) => Channel::Status,
            Self::WorkerStatus(_) => Channel::WorkerStatus,
            Self::MonitorEvents(_) => Channel::MonitorEvents,
        }
    }

    /// An empty snapshot for `channel`, used as the default fallback value.
    #[must_use]
    pub fn empty(channel: Channel) -> Self {
        match channel {
            Channel::Status => Self::Status(StatusSnapshot::default()),
            Channel::WorkerStatus => Self::WorkerStatus(WorkerStatusSnapshot::default()),
            Channel::MonitorEvents => Self::MonitorEvents(MonitorEventsSnapshot::default()),
        }
    }

    /// Returns the status payload, if this is a status snapshot.
    #[must_use]
    pub const fn as_status(&self) -> Option<&StatusSnapshot> {
        match self {
            Self::Status(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the worker payload, if this is a worker status snapshot.
    #[must_use]
    pub const fn as_worker_status(&self) -> Option<&WorkerStatusSnapshot> {
        match self {
            Self::WorkerStatus(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the event history payload, if this is a monitor snapshot.
    #[must_use]
    pub const fn as_monitor_events(&self) -> Option<&MonitorEventsSnapshot> {
        match self {
            Self::MonitorEvents(s) => Some(s),
            _ => None,
        }
    }
}

/// CPU/memory sample reported by a worker node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerMetrics {
    /// CPU utilisation in percent.
    pub cpu: f64,
    /// Memory utilisation in percent.
    pub mem: f64,
    /// Sample time, seconds since the Unix epoch.
    pub ts: f64,
}

/// Queue and processing state of the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSnapshot {
    /// Number of items waiting in the queue.
    pub queue: u64,
    /// Queued items, head first.
    pub queued_items: Vec<QueuedItem>,
    /// Paths currently being processed.
    pub processing: Vec<String>,
    /// Item path → worker currently holding it.
    pub processing_workers: BTreeMap<String, String>,
    /// Paths that finished processing.
    pub done: Vec<String>,
    /// Item path → last error message. Null messages are skipped.
    #[serde(deserialize_with = "present_messages")]
    pub errors: BTreeMap<String, String>,
    /// Item path → whether the item has been retried. Redis flags such as
    /// `"1"` count as set.
    #[serde(deserialize_with = "retry_flags")]
    pub retries: BTreeMap<String, bool>,
    /// Worker name → latest resource sample.
    pub node_metrics: BTreeMap<String, WorkerMetrics>,
}

/// One entry of the queue listing.
///
/// Controllers send either a bare path or an object carrying the path and
/// the URL that removes it from the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueuedItem {
    /// Object form.
    Entry {
        /// Path of the queued item.
        item: String,
        /// Relative URL that deletes the item from the queue.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delete_url: Option<String>,
    },
    /// Bare path.
    Path(String),
}

impl QueuedItem {
    /// Path of the queued item.
    #[must_use]
    pub fn item(&self) -> &str {
        match self {
            Self::Entry { item, .. } | Self::Path(item) => item,
        }
    }

    /// Delete URL, when the controller sent one.
    #[must_use]
    pub fn delete_url(&self) -> Option<&str> {
        match self {
            Self::Entry { delete_url, .. } => delete_url.as_deref(),
            Self::Path(_) => None,
        }
    }
}

/// Retry marker as stored by workers: a JSON bool, a number, or a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RetryFlag {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl RetryFlag {
    fn is_set(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Number(n) => n.abs() > f64::EPSILON,
            Self::Text(t) => !t.is_empty(),
        }
    }
}

fn retry_flags<'de, D>(deserializer: D) -> Result<BTreeMap<String, bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Option<RetryFlag>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(item, flag)| (item, flag.is_some_and(|f| f.is_set())))
        .collect())
}

fn present_messages<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Option<String>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(item, message)| message.map(|m| (item, m)))
        .collect())
}

/// Health record for a single worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerHealth {
    /// `"health"` when alive; anything else means the worker is considered dead.
    pub status: String,
    /// Latest resource sample, if the worker reported one.
    pub metrics: Option<WorkerMetrics>,
}

impl WorkerHealth {
    /// Returns `true` if the worker reports itself healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == "health"
    }
}

/// Worker name → health record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerStatusSnapshot {
    /// Workers keyed by name.
    pub workers: BTreeMap<String, WorkerHealth>,
}

impl WorkerStatusSnapshot {
    /// Number of workers currently reporting healthy.
    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.workers.values().filter(|w| w.is_healthy()).count()
    }
}

/// One entry of the pipeline event history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorEvent {
    /// Event time, seconds since the Unix epoch.
    pub ts: f64,
    /// Event type (e.g. `"worker_dead"`, `"requeue"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Worker involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Item involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    /// Items put back on the queue as a result of this event.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requeued: Vec<String>,
}

/// Event history, always exposed in the `{events: [...]}` envelope.
///
/// Decodes from either the envelope or a bare JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorEventsSnapshot {
    /// Events in server order.
    pub events: Vec<MonitorEvent>,
}

impl<'de> Deserialize<'de> for MonitorEventsSnapshot {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(default)]
            events: Vec<MonitorEvent>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Envelope(Envelope),
            Bare(Vec<MonitorEvent>),
        }

        let events = match Wire::deserialize(deserializer)? {
            Wire::Envelope(e) => e.events,
            Wire::Bare(events) => events,
        };
        Ok(Self { events })
    }
}
