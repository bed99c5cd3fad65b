//! Per-channel connection driver.
//!
//! A [`ConnectionManager`] owns the one transport of its channel. It runs a
//! background task that walks the [`ConnectionState`] machine: resolve the
//! credential, open the transport, hand every decoded frame to the sink,
//! and on failure wait the fixed backoff delay and try again, forever,
//! until it is closed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::Url;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::machine::{ConnectionEvent, ConnectionState, transition};
use super::timer::Timer;
use super::transport::Transport;
use crate::domain::{Channel, CredentialProvider, Snapshot};
use crate::error::FeedError;

/// Receives every successfully decoded snapshot, on the driver task.
pub type SnapshotSink = Arc<dyn Fn(Snapshot) + Send + Sync>;

/// Collaborators shared by every connection of a registry.
#[derive(Clone)]
pub struct ConnectionDeps {
    /// Credential source, queried before every attempt.
    pub credentials: Arc<dyn CredentialProvider>,
    /// Opens the streaming transport.
    pub transport: Arc<dyn Transport>,
    /// Drives the backoff delay.
    pub timer: Arc<dyn Timer>,
}

impl fmt::Debug for ConnectionDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDeps").finish_non_exhaustive()
    }
}

/// Retry behaviour of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed delay between a failure and the next attempt.
    pub backoff: Duration,
    /// Stop (go `Idle`) instead of retrying when the server rejects the
    /// credential.
    pub stop_on_rejected_credential: bool,
}

/// Observable state of one connection. Never delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// Channel this connection serves.
    pub channel: Channel,
    /// Current machine state.
    pub state: ConnectionState,
    /// Number of connection attempts so far (each entry into `Connecting`).
    /// A lookup that finds no credential is not an attempt.
    pub attempts: u64,
    /// Frames decoded and delivered.
    pub frames: u64,
    /// Frames dropped because they failed to decode.
    pub malformed_frames: u64,
    /// Most recent failure, if any.
    pub last_error: Option<String>,
    /// [`FeedError::error_code`] of `last_error`.
    pub last_error_code: Option<u32>,
    /// When `state` last changed.
    pub last_transition_at: DateTime<Utc>,
}

impl ConnectionStatus {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            state: ConnectionState::Idle,
            attempts: 0,
            frames: 0,
            malformed_frames: 0,
            last_error: None,
            last_error_code: None,
            last_transition_at: Utc::now(),
        }
    }
}

/// Handle to the running connection of one channel.
///
/// Dropping or [closing](Self::close) the manager aborts the driver task,
/// which drops the transport and any pending backoff timer.
pub struct ConnectionManager {
    channel: Channel,
    status: Arc<watch::Sender<ConnectionStatus>>,
    /// Set by the driver when it leaves its loop.
    stopped: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("channel", &self.channel)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Starts a connection for `channel` on `runtime`.
    ///
    /// The manager counts as running from the moment this returns, even
    /// while the spawned task is still resolving the credential in `Idle`.
    #[must_use]
    pub fn spawn(
        runtime: &Handle,
        channel: Channel,
        endpoint: Url,
        policy: RetryPolicy,
        deps: ConnectionDeps,
        sink: SnapshotSink,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::new(channel));
        let status = Arc::new(status_tx);
        let stopped = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            channel,
            endpoint,
            policy,
            deps,
            sink,
            state: ConnectionState::Idle,
            status: Arc::clone(&status),
            stopped: Arc::clone(&stopped),
        };
        let task = runtime.spawn(driver.run());

        Self {
            channel,
            status,
            stopped,
            task,
        }
    }

    /// Channel served by this connection.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Current machine state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Copy of the current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Returns `true` once the driver has stopped on its own (missing or
    /// rejected credential) or was closed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.task.is_finished()
    }

    /// Tears the connection down: the driver task is aborted, which drops
    /// the transport and cancels any pending backoff wait.
    pub fn close(self) {
        // Drop does the work.
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.task.abort();
        self.status.send_modify(|s| {
            if let Some(next) = transition(s.state, ConnectionEvent::Drained) {
                s.state = next;
                s.last_transition_at = Utc::now();
            }
        });
        debug!(channel = %self.channel, "connection closed");
    }
}

/// State owned by the background task.
struct Driver {
    channel: Channel,
    endpoint: Url,
    policy: RetryPolicy,
    deps: ConnectionDeps,
    sink: SnapshotSink,
    state: ConnectionState,
    status: Arc<watch::Sender<ConnectionStatus>>,
    stopped: Arc<AtomicBool>,
}

impl Driver {
    async fn run(mut self) {
        self.attempt().await;

        loop {
            match self.state {
                ConnectionState::Connecting => self.attempt().await,
                ConnectionState::Errored => self.step(ConnectionEvent::RetryScheduled),
                ConnectionState::Backoff => {
                    debug!(
                        channel = %self.channel,
                        delay_ms = u64::try_from(self.policy.backoff.as_millis()).unwrap_or(u64::MAX),
                        "backing off"
                    );
                    self.deps.timer.sleep(self.policy.backoff).await;
                    self.step(ConnectionEvent::BackoffElapsed);
                }
                ConnectionState::Idle | ConnectionState::Open => break,
            }
        }

        self.stopped.store(true, Ordering::Release);
        debug!(channel = %self.channel, "connection driver stopped");
    }

    /// Resolves the credential, then one pass through `Connecting`, and
    /// `Open` if the transport opens. Starts in `Idle` (first attempt) or
    /// `Connecting` (after backoff); leaves the machine in `Errored` or
    /// `Idle`.
    async fn attempt(&mut self) {
        let Some(credential) = self.deps.credentials.current().await else {
            warn!(channel = %self.channel, state = %self.state, "no credential available; not connecting");
            self.record_error(&FeedError::MissingCredential);
            if self.state == ConnectionState::Connecting {
                self.step(ConnectionEvent::CredentialMissing);
            }
            return;
        };

        if self.state == ConnectionState::Idle {
            self.step(ConnectionEvent::Subscribed);
        }
        self.status.send_modify(|s| s.attempts += 1);
        let attempt = self.status.borrow().attempts;

        let opened = self.deps.transport.open(&self.endpoint, &credential).await;
        drop(credential);

        let mut frames = match opened {
            Ok(frames) => frames,
            Err(e) => {
                self.fail(&e, attempt);
                return;
            }
        };

        self.step(ConnectionEvent::Opened);
        info!(channel = %self.channel, attempt, endpoint = %self.endpoint, "stream open");

        let error = loop {
            match frames.next().await {
                Some(Ok(text)) => self.handle_frame(&text),
                Some(Err(e)) if e.is_transport() => break e,
                Some(Err(e)) => self.drop_frame(&e),
                None => break FeedError::StreamClosed,
            }
        };
        drop(frames);

        self.fail(&error, attempt);
    }

    fn handle_frame(&mut self, text: &str) {
        match self.channel.parse_frame(text) {
            Ok(snapshot) => {
                self.step(ConnectionEvent::Frame);
                self.status.send_modify(|s| s.frames += 1);
                (self.sink)(snapshot);
            }
            Err(e) => self.drop_frame(&e),
        }
    }

    /// A frame-level failure: logged and counted, the stream stays open.
    fn drop_frame(&mut self, error: &FeedError) {
        warn!(channel = %self.channel, code = error.error_code(), error = %error, "dropping malformed frame");
        self.step(ConnectionEvent::MalformedFrame);
        self.status.send_modify(|s| s.malformed_frames += 1);
    }

    fn fail(&mut self, error: &FeedError, attempt: u64) {
        warn!(channel = %self.channel, attempt, error = %error, "connection failed");
        self.record_error(error);

        let event = if error.is_credential_rejection() && self.policy.stop_on_rejected_credential {
            ConnectionEvent::CredentialRejected
        } else {
            ConnectionEvent::TransportFailed
        };
        self.step(event);
    }

    fn record_error(&self, error: &FeedError) {
        let message = error.to_string();
        let code = error.error_code();
        self.status.send_modify(|s| {
            s.last_error = Some(message);
            s.last_error_code = Some(code);
        });
    }

    fn step(&mut self, event: ConnectionEvent) {
        let Some(next) = transition(self.state, event) else {
            debug!(channel = %self.channel, state = %self.state, ?event, "ignoring event");
            return;
        };
        if next != self.state {
            debug!(channel = %self.channel, from = %self.state, to = %next, "state change");
            self.status.send_modify(|s| {
                s.state = next;
                s.last_transition_at = Utc::now();
            });
        }
        self.state = next;
    }
}
