//! Channel registry: connection coalescing and snapshot fan-out.
//!
//! [`ChannelRegistry`] maps each [`Channel`] to its ordered observer list
//! and to the single [`ConnectionManager`] serving it. The first observer
//! of a channel starts the connection; the last one leaving tears it down.
//! The registry is an explicit service object: construct it once and hand
//! clones to whoever needs to subscribe.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::Url;
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use super::subscription::{Subscription, SubscriptionId};
use crate::config::FeedConfig;
use crate::domain::{Channel, ChannelKind, CredentialProvider, Snapshot};
use crate::error::FeedError;
use crate::stream::{
    ConnectionDeps, ConnectionManager, ConnectionStatus, HttpTransport, RetryPolicy, SnapshotSink,
    TokioTimer,
};

/// Observer callback. Invoked synchronously, in registration order, on the
/// task that received the frame.
pub type Callback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// One registered callback. The registry drops its reference to the
/// closure as soon as the subscription is detached.
struct ObserverEntry {
    id: SubscriptionId,
    callback: Mutex<Option<Callback>>,
}

impl ObserverEntry {
    fn callback(&self) -> Option<Callback> {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Arc::clone)
    }

    fn release(&self) {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[derive(Default)]
struct ChannelSlot {
    observers: Vec<Arc<ObserverEntry>>,
    connection: Option<ConnectionManager>,
    /// Bumped for every new connection; frames from older ones are ignored.
    generation: u64,
    last_snapshot: Option<Snapshot>,
}

impl ChannelSlot {
    /// A manager counts from the moment it is spawned until its driver
    /// stops, so a subscribe racing a fresh connection never starts a second.
    fn has_live_connection(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| !c.is_finished())
    }
}

/// Shared state behind every [`ChannelRegistry`] clone.
pub(crate) struct RegistryInner {
    endpoints: HashMap<Channel, Url>,
    policy: RetryPolicy,
    replay_last_snapshot: bool,
    deps: ConnectionDeps,
    runtime: Handle,
    slots: Mutex<HashMap<Channel, ChannelSlot>>,
}

impl RegistryInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<Channel, ChannelSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a fresh connection for `channel`. Any previous manager in the
    /// slot is returned so the caller can drop it outside the lock.
    fn connect(
        self: &Arc<Self>,
        channel: Channel,
        slot: &mut ChannelSlot,
    ) -> Option<ConnectionManager> {
        let Some(endpoint) = self.endpoints.get(&channel).cloned() else {
            error!(channel = %channel, "no endpoint configured");
            return None;
        };

        slot.generation += 1;
        let generation = slot.generation;
        let registry = Arc::downgrade(self);
        let sink: SnapshotSink = Arc::new(move |snapshot| {
            if let Some(registry) = registry.upgrade() {
                registry.deliver(channel, generation, snapshot);
            }
        });

        info!(channel = %channel, generation, "starting connection");
        let manager = ConnectionManager::spawn(
            &self.runtime,
            channel,
            endpoint,
            self.policy,
            self.deps.clone(),
            sink,
        );
        slot.connection.replace(manager)
    }

    /// Delivers a snapshot from connection `generation`, unless that
    /// connection has since been torn down.
    fn deliver(&self, channel: Channel, generation: u64, snapshot: Snapshot) {
        let observers = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(&channel) else {
                return;
            };
            if slot.generation != generation || slot.connection.is_none() {
                debug!(channel = %channel, generation, "dropping frame from closed connection");
                return;
            }
            if self.replay_last_snapshot {
                slot.last_snapshot = Some(snapshot.clone());
            }
            slot.observers.clone()
        };
        fan_out(channel, &observers, &snapshot);
    }

    /// Removes one observer; tears the connection down if it was the last.
    pub(super) fn detach(&self, channel: Channel, id: SubscriptionId) {
        let closed = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(&channel) else {
                return;
            };
            let Some(pos) = slot.observers.iter().position(|o| o.id == id) else {
                return;
            };
            let entry = slot.observers.remove(pos);
            entry.release();
            debug!(channel = %channel, subscription = %id, remaining = slot.observers.len(), "observer detached");

            if slot.observers.is_empty() {
                slot.last_snapshot = None;
                slot.connection.take()
            } else {
                None
            }
        };

        if let Some(connection) = closed {
            info!(channel = %channel, "last observer left; closing connection");
            connection.close();
        }
    }
}

/// Invokes every live callback in order. Returns how many completed.
///
/// Each entry is checked right before its call, so an observer detached by
/// an earlier callback of the same fan-out is skipped.
fn fan_out(channel: Channel, observers: &[Arc<ObserverEntry>], snapshot: &Snapshot) -> usize {
    observers
        .iter()
        .filter_map(|entry| entry.callback().map(|callback| (entry.id, callback)))
        .filter(|(id, callback)| invoke(channel, *id, callback, snapshot))
        .count()
}

/// Runs one callback. A panic is logged and contained so the remaining
/// observers still receive the snapshot.
fn invoke(channel: Channel, id: SubscriptionId, callback: &Callback, snapshot: &Snapshot) -> bool {
    let outcome = catch_unwind(AssertUnwindSafe(|| callback(snapshot)));
    if outcome.is_err() {
        error!(channel = %channel, subscription = %id, "observer panicked; continuing fan-out");
    }
    outcome.is_ok()
}

/// Registry of channel observers and their shared connections.
///
/// Cheap to clone; clones share the same connections and observers.
/// Dropping the last clone closes every connection.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.inner.slots();
        let mut map = f.debug_map();
        for (channel, slot) in slots.iter() {
            let state = slot.connection.as_ref().map(ConnectionManager::state);
            map.entry(channel, &(slot.observers.len(), state));
        }
        map.finish()
    }
}

impl ChannelRegistry {
    /// Creates a registry with explicit collaborators.
    ///
    /// Must be called within a Tokio runtime; connections are spawned on it.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::NoRuntime`] outside a runtime, or
    /// [`FeedError::InvalidConfig`] if the base URL is not absolute.
    pub fn new(config: &FeedConfig, deps: ConnectionDeps) -> Result<Self, FeedError> {
        let runtime = Handle::try_current().map_err(|_| FeedError::NoRuntime)?;

        let mut endpoints = HashMap::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            endpoints.insert(channel, config.endpoint(channel)?);
        }

        let inner = RegistryInner {
            endpoints,
            policy: RetryPolicy {
                backoff: config.backoff,
                stop_on_rejected_credential: config.stop_on_rejected_credential,
            },
            replay_last_snapshot: config.replay_last_snapshot,
            deps,
            runtime,
            slots: Mutex::new(HashMap::new()),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Creates a registry that streams over HTTP with the Tokio timer.
    ///
    /// # Errors
    ///
    /// See [`Self::new`]; also fails if the HTTP client cannot be built.
    pub fn http(
        config: &FeedConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, FeedError> {
        let deps = ConnectionDeps {
            credentials,
            transport: Arc::new(HttpTransport::new(config.connect_timeout)?),
            timer: Arc::new(TokioTimer),
        };
        Self::new(config, deps)
    }

    /// Registers `callback` for every future snapshot on `channel`.
    ///
    /// The callback is appended after existing observers. If the channel has
    /// no running connection, one is started. With snapshot replay enabled,
    /// the channel's last snapshot is handed to `callback` before this
    /// returns.
    pub fn subscribe<F>(&self, channel: Channel, callback: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        let callback: Callback = Arc::new(callback);
        let entry = Arc::new(ObserverEntry {
            id,
            callback: Mutex::new(Some(Arc::clone(&callback))),
        });

        let (replaced, replay) = {
            let mut slots = self.inner.slots();
            let slot = slots.entry(channel).or_default();
            slot.observers.push(entry);
            debug!(channel = %channel, subscription = %id, observers = slot.observers.len(), "observer attached");

            let replaced = if slot.has_live_connection() {
                None
            } else {
                self.inner.connect(channel, slot)
            };
            let replay = if self.inner.replay_last_snapshot {
                slot.last_snapshot.clone()
            } else {
                None
            };
            (replaced, replay)
        };
        drop(replaced);

        if let Some(snapshot) = replay {
            debug!(channel = %channel, subscription = %id, "replaying last snapshot");
            invoke(channel, id, &callback, &snapshot);
        }

        Subscription::new(id, channel, Arc::downgrade(&self.inner))
    }

    /// Typed variant of [`Self::subscribe`]: the callback receives the
    /// channel's own payload type.
    pub fn subscribe_to<K, F>(&self, callback: F) -> Subscription
    where
        K: ChannelKind,
        F: Fn(&K::Snapshot) + Send + Sync + 'static,
    {
        self.subscribe(K::CHANNEL, move |snapshot| {
            if let Some(typed) = K::extract(snapshot) {
                callback(typed);
            }
        })
    }

    /// Delivers `snapshot` to every observer of its channel, in registration
    /// order. Returns the number of callbacks that completed.
    ///
    /// Connections call this for every decoded frame; it is public so that
    /// snapshots from other sources (tests, a manual refresh) reach the same
    /// observers.
    pub fn broadcast(&self, snapshot: &Snapshot) -> usize {
        let channel = snapshot.channel();
        let observers = {
            let mut slots = self.inner.slots();
            let Some(slot) = slots.get_mut(&channel) else {
                return 0;
            };
            if self.inner.replay_last_snapshot && !slot.observers.is_empty() {
                slot.last_snapshot = Some(snapshot.clone());
            }
            slot.observers.clone()
        };
        fan_out(channel, &observers, snapshot)
    }

    /// Number of callbacks registered on `channel`.
    #[must_use]
    pub fn observer_count(&self, channel: Channel) -> usize {
        self.inner
            .slots()
            .get(&channel)
            .map_or(0, |slot| slot.observers.len())
    }

    /// Returns `true` if `channel` has a connection that has not stopped.
    #[must_use]
    pub fn is_connected(&self, channel: Channel) -> bool {
        self.inner
            .slots()
            .get(&channel)
            .is_some_and(ChannelSlot::has_live_connection)
    }

    /// Status of `channel`'s current connection, if it has one.
    #[must_use]
    pub fn connection_status(&self, channel: Channel) -> Option<ConnectionStatus> {
        self.inner
            .slots()
            .get(&channel)
            .and_then(|slot| slot.connection.as_ref().map(ConnectionManager::status))
    }

    /// Closes every connection while keeping all observers registered.
    ///
    /// Pending backoff waits are cancelled. Use [`Self::resume_idle`] to
    /// reconnect, e.g. after a new login.
    pub fn suspend_all(&self) {
        let closed: Vec<ConnectionManager> = {
            let mut slots = self.inner.slots();
            slots
                .values_mut()
                .filter_map(|slot| slot.connection.take())
                .collect()
        };
        if !closed.is_empty() {
            info!(connections = closed.len(), "suspending all connections");
        }
        for connection in closed {
            connection.close();
        }
    }

    /// Starts a connection for every channel that has observers but no
    /// running connection. Returns the channels that were started.
    pub fn resume_idle(&self) -> Vec<Channel> {
        let mut started = Vec::new();
        let mut replaced = Vec::new();
        {
            let mut slots = self.inner.slots();
            for (channel, slot) in slots.iter_mut() {
                if slot.observers.is_empty() || slot.has_live_connection() {
                    continue;
                }
                replaced.extend(self.inner.connect(*channel, slot));
                started.push(*channel);
            }
        }
        drop(replaced);
        started.sort();
        started
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::{Credential, CredentialStore, StatusChannel, WorkerStatusChannel};
    use crate::stream::testing::{CountingTimer, ScriptedTransport, settle};
    use crate::stream::{ConnectionState, Timer, Transport};

    const BACKOFF: Duration = Duration::from_millis(5000);

    type Log = Arc<Mutex<Vec<(&'static str, u64)>>>;

    struct Fixture {
        registry: ChannelRegistry,
        store: CredentialStore,
        transport: Arc<ScriptedTransport>,
        timer: Arc<CountingTimer>,
        log: Log,
    }

    impl Fixture {
        fn new(config: FeedConfig, credential: Option<Credential>) -> Self {
            let store = CredentialStore::new();
            if let Some(c) = credential {
                store.login(c);
            }
            let transport = ScriptedTransport::new();
            let timer = CountingTimer::new();
            let deps = ConnectionDeps {
                credentials: Arc::new(store.clone()),
                transport: Arc::clone(&transport) as Arc<dyn Transport>,
                timer: Arc::clone(&timer) as Arc<dyn Timer>,
            };
            let Ok(registry) = ChannelRegistry::new(&config, deps) else {
                panic!("registry construction failed");
            };
            Self {
                registry,
                store,
                transport,
                timer,
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn authenticated() -> Self {
            Self::new(FeedConfig::default().with_backoff(BACKOFF), Some(Credential::bearer("t")))
        }

        /// Callback that logs `(tag, queue)` for status snapshots.
        fn recorder(&self, tag: &'static str) -> impl Fn(&Snapshot) + Send + Sync + 'static {
            let log = Arc::clone(&self.log);
            move |snapshot| {
                let queue = snapshot.as_status().map_or(u64::MAX, |s| s.queue);
                log.lock().unwrap_or_else(PoisonError::into_inner).push((tag, queue));
            }
        }

        fn log(&self) -> Vec<(&'static str, u64)> {
            self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    fn status_frame(queue: u64) -> String {
        format!(r#"{{"queue":{queue}}}"#)
    }

    #[test]
    fn construction_requires_runtime() {
        let deps = ConnectionDeps {
            credentials: Arc::new(CredentialStore::new()),
            transport: ScriptedTransport::new() as Arc<dyn Transport>,
            timer: CountingTimer::new() as Arc<dyn Timer>,
        };
        let result = ChannelRegistry::new(&FeedConfig::default(), deps);
        assert!(matches!(result, Err(FeedError::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn observers_share_one_connection() {
        let f = Fixture::authenticated();
        let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));
        let _c = f.registry.subscribe(Channel::Status, f.recorder("c"));
        settle().await;

        assert_eq!(f.transport.open_calls(), 1);
        assert_eq!(f.registry.observer_count(Channel::Status), 3);
        assert!(f.registry.is_connected(Channel::Status));
    }

    fn generation(registry: &ChannelRegistry, channel: Channel) -> Option<u64> {
        registry.inner.slots().get(&channel).map(|slot| slot.generation)
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_subscribes_spawn_a_single_manager() {
        let f = Fixture::authenticated();
        let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));
        let _c = f.registry.subscribe(Channel::Status, f.recorder("c"));

        assert_eq!(generation(&f.registry, Channel::Status), Some(1));
        assert!(f.registry.is_connected(Channel::Status));

        settle().await;
        assert_eq!(generation(&f.registry, Channel::Status), Some(1));
        assert_eq!(f.transport.open_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runtime_never_opens_two_transports_per_channel() {
        for _ in 0..200 {
            let f = Fixture::authenticated();
            let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
            let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));
            assert_eq!(generation(&f.registry, Channel::Status), Some(1));

            let mut waited = 0;
            while f.transport.open_calls() == 0 && waited < 1000 {
                tokio::time::sleep(Duration::from_millis(1)).await;
                waited += 1;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            assert_eq!(f.transport.open_calls(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn frames_reach_every_observer_in_registration_order() {
        let f = Fixture::authenticated();
        let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));
        settle().await;

        for queue in 1..=3 {
            f.transport.push(0, &status_frame(queue));
        }
        settle().await;

        assert_eq!(
            f.log(),
            vec![("a", 1), ("b", 1), ("a", 2), ("b", 2), ("a", 3), ("b", 3)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_gets_no_replay_by_default() {
        let f = Fixture::authenticated();
        let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        settle().await;
        f.transport.push(0, &status_frame(1));
        settle().await;

        let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));
        assert_eq!(f.log(), vec![("a", 1)]);

        f.transport.push(0, &status_frame(2));
        settle().await;
        assert_eq!(f.log(), vec![("a", 1), ("a", 2), ("b", 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_gets_last_snapshot_when_replay_enabled() {
        let config = FeedConfig::default().with_replay_last_snapshot(true);
        let f = Fixture::new(config, Some(Credential::bearer("t")));
        let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        settle().await;
        f.transport.push(0, &status_frame(7));
        settle().await;

        let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));
        assert_eq!(f.log(), vec![("a", 7), ("b", 7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn detached_observer_is_not_invoked() {
        let f = Fixture::authenticated();
        let a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));
        settle().await;

        a.unsubscribe();
        f.transport.push(0, &status_frame(1));
        settle().await;

        assert_eq!(f.log(), vec![("b", 1)]);
        assert!(f.registry.is_connected(Channel::Status));
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_is_idempotent() {
        let f = Fixture::authenticated();
        let a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));

        a.unsubscribe();
        a.unsubscribe();
        assert!(!a.is_active());
        assert_eq!(f.registry.observer_count(Channel::Status), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_unsubscribe_closes_transport_and_next_subscribe_opens_new_one() {
        let f = Fixture::authenticated();
        let a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        settle().await;
        assert!(!f.transport.is_closed(0));

        a.unsubscribe();
        assert!(!f.registry.is_connected(Channel::Status));
        assert!(f.registry.connection_status(Channel::Status).is_none());
        settle().await;
        assert!(f.transport.is_closed(0));

        let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));
        settle().await;
        assert_eq!(f.transport.open_count(), 2);
        assert!(!f.transport.is_closed(1));
        assert_eq!(f.transport.open_transports(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_detaches() {
        let f = Fixture::authenticated();
        {
            let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
            assert_eq!(f.registry.observer_count(Channel::Status), 1);
        }
        assert_eq!(f.registry.observer_count(Channel::Status), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn detached_callback_is_released() {
        let f = Fixture::authenticated();
        let token = Arc::new(());
        let held = Arc::clone(&token);
        let sub = f.registry.subscribe(Channel::Status, move |_| {
            let _ = &held;
        });
        assert_eq!(Arc::strong_count(&token), 2);

        sub.unsubscribe();
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credential_never_opens_or_notifies() {
        let f = Fixture::new(FeedConfig::default(), None);
        let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        settle().await;
        tokio::time::advance(BACKOFF * 4).await;
        settle().await;

        assert_eq!(f.transport.open_calls(), 0);
        assert!(f.log().is_empty());
        assert!(!f.registry.is_connected(Channel::Status));
        assert_eq!(
            f.registry.connection_status(Channel::Status).map(|s| s.state),
            Some(ConnectionState::Idle)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_subscribe_after_login_connects() {
        let f = Fixture::new(FeedConfig::default(), None);
        let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        settle().await;

        f.store.login(Credential::bearer("late"));
        let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));
        settle().await;

        assert_eq!(f.transport.open_count(), 1);
        f.transport.push(0, &status_frame(5));
        settle().await;
        assert_eq!(f.log(), vec![("a", 5), ("b", 5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_idle_retries_after_login() {
        let f = Fixture::new(FeedConfig::default(), None);
        let _a = f.registry.subscribe(Channel::WorkerStatus, f.recorder("a"));
        settle().await;
        assert_eq!(f.registry.resume_idle(), vec![Channel::WorkerStatus]);
        settle().await;
        assert_eq!(f.transport.open_calls(), 0);

        f.store.login(Credential::bearer("late"));
        assert_eq!(f.registry.resume_idle(), vec![Channel::WorkerStatus]);
        settle().await;
        assert_eq!(f.transport.open_count(), 1);
        assert!(f.registry.resume_idle().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn observers_survive_reconnect() {
        let f = Fixture::authenticated();
        let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));
        settle().await;

        f.transport.fail(0, FeedError::StreamClosed);
        settle().await;
        assert_eq!(
            f.registry.connection_status(Channel::Status).map(|s| s.state),
            Some(ConnectionState::Backoff)
        );
        tokio::time::advance(BACKOFF).await;
        settle().await;

        f.transport.push(1, &status_frame(4));
        settle().await;
        assert_eq!(f.log(), vec![("a", 4), ("b", 4)]);
        assert_eq!(f.registry.observer_count(Channel::Status), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn last_unsubscribe_during_backoff_cancels_reconnect() {
        let f = Fixture::authenticated();
        let a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        settle().await;

        f.transport.fail(0, FeedError::StreamClosed);
        settle().await;
        assert_eq!(f.timer.sleeps(), 1);

        a.unsubscribe();
        settle().await;
        tokio::time::advance(BACKOFF * 3).await;
        settle().await;

        assert_eq!(f.transport.open_calls(), 1);
        assert_eq!(f.transport.open_transports(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_does_not_disturb_observers() {
        let f = Fixture::authenticated();
        let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));
        settle().await;

        f.transport.push(0, "not-json");
        f.transport.push(0, &status_frame(3));
        settle().await;

        assert_eq!(f.log(), vec![("a", 3), ("b", 3)]);
        assert_eq!(
            f.registry.connection_status(Channel::Status).map(|s| s.state),
            Some(ConnectionState::Open)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_observer_does_not_block_the_rest() {
        let f = Fixture::authenticated();
        let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        let _boom = f.registry.subscribe(Channel::Status, |_| panic!("observer bug"));
        let _c = f.registry.subscribe(Channel::Status, f.recorder("c"));
        settle().await;

        f.transport.push(0, &status_frame(1));
        f.transport.push(0, &status_frame(2));
        settle().await;

        assert_eq!(f.log(), vec![("a", 1), ("c", 1), ("a", 2), ("c", 2)]);
        assert!(f.registry.is_connected(Channel::Status));
    }

    #[tokio::test(start_paused = true)]
    async fn observer_may_unsubscribe_itself_during_fan_out() {
        let f = Fixture::authenticated();
        let own: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&own);
        let log = Arc::clone(&f.log);
        let sub = f.registry.subscribe(Channel::Status, move |_| {
            log.lock().unwrap_or_else(PoisonError::into_inner).push(("once", 0));
            if let Some(sub) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                sub.unsubscribe();
            }
        });
        *own.lock().unwrap_or_else(PoisonError::into_inner) = Some(sub);
        let _keep = f.registry.subscribe(Channel::Status, f.recorder("keep"));
        settle().await;

        f.transport.push(0, &status_frame(1));
        f.transport.push(0, &status_frame(2));
        settle().await;

        assert_eq!(f.log(), vec![("once", 0), ("keep", 1), ("keep", 2)]);
        assert_eq!(f.registry.observer_count(Channel::Status), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_detached_earlier_in_the_same_fan_out_is_skipped() {
        let f = Fixture::authenticated();
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let target = Arc::clone(&victim);
        let log = Arc::clone(&f.log);
        let _first = f.registry.subscribe(Channel::Status, move |_| {
            log.lock().unwrap_or_else(PoisonError::into_inner).push(("first", 0));
            if let Some(sub) = target.lock().unwrap_or_else(PoisonError::into_inner).take() {
                sub.unsubscribe();
            }
        });
        let second = f.registry.subscribe(Channel::Status, f.recorder("second"));
        *victim.lock().unwrap_or_else(PoisonError::into_inner) = Some(second);
        settle().await;

        f.transport.push(0, &status_frame(1));
        settle().await;

        assert_eq!(f.log(), vec![("first", 0)]);
        assert_eq!(f.registry.observer_count(Channel::Status), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn channels_are_independent() {
        let f = Fixture::authenticated();
        let _s = f.registry.subscribe(Channel::Status, f.recorder("status"));
        let _w = f.registry.subscribe(Channel::WorkerStatus, f.recorder("worker"));
        settle().await;

        assert_eq!(f.transport.open_count(), 2);
        let paths: Vec<String> = (0..2)
            .filter_map(|i| f.transport.endpoint(i).map(|u| u.path().to_string()))
            .collect();
        assert!(paths.contains(&"/status".to_string()));
        assert!(paths.contains(&"/monitor/worker".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn typed_subscription_receives_payload_type() {
        let f = Fixture::authenticated();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = f.registry.subscribe_to::<StatusChannel, _>(move |status| {
            sink.lock().unwrap_or_else(PoisonError::into_inner).push(status.queue);
        });
        settle().await;

        f.transport.push(0, &status_frame(11));
        settle().await;
        assert_eq!(*seen.lock().unwrap_or_else(PoisonError::into_inner), vec![11]);
    }

    #[tokio::test(start_paused = true)]
    async fn typed_worker_subscription() {
        let f = Fixture::authenticated();
        let healthy = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&healthy);
        let _sub = f.registry.subscribe_to::<WorkerStatusChannel, _>(move |workers| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(workers.healthy_count());
        });
        settle().await;

        f.transport.push(0, r#"{"w1":{"status":"health"},"w2":{"status":"dead"}}"#);
        settle().await;
        assert_eq!(*healthy.lock().unwrap_or_else(PoisonError::into_inner), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_keeps_observers_and_resume_reconnects() {
        let f = Fixture::authenticated();
        let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        let _w = f.registry.subscribe(Channel::MonitorEvents, f.recorder("m"));
        settle().await;
        assert_eq!(f.transport.open_transports(), 2);

        f.store.logout();
        f.registry.suspend_all();
        settle().await;
        assert_eq!(f.transport.open_transports(), 0);
        assert_eq!(f.registry.observer_count(Channel::Status), 1);
        assert!(!f.registry.is_connected(Channel::Status));

        f.store.login(Credential::bearer("again"));
        let started = f.registry.resume_idle();
        assert_eq!(started, vec![Channel::Status, Channel::MonitorEvents]);
        settle().await;
        assert_eq!(f.transport.open_transports(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_is_not_delivered() {
        let f = Fixture::authenticated();
        let a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        a.unsubscribe();
        let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));

        f.registry
            .inner
            .deliver(Channel::Status, 1, Snapshot::Status(Default::default()));
        assert!(f.log().is_empty());

        f.registry.inner.deliver(
            Channel::Status,
            2,
            Snapshot::Status(crate::domain::StatusSnapshot {
                queue: 8,
                ..Default::default()
            }),
        );
        assert_eq!(f.log(), vec![("b", 8)]);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_counts_completed_callbacks() {
        let f = Fixture::authenticated();
        let empty = Snapshot::empty(Channel::WorkerStatus);
        assert_eq!(f.registry.broadcast(&empty), 0);

        let _a = f.registry.subscribe(Channel::Status, f.recorder("a"));
        let _b = f.registry.subscribe(Channel::Status, f.recorder("b"));
        assert_eq!(f.registry.broadcast(&Snapshot::empty(Channel::Status)), 2);
        assert_eq!(f.log(), vec![("a", 0), ("b", 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_registry_closes_connections() {
        let f = Fixture::authenticated();
        let sub = f.registry.subscribe(Channel::Status, f.recorder("a"));
        settle().await;
        assert_eq!(f.transport.open_transports(), 1);

        drop(f.registry);
        settle().await;
        assert_eq!(f.transport.open_transports(), 0);

        sub.unsubscribe();
        assert!(!sub.is_active());
    }
}
