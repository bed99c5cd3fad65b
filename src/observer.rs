//! Observer binding for presentation code.
//!
//! An [`ObserverBinding`] turns a channel subscription into a readable
//! `{value, is_loading}` pair. `is_loading` starts `true` and flips to
//! `false` on the first snapshot; reconnects never flip it back. Switching
//! the channel detaches the old subscription before attaching the new one.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

use crate::domain::{Channel, Snapshot};
use crate::registry::{ChannelRegistry, Subscription};

/// What a view renders: the latest snapshot (or the fallback) and whether
/// any snapshot has arrived yet.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingView {
    /// Latest snapshot, or the fallback until the first one arrives.
    pub value: Snapshot,
    /// `true` until the first snapshot of the current channel arrives.
    pub is_loading: bool,
}

impl BindingView {
    fn loading(fallback: Snapshot) -> Self {
        Self {
            value: fallback,
            is_loading: true,
        }
    }
}

/// Live `{value, is_loading}` view over one channel.
///
/// Dropping the binding detaches its subscription.
pub struct ObserverBinding {
    registry: ChannelRegistry,
    channel: Channel,
    view: Arc<watch::Sender<BindingView>>,
    /// Incremented on every switch; callbacks from older activations are
    /// ignored.
    epoch: Arc<AtomicU64>,
    subscription: Option<Subscription>,
}

impl fmt::Debug for ObserverBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverBinding")
            .field("channel", &self.channel)
            .field("is_loading", &self.is_loading())
            .finish_non_exhaustive()
    }
}

impl ObserverBinding {
    /// Binds to `channel`, showing `fallback` until the first snapshot.
    #[must_use]
    pub fn new(registry: &ChannelRegistry, channel: Channel, fallback: Snapshot) -> Self {
        let (view, _) = watch::channel(BindingView::loading(fallback));
        let mut binding = Self {
            registry: registry.clone(),
            channel,
            view: Arc::new(view),
            epoch: Arc::new(AtomicU64::new(0)),
            subscription: None,
        };
        binding.attach();
        binding
    }

    /// Binds to `channel` with an empty snapshot as the fallback.
    #[must_use]
    pub fn with_empty_fallback(registry: &ChannelRegistry, channel: Channel) -> Self {
        Self::new(registry, channel, Snapshot::empty(channel))
    }

    /// Channel currently bound.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Copy of the current view.
    #[must_use]
    pub fn view(&self) -> BindingView {
        self.view.borrow().clone()
    }

    /// Latest snapshot, or the fallback.
    #[must_use]
    pub fn value(&self) -> Snapshot {
        self.view.borrow().value.clone()
    }

    /// `true` until the first snapshot of the current channel arrives.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.view.borrow().is_loading
    }

    /// Receiver notified whenever the view changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<BindingView> {
        self.view.subscribe()
    }

    /// Rebinds to `channel`. The previous subscription is detached first,
    /// then the view resets to loading with `fallback`. Rebinding to the
    /// current channel does nothing.
    pub fn switch_channel(&mut self, channel: Channel, fallback: Snapshot) {
        if channel == self.channel && self.subscription.is_some() {
            return;
        }
        if let Some(previous) = self.subscription.take() {
            previous.unsubscribe();
        }

        self.channel = channel;
        self.view.send_modify(|view| {
            self.epoch.fetch_add(1, Ordering::AcqRel);
            *view = BindingView::loading(fallback);
        });
        self.attach();
    }

    fn attach(&mut self) {
        let epoch = self.epoch.load(Ordering::Acquire);
        let current = Arc::clone(&self.epoch);
        let view = Arc::clone(&self.view);

        let subscription = self.registry.subscribe(self.channel, move |snapshot| {
            view.send_if_modified(|v| {
                if current.load(Ordering::Acquire) != epoch {
                    return false;
                }
                v.value = snapshot.clone();
                v.is_loading = false;
                true
            });
        });
        self.subscription = Some(subscription);
    }
}
