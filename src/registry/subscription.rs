//! Subscription handles.
//!
//! A [`Subscription`] detaches exactly one callback. Detaching is
//! idempotent and also happens when the handle is dropped.

use std::fmt;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use super::channel_registry::RegistryInner;
use crate::domain::Channel;

/// Unique identifier of one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(uuid::Uuid);

impl SubscriptionId {
    /// Creates a new random `SubscriptionId` (UUID v4).
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle returned by [`super::ChannelRegistry::subscribe`].
///
/// Holds only a weak reference to the registry, so an outstanding handle
/// never keeps the registry or its connections alive.
#[must_use = "dropping a Subscription detaches its callback"]
pub struct Subscription {
    id: SubscriptionId,
    channel: Channel,
    registry: Weak<RegistryInner>,
    detached: AtomicBool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    pub(super) fn new(id: SubscriptionId, channel: Channel, registry: Weak<RegistryInner>) -> Self {
        Self {
            id,
            channel,
            registry,
            detached: AtomicBool::new(false),
        }
    }

    /// Identifier of the registered callback.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Channel the callback is registered on.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Returns `true` until the first call to [`Self::unsubscribe`].
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.detached.load(Ordering::Acquire)
    }

    /// Detaches the callback. Only the first call has any effect.
    ///
    /// When this removes the channel's last observer, its connection is torn
    /// down.
    ///
    /// A fan-out that has not reached this callback yet skips it. A call
    /// that is already running on another thread when this returns is not
    /// interrupted, so the callback may finish one last invocation.
    pub fn unsubscribe(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.channel, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
