//! Registry layer: observer lists, connection coalescing and fan-out.

pub mod channel_registry;
pub mod subscription;

pub use channel_registry::{Callback, ChannelRegistry};
pub use subscription::{Subscription, SubscriptionId};
