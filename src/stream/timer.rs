//! Injected timer used for the backoff delay.
//!
//! The driver never calls `tokio::time` directly, so tests can count and
//! control backoff waits without real wall-clock delays.

use std::time::Duration;

use futures_util::future::BoxFuture;

/// Source of delays for the reconnect loop.
pub trait Timer: Send + Sync + 'static {
    /// Completes after `duration`. Dropping the future cancels the wait.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// [`Timer`] backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}
