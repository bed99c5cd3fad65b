//! Feed configuration loaded from environment variables.
//!
//! All settings come from environment variables (or a `.env` file via
//! `dotenvy`). Missing or unparsable numeric and boolean values fall back
//! to the defaults; only a malformed base URL is an error.

use std::time::Duration;

use reqwest::Url;

use crate::domain::Channel;
use crate::error::FeedError;

/// Default controller address used by the dashboard.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Fixed delay between a transport failure and the next attempt.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(5000);

/// Default timeout for establishing a streaming connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Top-level feed configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Controller base URL; channel paths are joined onto it.
    pub base_url: String,

    /// Delay spent in `Backoff` before reconnecting. No growth, no jitter.
    pub backoff: Duration,

    /// Timeout for the connection handshake of the HTTP transport.
    pub connect_timeout: Duration,

    /// Replay each channel's last snapshot to new subscribers.
    pub replay_last_snapshot: bool,

    /// Send a connection to `Idle` instead of `Backoff` on HTTP 401/403.
    pub stop_on_rejected_credential: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            backoff: DEFAULT_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            replay_last_snapshot: false,
            stop_on_rejected_credential: false,
        }
    }
}

impl FeedConfig {
    /// Loads configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::InvalidConfig`] if `FEED_BASE_URL` is set but is
    /// not an absolute URL.
    pub fn from_env() -> Result<Self, FeedError> {
        dotenvy::dotenv().ok();

        let base_url =
            std::env::var("FEED_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        parse_base_url(&base_url)?;

        let backoff = Duration::from_millis(parse_env("FEED_BACKOFF_MS", 5000));
        let connect_timeout = Duration::from_secs(parse_env("FEED_CONNECT_TIMEOUT_SECS", 10));
        let replay_last_snapshot = parse_env_bool("FEED_REPLAY_LAST_SNAPSHOT", false);
        let stop_on_rejected_credential =
            parse_env_bool("FEED_STOP_ON_REJECTED_CREDENTIAL", false);

        Ok(Self {
            base_url,
            backoff,
            connect_timeout,
            replay_last_snapshot,
            stop_on_rejected_credential,
        })
    }

    /// Sets the backoff delay.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enables or disables last-snapshot replay.
    #[must_use]
    pub fn with_replay_last_snapshot(mut self, enabled: bool) -> Self {
        self.replay_last_snapshot = enabled;
        self
    }

    /// Enables or disables stopping on a rejected credential.
    #[must_use]
    pub fn with_stop_on_rejected_credential(mut self, enabled: bool) -> Self {
        self.stop_on_rejected_credential = enabled;
        self
    }

    /// Full URL of a channel's streaming endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::InvalidConfig`] if the base URL is not an
    /// absolute URL.
    pub fn endpoint(&self, channel: Channel) -> Result<Url, FeedError> {
        parse_base_url(&self.base_url)?
            .join(channel.path())
            .map_err(|e| FeedError::InvalidConfig(format!("endpoint for {channel}: {e}")))
    }
}

fn parse_base_url(raw: &str) -> Result<Url, FeedError> {
    Url::parse(raw).map_err(|e| FeedError::InvalidConfig(format!("FEED_BASE_URL {raw:?}: {e}")))
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable as a boolean. Accepts `"true"`, `"1"`,
/// `"false"`, `"0"` (case-insensitive). Returns `default` otherwise.
fn parse_env_bool(key: &str, default: bool) -> bool {
    parse_bool(std::env::var(key).ok().as_deref(), default)
}

fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("true" | "1") => true,
        Some("false" | "0") => false,
        _ => default,
    }
}
