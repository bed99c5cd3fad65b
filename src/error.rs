//! Feed error types.
//!
//! [`FeedError`] is the single error type of the crate. None of these ever
//! reach observer callbacks: transport failures are absorbed into the
//! backoff loop, frame errors are logged and dropped, and a missing
//! credential is a logged no-op. They surface only through return values of
//! setup functions and through [`crate::stream::ConnectionStatus`].

use crate::domain::Channel;

/// Error enum for the live feed client.
///
/// # Error Code Ranges
///
/// | Range     | Category      |
/// |-----------|---------------|
/// | 1000–1999 | Configuration |
/// | 2000–2999 | Credential    |
/// | 3000–3999 | Transport     |
/// | 4000–4999 | Frame         |
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The HTTP request could not be sent or the body stream failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server refused the credential (401/403).
    #[error("credential rejected by server (HTTP {status})")]
    Rejected {
        /// HTTP status returned by the server.
        status: u16,
    },

    /// The server answered with a non-success status other than 401/403.
    #[error("unexpected HTTP status {status}")]
    UnexpectedStatus {
        /// HTTP status returned by the server.
        status: u16,
    },

    /// The server ended the event stream.
    #[error("event stream closed by server")]
    StreamClosed,

    /// The server sent a line longer than the decoder buffers.
    #[error("event stream line exceeds {limit} bytes")]
    LineTooLong {
        /// Maximum accepted line length in bytes.
        limit: usize,
    },

    /// A frame could not be decoded into the channel's snapshot type.
    #[error("malformed frame on {channel}: {source}")]
    FrameParse {
        /// Channel the frame arrived on.
        channel: Channel,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// No credential was available for a connection attempt.
    #[error("no credential available")]
    MissingCredential,

    /// A channel name outside the known set.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// The credential cannot be encoded as an HTTP header.
    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    /// A configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A registry was created outside a Tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,
}

impl FeedError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidConfig(_) => 1001,
            Self::UnknownChannel(_) => 1002,
            Self::NoRuntime => 1003,
            Self::MissingCredential => 2001,
            Self::Rejected { .. } => 2002,
            Self::InvalidHeader(_) => 2003,
            Self::Http(_) => 3001,
            Self::UnexpectedStatus { .. } => 3002,
            Self::StreamClosed => 3003,
            Self::LineTooLong { .. } => 3004,
            Self::FrameParse { .. } => 4001,
        }
    }

    /// Returns `true` if the server refused the credential.
    #[must_use]
    pub const fn is_credential_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// Returns `true` for failures that end the current connection and
    /// lead into backoff.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::Rejected { .. }
                | Self::UnexpectedStatus { .. }
                | Self::StreamClosed
                | Self::LineTooLong { .. }
                | Self::InvalidHeader(_)
        )
    }
}
