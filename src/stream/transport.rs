//! Streaming transport seam and its HTTP implementation.
//!
//! A [`Transport`] opens one long-lived stream per call and hands back its
//! frames. Closing the transport is dropping the returned [`FrameStream`];
//! there is no other cancellation primitive.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use futures_util::Stream;
use futures_util::future::BoxFuture;
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL, HeaderValue};

use super::sse::decode_events;
use crate::domain::Credential;
use crate::error::FeedError;

/// Raw frame text as delivered by an open transport.
///
/// The stream yields `Err` on a transport failure and ends when the server
/// closes the connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, FeedError>> + Send>>;

/// Opens streaming connections to channel endpoints.
pub trait Transport: Send + Sync + 'static {
    /// Opens a stream to `endpoint`, authenticating with `credential`.
    ///
    /// Resolves once the stream is open, i.e. the server accepted the
    /// request and started the event stream.
    fn open<'a>(
        &'a self,
        endpoint: &'a Url,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<FrameStream, FeedError>>;
}

/// [`Transport`] that reads `text/event-stream` responses with `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Creates a transport whose handshake times out after `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Http`] if the HTTP client cannot be built.
    pub fn new(connect_timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self::with_client(client))
    }

    /// Wraps an existing client, e.g. one with custom TLS roots or a proxy.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn open_stream(&self, endpoint: &Url, credential: &Credential) -> Result<FrameStream, FeedError> {
        let authorization = HeaderValue::from_str(&credential.authorization())
            .map_err(|e| FeedError::InvalidHeader(e.to_string()))?;

        let response = self
            .client
            .get(endpoint.clone())
            .header(AUTHORIZATION, authorization)
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .send()
            .await?;

        check_status(response.status())?;

        Ok(Box::pin(decode_events(response.bytes_stream())))
    }
}

impl Transport for HttpTransport {
    fn open<'a>(
        &'a self,
        endpoint: &'a Url,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<FrameStream, FeedError>> {
        Box::pin(self.open_stream(endpoint, credential))
    }
}

/// Maps a response status onto the feed error taxonomy.
fn check_status(status: StatusCode) -> Result<(), FeedError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(FeedError::Rejected {
            status: status.as_u16(),
        });
    }
    Err(FeedError::UnexpectedStatus {
        status: status.as_u16(),
    })
}
