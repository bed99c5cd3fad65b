//! In-memory transport and timer doubles for driving connections in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream;
use reqwest::Url;
use tokio::sync::mpsc;

use super::timer::{Timer, TokioTimer};
use super::transport::{FrameStream, Transport};
use crate::domain::Credential;
use crate::error::FeedError;

/// Lets spawned tasks run without letting paused time auto-advance.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

struct OpenRecord {
    endpoint: Url,
    authorization: String,
    frames: mpsc::UnboundedSender<Result<String, FeedError>>,
}

#[derive(Default)]
struct ScriptState {
    calls: usize,
    opens: Vec<OpenRecord>,
    fail_next: VecDeque<FeedError>,
}

/// Transport whose streams are fed by the test.
///
/// Every successful open gets an index, in open order, through which the
/// test pushes frames, errors, or a server close.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    state: Mutex<ScriptState>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ScriptState) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Makes the next open call fail with `error`.
    pub(crate) fn fail_next_open(&self, error: FeedError) {
        self.with_state(|s| s.fail_next.push_back(error));
    }

    /// Number of `open` calls, successful or not.
    pub(crate) fn open_calls(&self) -> usize {
        self.with_state(|s| s.calls)
    }

    /// Number of successful opens.
    pub(crate) fn open_count(&self) -> usize {
        self.with_state(|s| s.opens.len())
    }

    /// Number of opened streams whose receiving side is still alive.
    pub(crate) fn open_transports(&self) -> usize {
        self.with_state(|s| s.opens.iter().filter(|o| !o.frames.is_closed()).count())
    }

    pub(crate) fn authorization(&self, index: usize) -> Option<String> {
        self.with_state(|s| s.opens.get(index).map(|o| o.authorization.clone()))
    }

    pub(crate) fn endpoint(&self, index: usize) -> Option<Url> {
        self.with_state(|s| s.opens.get(index).map(|o| o.endpoint.clone()))
    }

    /// Returns `true` once the connection dropped stream `index`.
    pub(crate) fn is_closed(&self, index: usize) -> bool {
        self.with_state(|s| s.opens.get(index).is_none_or(|o| o.frames.is_closed()))
    }

    /// Sends one frame on stream `index`.
    pub(crate) fn push(&self, index: usize, frame: &str) {
        self.send(index, Ok(frame.to_string()));
    }

    /// Fails stream `index` with `error`.
    pub(crate) fn fail(&self, index: usize, error: FeedError) {
        self.send(index, Err(error));
    }

    /// Ends stream `index` as a server close would.
    pub(crate) fn close(&self, index: usize) {
        self.with_state(|s| {
            if let Some(open) = s.opens.get_mut(index) {
                let (closed, _) = mpsc::unbounded_channel();
                open.frames = closed;
            }
        });
    }

    fn send(&self, index: usize, item: Result<String, FeedError>) {
        self.with_state(|s| {
            if let Some(open) = s.opens.get(index) {
                let _ = open.frames.send(item);
            }
        });
    }
}

impl Transport for ScriptedTransport {
    fn open<'a>(
        &'a self,
        endpoint: &'a Url,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<FrameStream, FeedError>> {
        let result = self.with_state(|s| {
            s.calls += 1;
            if let Some(error) = s.fail_next.pop_front() {
                return Err(error);
            }
            let (tx, mut rx) = mpsc::unbounded_channel();
            s.opens.push(OpenRecord {
                endpoint: endpoint.clone(),
                authorization: credential.authorization(),
                frames: tx,
            });
            let frames: FrameStream = Box::pin(stream::poll_fn(move |cx| rx.poll_recv(cx)));
            Ok(frames)
        });
        Box::pin(async move { result })
    }
}

/// [`TokioTimer`] that counts the waits it hands out.
#[derive(Default)]
pub(crate) struct CountingTimer {
    sleeps: AtomicUsize,
    last: Mutex<Option<Duration>>,
}

impl CountingTimer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }

    pub(crate) fn last_duration(&self) -> Option<Duration> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Timer for CountingTimer {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(duration);
        TokioTimer.sleep(duration)
    }
}
