//! # SSE decoder
//!
//! Turns a chunked `text/event-stream` body into whole event payloads:
//! - Line buffering across chunk boundaries
//! - `data:` field extraction, multi-line data joined with `\n`
//! - Dispatch on blank line
//! - Comments and `event:`/`id:`/`retry:` fields ignored
//!
//! Body read errors are yielded once and end the stream; a clean end of
//! body ends the stream without an error, and the caller decides what a
//! closed stream means. A line longer than [`MAX_LINE_BYTES`] ends the
//! stream with [`FeedError::LineTooLong`].

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt, stream};
use tracing::debug;

use crate::error::FeedError;

/// Longest line the decoder buffers before giving up on the stream.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Accumulates the `data:` lines of the event currently being read.
#[derive(Debug, Default)]
struct PendingEvent {
    data: Option<String>,
}

impl PendingEvent {
    /// Feeds one line. Returns the finished payload on a blank line.
    fn push_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.data.take().filter(|d| !d.is_empty());
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        if field == "data" {
            match self.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            }
        }
        None
    }
}

/// Splits the next complete line off the front of `buffer`, without its
/// `\n` or `\r\n` terminator.
fn take_line(buffer: &mut BytesMut) -> Option<BytesMut> {
    let newline_pos = buffer.iter().position(|&b| b == b'\n')?;
    let mut line = buffer.split_to(newline_pos + 1);
    line.truncate(newline_pos);
    if line.last() == Some(&b'\r') {
        line.truncate(newline_pos - 1);
    }
    Some(line)
}

/// Decodes an SSE byte stream into event payloads.
///
/// A trailing event without its terminating blank line is dropped when the
/// body ends.
pub fn decode_events<S, E>(byte_stream: S) -> impl Stream<Item = Result<String, FeedError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Into<FeedError> + Send + 'static,
{
    decode_events_with_limit(byte_stream, MAX_LINE_BYTES)
}

fn decode_events_with_limit<S, E>(
    byte_stream: S,
    max_line: usize,
) -> impl Stream<Item = Result<String, FeedError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Into<FeedError> + Send + 'static,
{
    stream::unfold(
        (
            byte_stream,
            BytesMut::with_capacity(8192),
            PendingEvent::default(),
            false,
        ),
        move |(mut body, mut buffer, mut pending, done)| async move {
            if done {
                return None;
            }

            loop {
                if let Some(line_bytes) = take_line(&mut buffer) {
                    let Ok(line) = std::str::from_utf8(&line_bytes) else {
                        debug!("skipping non UTF-8 SSE line");
                        continue;
                    };
                    if let Some(payload) = pending.push_line(line) {
                        return Some((Ok(payload), (body, buffer, pending, false)));
                    }
                    continue;
                }

                if buffer.len() > max_line {
                    let error = FeedError::LineTooLong { limit: max_line };
                    return Some((Err(error), (body, buffer, pending, true)));
                }

                match body.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e.into()), (body, buffer, pending, true))),
                    None => return None,
                }
            }
        },
    )
}
