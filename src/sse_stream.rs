//! Server-Sent Events decoding over a byte stream.
//!
//! Gemini's `alt=sse` mode frames every JSON chunk as one `data:` event.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::{Stream, StreamExt};
use memchr::memmem;

use crate::Error;

/// Default upper bound for a single incomplete event. Generated images arrive
/// as one base64 event, so this sits well above any real payload.
pub const DEFAULT_MAX_EVENT_BYTES: usize = 64 * 1024 * 1024;

/// A Server-Sent Events (SSE) event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// Event type (optional).
    pub event_type: Option<String>,
    /// Event data, multiple `data:` lines joined with `\n`.
    pub data: String,
}

impl SseEvent {
    /// Parse one event block (the text between blank lines).
    fn parse(block: &str) -> Option<SseEvent> {
        let mut event_type = None;
        let mut data_lines = Vec::new();

        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event_type = Some(value.to_string()),
                "data" => data_lines.push(value),
                _ => {}
            }
        }

        if data_lines.is_empty() {
            return None;
        }

        Some(SseEvent {
            event_type,
            data: data_lines.join("\n"),
        })
    }
}

/// A stream adapter that parses SSE events from a byte stream.
/// Events split across chunks are buffered until their terminating blank line.
pub struct SseStream<S> {
    inner: S,
    pending: Vec<u8>,
    /// The previous chunk ended in CR, so a leading LF belongs to it.
    after_cr: bool,
    /// Bytes of `pending` already searched for a separator.
    scanned: usize,
    max_event_bytes: usize,
    events: VecDeque<SseEvent>,
    /// Reported after the events queued before it.
    failure: Option<Error>,
    done: bool,
}

impl<S> SseStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            pending: Vec::new(),
            after_cr: false,
            scanned: 0,
            max_event_bytes: DEFAULT_MAX_EVENT_BYTES,
            events: VecDeque::new(),
            failure: None,
            done: false,
        }
    }

    /// Limit the size of an event still waiting for its blank line.
    pub fn with_max_event_bytes(mut self, max_event_bytes: usize) -> Self {
        self.max_event_bytes = max_event_bytes;
        self
    }

    fn push_chunk(&mut self, chunk: &[u8]) {
        // CRLF and lone CR both become LF so one separator covers all.
        self.pending.reserve(chunk.len());
        for &byte in chunk {
            match byte {
                b'\r' => {
                    self.pending.push(b'\n');
                    self.after_cr = true;
                }
                b'\n' if self.after_cr => self.after_cr = false,
                byte => {
                    self.pending.push(byte);
                    self.after_cr = false;
                }
            }
        }
    }

    fn drain_events(&mut self) -> Result<(), Error> {
        let finder = memmem::Finder::new(b"\n\n");
        let mut start = 0;
        let mut search_from = self.scanned;

        while let Some(pos) = finder.find(&self.pending[search_from..]) {
            let end = search_from + pos;
            let block = std::str::from_utf8(&self.pending[start..end]).map_err(|e| {
                Error::protocol("sse", format!("invalid UTF-8 in event: {e}"))
            })?;
            if let Some(event) = SseEvent::parse(block.trim_start_matches('\u{feff}')) {
                self.events.push_back(event);
            }
            start = end + 2;
            search_from = start;
        }

        if start > 0 {
            self.pending.drain(..start);
        }
        // A separator can straddle the next chunk.
        self.scanned = self.pending.len().saturating_sub(1);
        Ok(())
    }

    fn drain_tail(&mut self) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let tail = std::mem::take(&mut self.pending);
        let block = std::str::from_utf8(&tail)
            .map_err(|e| Error::protocol("sse", format!("invalid UTF-8 in event: {e}")))?;
        if let Some(event) = SseEvent::parse(block.trim()) {
            self.events.push_back(event);
        }
        Ok(())
    }
}

impl<S, E> Stream for SseStream<S>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<SseEvent, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if let Some(err) = self.failure.take() {
                return Poll::Ready(Some(Err(err)));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match ready!(self.inner.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => {
                    self.push_chunk(&chunk);
                    if let Err(err) = self.drain_events() {
                        self.done = true;
                        self.failure = Some(err);
                    } else if self.pending.len() > self.max_event_bytes {
                        self.done = true;
                        self.pending.clear();
                        self.failure = Some(Error::protocol(
                            "sse",
                            format!("event exceeded {} buffered bytes", self.max_event_bytes),
                        ));
                    }
                }
                Some(Err(err)) => {
                    self.done = true;
                    self.failure = Some(Error::transport(format!(
                        "failed to read response body: {err}"
                    )));
                }
                None => {
                    // The body may end without a trailing blank line.
                    self.done = true;
                    if let Err(err) = self.drain_tail() {
                        self.failure = Some(err);
                    }
                }
            }
        }
    }
}
