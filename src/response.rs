//! Response handling for language model generations.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::accumulator::StreamAccumulator;
use crate::types::{FinishReason, Message, Part, PartialResponse, ToolCallPart, Usage};
use crate::Error;

/// A complete response from a language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Ordered output parts (text, tool calls, audio, ...).
    pub content: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl ModelResponse {
    /// Get all text content concatenated together.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Get all tool calls in order.
    pub fn tool_calls(&self) -> Vec<&ToolCallPart> {
        self.content
            .iter()
            .filter_map(|part| match part {
                Part::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Convert this response into the assistant message that echoes it back.
    pub fn to_message(&self) -> Message {
        Message::assistant(self.content.iter().cloned())
    }
}

type PartialBoxStream = Pin<Box<dyn Stream<Item = Result<PartialResponse, Error>> + Send>>;

/// A lazy, single-pass sequence of partial responses.
///
/// Nothing is produced after the first error or after the end of the stream.
pub struct PartialStream {
    inner: PartialBoxStream,
    finished: bool,
}

impl PartialStream {
    /// Create a new partial stream from any stream of partials.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<PartialResponse, Error>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
            finished: false,
        }
    }

    /// Advance to the next partial; `None` once the stream has terminated.
    pub async fn next(&mut self) -> Option<Result<PartialResponse, Error>> {
        StreamExt::next(self).await
    }

    /// Consume the whole stream and fold it into a complete response.
    pub async fn accumulate(mut self) -> Result<ModelResponse, Error> {
        let mut accumulator = StreamAccumulator::new();
        while let Some(partial) = self.next().await {
            accumulator.add_partial(partial?)?;
        }
        accumulator.compute_response()
    }
}

impl Stream for PartialStream {
    type Item = Result<PartialResponse, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Err(err))) => {
                self.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for PartialStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartialStream")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
