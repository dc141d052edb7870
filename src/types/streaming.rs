//! Types for streaming responses.

use crate::types::{AudioFormat, FinishReason, ImagePart, Signature, SourcePart, ToolResultPart, Usage};

/// One unit of a streamed response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialResponse {
    pub delta: Option<ContentDelta>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<FinishReason>,
}

/// A fragment of the part at `index` in the eventual content list.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentDelta {
    pub index: usize,
    pub part: PartDelta,
}

/// A fragment of exactly one part variant.
#[derive(Debug, Clone, PartialEq)]
pub enum PartDelta {
    Text(TextPartDelta),
    Reasoning(ReasoningPartDelta),
    ToolCall(ToolCallPartDelta),
    Audio(AudioPartDelta),
    /// Tool results, images and sources arrive whole.
    ToolResult(ToolResultPart),
    Image(ImagePart),
    Source(SourcePart),
}

impl PartDelta {
    pub fn kind(&self) -> &'static str {
        match self {
            PartDelta::Text(_) => "text",
            PartDelta::Reasoning(_) => "reasoning",
            PartDelta::ToolCall(_) => "tool-call",
            PartDelta::Audio(_) => "audio",
            PartDelta::ToolResult(_) => "tool-result",
            PartDelta::Image(_) => "image",
            PartDelta::Source(_) => "source",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextPartDelta {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReasoningPartDelta {
    pub text: String,
    pub signature: Option<Signature>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallPartDelta {
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    /// Raw fragment of the JSON-encoded arguments; may be invalid JSON on its own.
    pub args: Option<String>,
    pub thought_signature: Option<Signature>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioPartDelta {
    pub audio_id: Option<String>,
    pub data: Vec<u8>,
    pub format: Option<AudioFormat>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    pub transcript: Option<String>,
}

impl PartialResponse {
    pub fn delta(index: usize, part: PartDelta) -> Self {
        Self {
            delta: Some(ContentDelta { index, part }),
            ..Self::default()
        }
    }

    pub fn text(index: usize, text: impl Into<String>) -> Self {
        Self::delta(index, PartDelta::Text(TextPartDelta { text: text.into() }))
    }

    pub fn tool_call_args(index: usize, args: impl Into<String>) -> Self {
        Self::delta(
            index,
            PartDelta::ToolCall(ToolCallPartDelta {
                args: Some(args.into()),
                ..ToolCallPartDelta::default()
            }),
        )
    }

    /// A partial with no content, only usage and/or a finish reason.
    pub fn finish(usage: Option<Usage>, finish_reason: Option<FinishReason>) -> Self {
        Self {
            delta: None,
            usage,
            finish_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_constructors() {
        let partial = PartialResponse::text(2, "Hi");
        let delta = partial.delta.unwrap();
        assert_eq!(delta.index, 2);
        assert_eq!(delta.part.kind(), "text");

        let partial = PartialResponse::tool_call_args(0, "{\"a\":");
        match partial.delta.unwrap().part {
            PartDelta::ToolCall(call) => {
                assert_eq!(call.args.as_deref(), Some("{\"a\":"));
                assert!(call.tool_call_id.is_none());
            }
            other => panic!("Expected tool call delta, got {other:?}"),
        }

        let partial = PartialResponse::finish(None, Some(FinishReason::Stop));
        assert!(partial.delta.is_none());
        assert_eq!(partial.finish_reason, Some(FinishReason::Stop));
    }
}
