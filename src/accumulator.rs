//! Delta accumulation logic for streaming responses.

use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::types::{
    AudioFormat, AudioPart, ContentDelta, FinishReason, ImagePart, Part, PartDelta,
    PartialResponse, ReasoningPart, Signature, SourcePart, TextPart, ToolCallPart,
    ToolResultPart, Usage,
};
use crate::{Error, ModelResponse};

/// In-progress state of the part at one index.
#[derive(Debug, Clone)]
enum PartBuffer {
    Text(String),
    Reasoning {
        text: String,
        signature: Option<Signature>,
    },
    ToolCall {
        tool_call_id: Option<String>,
        tool_name: Option<String>,
        args: String,
        thought_signature: Option<Signature>,
    },
    Audio {
        audio_id: Option<String>,
        data: Vec<u8>,
        format: Option<AudioFormat>,
        sample_rate: Option<u32>,
        channels: Option<u32>,
        transcript: Option<String>,
    },
    ToolResult(ToolResultPart),
    Image(ImagePart),
    Source(SourcePart),
}

impl PartBuffer {
    fn kind(&self) -> &'static str {
        match self {
            PartBuffer::Text(_) => "text",
            PartBuffer::Reasoning { .. } => "reasoning",
            PartBuffer::ToolCall { .. } => "tool-call",
            PartBuffer::Audio { .. } => "audio",
            PartBuffer::ToolResult(_) => "tool-result",
            PartBuffer::Image(_) => "image",
            PartBuffer::Source(_) => "source",
        }
    }

    /// Start a buffer from the first delta seen at an index.
    fn start(part: PartDelta) -> Self {
        match part {
            PartDelta::Text(delta) => PartBuffer::Text(delta.text),
            PartDelta::Reasoning(delta) => PartBuffer::Reasoning {
                text: delta.text,
                signature: delta.signature.filter(|s| !s.is_empty()),
            },
            PartDelta::ToolCall(delta) => PartBuffer::ToolCall {
                tool_call_id: delta.tool_call_id.filter(|s| !s.is_empty()),
                tool_name: delta.tool_name.filter(|s| !s.is_empty()),
                args: delta.args.unwrap_or_default(),
                thought_signature: delta.thought_signature.filter(|s| !s.is_empty()),
            },
            PartDelta::Audio(delta) => PartBuffer::Audio {
                audio_id: delta.audio_id.filter(|s| !s.is_empty()),
                data: delta.data,
                format: delta.format,
                sample_rate: delta.sample_rate,
                channels: delta.channels,
                transcript: delta.transcript,
            },
            PartDelta::ToolResult(part) => PartBuffer::ToolResult(part),
            PartDelta::Image(part) => PartBuffer::Image(part),
            PartDelta::Source(part) => PartBuffer::Source(part),
        }
    }

    /// Merge a later delta into this buffer.
    fn apply(&mut self, index: usize, part: PartDelta) -> Result<(), Error> {
        if self.kind() != part.kind() {
            return Err(Error::accumulation(format!(
                "index {index} holds a {} part but received a {} delta",
                self.kind(),
                part.kind()
            )));
        }

        match (self, part) {
            (PartBuffer::Text(text), PartDelta::Text(delta)) => {
                text.push_str(&delta.text);
            }
            (PartBuffer::Reasoning { text, signature }, PartDelta::Reasoning(delta)) => {
                text.push_str(&delta.text);
                set_once(
                    signature,
                    delta.signature.filter(|s| !s.is_empty()),
                    "signature",
                    index,
                )?;
            }
            (
                PartBuffer::ToolCall {
                    tool_call_id,
                    tool_name,
                    args,
                    thought_signature,
                },
                PartDelta::ToolCall(delta),
            ) => {
                set_once(
                    tool_call_id,
                    delta.tool_call_id.filter(|s| !s.is_empty()),
                    "tool call id",
                    index,
                )?;
                set_once(
                    tool_name,
                    delta.tool_name.filter(|s| !s.is_empty()),
                    "tool name",
                    index,
                )?;
                set_once(
                    thought_signature,
                    delta.thought_signature.filter(|s| !s.is_empty()),
                    "thought signature",
                    index,
                )?;
                if let Some(fragment) = delta.args {
                    args.push_str(&fragment);
                }
            }
            (
                PartBuffer::Audio {
                    audio_id,
                    data,
                    format,
                    sample_rate,
                    channels,
                    transcript,
                },
                PartDelta::Audio(delta),
            ) => {
                set_once(
                    audio_id,
                    delta.audio_id.filter(|s| !s.is_empty()),
                    "audio id",
                    index,
                )?;
                set_once(format, delta.format, "audio format", index)?;
                set_once(sample_rate, delta.sample_rate, "sample rate", index)?;
                set_once(channels, delta.channels, "channel count", index)?;
                data.extend_from_slice(&delta.data);
                if let Some(fragment) = delta.transcript {
                    transcript.get_or_insert_with(String::new).push_str(&fragment);
                }
            }
            (PartBuffer::ToolResult(existing), PartDelta::ToolResult(incoming)) => {
                let blank = incoming.tool_call_id.is_empty() && incoming.content.is_empty();
                check_atomic(existing, &incoming, blank, index)?;
            }
            (PartBuffer::Image(existing), PartDelta::Image(incoming)) => {
                let blank = incoming.data.is_empty();
                check_atomic(existing, &incoming, blank, index)?;
            }
            (PartBuffer::Source(existing), PartDelta::Source(incoming)) => {
                let blank = incoming.source.is_empty() && incoming.content.is_empty();
                check_atomic(existing, &incoming, blank, index)?;
            }
            _ => unreachable!("variant kinds were compared above"),
        }

        Ok(())
    }

    fn to_part(&self, index: usize) -> Result<Part, Error> {
        let part = match self {
            PartBuffer::Text(text) => Part::Text(TextPart { text: text.clone() }),
            PartBuffer::Reasoning { text, signature } => Part::Reasoning(ReasoningPart {
                text: text.clone(),
                signature: signature.clone(),
            }),
            PartBuffer::ToolCall {
                tool_call_id,
                tool_name,
                args,
                thought_signature,
            } => {
                let tool_call_id = tool_call_id.clone().ok_or_else(|| {
                    Error::accumulation(format!("tool call at index {index} has no tool call id"))
                })?;
                let tool_name = tool_name.clone().ok_or_else(|| {
                    Error::accumulation(format!("tool call at index {index} has no tool name"))
                })?;
                Part::ToolCall(ToolCallPart {
                    args: parse_tool_args(&tool_call_id, args)?,
                    tool_call_id,
                    tool_name,
                    thought_signature: thought_signature.clone(),
                })
            }
            PartBuffer::Audio {
                audio_id,
                data,
                format,
                sample_rate,
                channels,
                transcript,
            } => {
                let format = format.ok_or_else(|| {
                    Error::accumulation(format!("audio at index {index} has no format"))
                })?;
                Part::Audio(AudioPart {
                    audio_id: audio_id.clone(),
                    transcript: transcript.clone(),
                    data: data.clone(),
                    format,
                    sample_rate: *sample_rate,
                    channels: *channels,
                })
            }
            PartBuffer::ToolResult(part) => Part::ToolResult(part.clone()),
            PartBuffer::Image(part) => Part::Image(part.clone()),
            PartBuffer::Source(part) => Part::Source(part.clone()),
        };
        Ok(part)
    }
}

fn set_once<T: PartialEq + Debug>(
    slot: &mut Option<T>,
    incoming: Option<T>,
    field: &str,
    index: usize,
) -> Result<(), Error> {
    match (slot.as_ref(), incoming) {
        (_, None) => Ok(()),
        (None, Some(value)) => {
            *slot = Some(value);
            Ok(())
        }
        (Some(current), Some(value)) if *current == value => Ok(()),
        (Some(current), Some(value)) => Err(Error::accumulation(format!(
            "{field} at index {index} changed from {current:?} to {value:?}"
        ))),
    }
}

fn check_atomic<T: PartialEq>(existing: &T, incoming: &T, blank: bool, index: usize) -> Result<(), Error> {
    if blank || existing == incoming {
        Ok(())
    } else {
        Err(Error::accumulation(format!(
            "part at index {index} arrives whole and cannot be replaced"
        )))
    }
}

fn parse_tool_args(tool_call_id: &str, raw: &str) -> Result<serde_json::Value, Error> {
    // Tools without parameters may stream no argument text at all.
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(raw)
        .map(serde_json::Value::Object)
        .map_err(|source| Error::MalformedToolArgs {
            tool_call_id: tool_call_id.to_string(),
            raw: raw.to_string(),
            source,
        })
}

/// Folds a sequence of [`PartialResponse`]s into one [`ModelResponse`].
///
/// Meant for exactly one consumer of exactly one stream; it does no locking.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    buffers: BTreeMap<usize, PartBuffer>,
    usage: Option<Usage>,
    finish_reason: Option<FinishReason>,
    /// Set once an invariant has been violated; the state is then unusable.
    failure: Option<String>,
}

impl StreamAccumulator {
    /// Create a new stream accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one partial response into the accumulated state.
    pub fn add_partial(&mut self, partial: PartialResponse) -> Result<(), Error> {
        if let Some(reason) = &self.failure {
            return Err(Error::accumulation(format!(
                "accumulator is unusable after an earlier error: {reason}"
            )));
        }

        if let Some(ContentDelta { index, part }) = partial.delta {
            let result = match self.buffers.get_mut(&index) {
                Some(buffer) => buffer.apply(index, part),
                None => {
                    self.buffers.insert(index, PartBuffer::start(part));
                    Ok(())
                }
            };
            if let Err(err) = result {
                self.failure = Some(err.to_string());
                return Err(err);
            }
        }

        if let Some(usage) = partial.usage {
            *self.usage.get_or_insert_with(Usage::default) += usage;
        }
        if partial.finish_reason.is_some() {
            self.finish_reason = partial.finish_reason;
        }

        Ok(())
    }

    /// Build the response from the current state.
    ///
    /// Does not consume or alter the accumulator, so it can be used for
    /// snapshots while a stream is still running.
    pub fn compute_response(&self) -> Result<ModelResponse, Error> {
        if let Some(reason) = &self.failure {
            return Err(Error::accumulation(format!(
                "accumulator is unusable after an earlier error: {reason}"
            )));
        }

        let content = self
            .buffers
            .iter()
            .map(|(index, buffer)| buffer.to_part(*index))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ModelResponse {
            content,
            usage: self.usage,
            finish_reason: self.finish_reason.clone(),
        })
    }

    /// Concatenated text of all text parts received so far.
    pub fn current_text(&self) -> String {
        self.buffers
            .values()
            .filter_map(|buffer| match buffer {
                PartBuffer::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Number of distinct parts seen so far.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioPartDelta, ReasoningPartDelta, ToolCallPartDelta};
    use serde_json::json;

    fn tool_call_start(index: usize, id: &str, name: &str) -> PartialResponse {
        PartialResponse::delta(
            index,
            PartDelta::ToolCall(ToolCallPartDelta {
                tool_call_id: Some(id.to_string()),
                tool_name: Some(name.to_string()),
                ..ToolCallPartDelta::default()
            }),
        )
    }

    #[test]
    fn test_text_accumulation() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.add_partial(PartialResponse::text(0, "Hello")).unwrap();
        accumulator.add_partial(PartialResponse::text(0, " world")).unwrap();
        assert_eq!(accumulator.current_text(), "Hello world");

        let response = accumulator.compute_response().unwrap();
        assert_eq!(response.content, vec![Part::text("Hello world")]);
    }

    #[test]
    fn test_tool_args_accumulation() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.add_partial(tool_call_start(0, "call_1", "compute")).unwrap();
        accumulator.add_partial(PartialResponse::tool_call_args(0, "{\"a\":")).unwrap();
        accumulator.add_partial(PartialResponse::tool_call_args(0, "1}")).unwrap();

        let response = accumulator.compute_response().unwrap();
        match &response.content[0] {
            Part::ToolCall(call) => {
                assert_eq!(call.tool_call_id, "call_1");
                assert_eq!(call.tool_name, "compute");
                assert_eq!(call.args, json!({"a": 1}));
            }
            other => panic!("Expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_unterminated_tool_args_fail() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.add_partial(tool_call_start(0, "call_9", "compute")).unwrap();
        accumulator.add_partial(PartialResponse::tool_call_args(0, "{\"a\":")).unwrap();

        match accumulator.compute_response() {
            Err(Error::MalformedToolArgs { tool_call_id, raw, .. }) => {
                assert_eq!(tool_call_id, "call_9");
                assert_eq!(raw, "{\"a\":");
            }
            other => panic!("Expected MalformedToolArgs, got {other:?}"),
        }
    }

    #[test]
    fn test_non_object_tool_args_fail() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.add_partial(tool_call_start(0, "call_1", "compute")).unwrap();
        accumulator.add_partial(PartialResponse::tool_call_args(0, "[1, 2]")).unwrap();
        assert!(matches!(
            accumulator.compute_response(),
            Err(Error::MalformedToolArgs { .. })
        ));
    }

    #[test]
    fn test_empty_tool_args_become_empty_object() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.add_partial(tool_call_start(0, "call_1", "list_files")).unwrap();
        let response = accumulator.compute_response().unwrap();
        match &response.content[0] {
            Part::ToolCall(call) => assert_eq!(call.args, json!({})),
            other => panic!("Expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_variant_mismatch_is_rejected() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.add_partial(PartialResponse::text(0, "Hello")).unwrap();
        let result = accumulator.add_partial(tool_call_start(0, "call_1", "compute"));
        assert!(matches!(result, Err(Error::Accumulation(_))));

        // The state must be discarded after a violation.
        assert!(matches!(
            accumulator.add_partial(PartialResponse::text(1, "more")),
            Err(Error::Accumulation(_))
        ));
        assert!(matches!(
            accumulator.compute_response(),
            Err(Error::Accumulation(_))
        ));
    }

    #[test]
    fn test_conflicting_tool_name_is_rejected() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.add_partial(tool_call_start(0, "call_1", "compute")).unwrap();
        // Repeating the same identity is fine.
        accumulator.add_partial(tool_call_start(0, "call_1", "compute")).unwrap();
        let result = accumulator.add_partial(tool_call_start(0, "call_1", "other"));
        assert!(matches!(result, Err(Error::Accumulation(_))));
    }

    #[test]
    fn test_signature_is_preserved() {
        let signature = Signature::new("CiQBcsjafH+Yr9kT0pL2==");
        let mut accumulator = StreamAccumulator::new();
        accumulator
            .add_partial(PartialResponse::delta(
                0,
                PartDelta::ToolCall(ToolCallPartDelta {
                    tool_call_id: Some("call_1".to_string()),
                    tool_name: Some("get_weather".to_string()),
                    args: Some("{\"location\":".to_string()),
                    thought_signature: Some(signature.clone()),
                }),
            ))
            .unwrap();
        accumulator.add_partial(PartialResponse::tool_call_args(0, "\"Paris\"")).unwrap();
        accumulator
            .add_partial(PartialResponse::delta(
                0,
                PartDelta::ToolCall(ToolCallPartDelta {
                    args: Some("}".to_string()),
                    thought_signature: Some(signature.clone()),
                    ..ToolCallPartDelta::default()
                }),
            ))
            .unwrap();

        let response = accumulator.compute_response().unwrap();
        match &response.content[0] {
            Part::ToolCall(call) => {
                assert_eq!(call.thought_signature.as_ref(), Some(&signature));
                assert_eq!(
                    call.thought_signature.as_ref().unwrap().as_str().as_bytes(),
                    signature.as_str().as_bytes()
                );
            }
            other => panic!("Expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn test_signature_change_is_rejected() {
        let mut accumulator = StreamAccumulator::new();
        let reasoning = |text: &str, signature: Option<&str>| {
            PartialResponse::delta(
                0,
                PartDelta::Reasoning(ReasoningPartDelta {
                    text: text.to_string(),
                    signature: signature.map(Signature::from),
                }),
            )
        };
        accumulator.add_partial(reasoning("Thinking", Some("sig-a"))).unwrap();
        accumulator.add_partial(reasoning(" more", None)).unwrap();
        accumulator.add_partial(reasoning("", Some(""))).unwrap();
        let result = accumulator.add_partial(reasoning(".", Some("sig-b")));
        assert!(matches!(result, Err(Error::Accumulation(_))));
    }

    #[test]
    fn test_compute_response_is_idempotent() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.add_partial(PartialResponse::text(0, "Partial")).unwrap();
        accumulator.add_partial(tool_call_start(1, "call_1", "compute")).unwrap();
        accumulator.add_partial(PartialResponse::tool_call_args(1, "{}")).unwrap();

        let first = accumulator.compute_response().unwrap();
        let second = accumulator.compute_response().unwrap();
        assert_eq!(first, second);

        // Snapshots do not prevent further accumulation.
        accumulator.add_partial(PartialResponse::text(0, " text")).unwrap();
        assert_eq!(accumulator.compute_response().unwrap().text(), "Partial text");
    }

    #[test]
    fn test_content_is_ordered_by_index() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.add_partial(PartialResponse::text(3, "last")).unwrap();
        accumulator.add_partial(PartialResponse::text(0, "first")).unwrap();
        accumulator.add_partial(PartialResponse::text(1, "second")).unwrap();

        let response = accumulator.compute_response().unwrap();
        assert_eq!(
            response.content,
            vec![Part::text("first"), Part::text("second"), Part::text("last")]
        );
    }

    #[test]
    fn test_audio_accumulation() {
        let mut accumulator = StreamAccumulator::new();
        let audio = |data: &[u8], transcript: Option<&str>| {
            PartialResponse::delta(
                0,
                PartDelta::Audio(AudioPartDelta {
                    data: data.to_vec(),
                    format: Some(AudioFormat::Linear16),
                    sample_rate: Some(24_000),
                    channels: Some(1),
                    transcript: transcript.map(str::to_string),
                    ..AudioPartDelta::default()
                }),
            )
        };
        accumulator.add_partial(audio(&[1, 2], Some("Hel"))).unwrap();
        accumulator.add_partial(audio(&[3], Some("lo"))).unwrap();
        accumulator.add_partial(audio(&[4, 5], None)).unwrap();

        let response = accumulator.compute_response().unwrap();
        match &response.content[0] {
            Part::Audio(part) => {
                assert_eq!(part.data, vec![1, 2, 3, 4, 5]);
                assert_eq!(part.transcript.as_deref(), Some("Hello"));
                assert_eq!(part.format, AudioFormat::Linear16);
                assert_eq!(part.sample_rate, Some(24_000));
            }
            other => panic!("Expected audio, got {other:?}"),
        }
    }

    #[test]
    fn test_atomic_parts() {
        let image = ImagePart {
            data: vec![9, 9, 9],
            mime_type: "image/png".to_string(),
            width: None,
            height: None,
        };
        let mut accumulator = StreamAccumulator::new();
        accumulator
            .add_partial(PartialResponse::delta(0, PartDelta::Image(image.clone())))
            .unwrap();
        // Same value again is tolerated.
        accumulator
            .add_partial(PartialResponse::delta(0, PartDelta::Image(image.clone())))
            .unwrap();

        let replaced = ImagePart {
            data: vec![1],
            ..image.clone()
        };
        let result = accumulator.add_partial(PartialResponse::delta(0, PartDelta::Image(replaced)));
        assert!(matches!(result, Err(Error::Accumulation(_))));
    }

    #[test]
    fn test_usage_and_finish_reason() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.add_partial(PartialResponse::text(0, "Hi")).unwrap();
        accumulator
            .add_partial(PartialResponse::finish(
                Some(Usage {
                    input_tokens: 5,
                    output_tokens: 1,
                    ..Usage::default()
                }),
                None,
            ))
            .unwrap();
        accumulator
            .add_partial(PartialResponse::finish(
                Some(Usage {
                    input_tokens: 0,
                    output_tokens: 2,
                    ..Usage::default()
                }),
                Some(FinishReason::Stop),
            ))
            .unwrap();

        let response = accumulator.compute_response().unwrap();
        let usage = response.usage.unwrap();
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 3);
        assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn test_no_usage_reported() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.add_partial(PartialResponse::text(0, "Hi")).unwrap();
        let response = accumulator.compute_response().unwrap();
        assert!(response.usage.is_none());
        assert!(response.finish_reason.is_none());
    }
}
