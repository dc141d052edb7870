//! Translation between the unified model and the Gemini wire format.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ijson::IValue;
use serde_json::value::RawValue;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::*;
use super::PROVIDER;
use crate::types::{
    AudioFormat, AudioPart, AudioPartDelta, FinishReason, ImagePart, LanguageModelInput, Message,
    Modality, Part, PartDelta, PartialResponse, ReasoningPart, ReasoningPartDelta, ResponseFormat,
    Role, Signature, Tool, ToolCallPart, ToolCallPartDelta, ToolChoice, ToolResultPart, Usage,
};
use crate::{Error, ModelResponse};

const DEFAULT_PCM_RATE: u32 = 24_000;

/// Build the request body for `input`. The input is only read.
pub(crate) fn build_request(input: &LanguageModelInput) -> Result<GenerateContentRequest, Error> {
    let system_instruction = input
        .system_prompt
        .as_ref()
        .filter(|prompt| !prompt.is_empty())
        .map(|prompt| Content {
            role: None,
            parts: vec![WirePart::text(prompt.clone())],
        });

    let contents = input
        .messages
        .iter()
        .map(convert_message)
        .collect::<Result<Vec<_>, _>>()?;

    let tools = if input.tools.is_empty() {
        None
    } else {
        let function_declarations = input
            .tools
            .iter()
            .map(convert_tool)
            .collect::<Result<Vec<_>, _>>()?;
        Some(vec![ToolDeclaration {
            function_declarations,
        }])
    };

    Ok(GenerateContentRequest {
        contents,
        system_instruction,
        tools,
        tool_config: input.tool_choice.as_ref().map(convert_tool_choice),
        generation_config: Some(generation_config(input)?),
    })
}

fn convert_message(message: &Message) -> Result<Content, Error> {
    // Function responses travel in a user turn.
    let role = match message.role {
        Role::User | Role::Tool => "user",
        Role::Assistant => "model",
    };

    let mut parts = Vec::with_capacity(message.content.len());
    for part in &message.content {
        push_part(&mut parts, part)?;
    }

    Ok(Content {
        role: Some(role.to_string()),
        parts,
    })
}

fn push_part(parts: &mut Vec<WirePart>, part: &Part) -> Result<(), Error> {
    match part {
        Part::Text(text) => parts.push(WirePart::text(text.text.clone())),
        Part::Image(image) => parts.push(inline_part(&image.mime_type, &image.data)),
        Part::Audio(audio) => parts.push(inline_part(&audio_mime_type(audio), &audio.data)),
        Part::Source(source) => {
            for inner in &source.content {
                push_part(parts, inner)?;
            }
        }
        Part::Reasoning(reasoning) => {
            let thought_signature = wire_signature(reasoning.signature.as_ref());
            if reasoning.text.is_empty() {
                if let Some(signature) = thought_signature {
                    push_bare_signature(parts, signature);
                }
                return Ok(());
            }
            parts.push(WirePart {
                text: Some(reasoning.text.clone()),
                thought: Some(true),
                thought_signature,
                ..WirePart::default()
            });
        }
        Part::ToolCall(call) => parts.push(WirePart {
            function_call: Some(FunctionCall {
                id: None,
                name: call.tool_name.clone(),
                args: tool_call_args(call)?,
            }),
            thought_signature: wire_signature(call.thought_signature.as_ref()),
            ..WirePart::default()
        }),
        Part::ToolResult(result) => parts.push(WirePart {
            function_response: Some(FunctionResponse {
                id: None,
                name: result.tool_name.clone(),
                response: tool_result_response(result)?,
            }),
            ..WirePart::default()
        }),
    }
    Ok(())
}

/// A signature with no reasoning text goes back on the answer text it followed,
/// or as a signature-only part when there is none.
fn push_bare_signature(parts: &mut Vec<WirePart>, signature: String) {
    if let Some(previous) = parts.last_mut() {
        let plain_text = previous.text.is_some()
            && !previous.is_thought()
            && previous.thought_signature.is_none()
            && previous.function_call.is_none()
            && previous.inline_data.is_none();
        if plain_text {
            previous.thought_signature = Some(signature);
            return;
        }
    }
    parts.push(WirePart {
        text: Some(String::new()),
        thought_signature: Some(signature),
        ..WirePart::default()
    });
}

fn wire_signature(signature: Option<&Signature>) -> Option<String> {
    signature
        .filter(|signature| !signature.is_empty())
        .map(|signature| signature.as_str().to_string())
}

fn inline_part(mime_type: &str, data: &[u8]) -> WirePart {
    WirePart {
        inline_data: Some(InlineData {
            mime_type: mime_type.to_string(),
            data: BASE64.encode(data),
        }),
        ..WirePart::default()
    }
}

fn tool_call_args(call: &ToolCallPart) -> Result<IValue, Error> {
    let args = match &call.args {
        Value::Null => json!({}),
        args @ Value::Object(_) => args.clone(),
        other => {
            return Err(Error::request(format!(
                "arguments of tool call '{}' must be a JSON object, got {other}",
                call.tool_call_id
            )))
        }
    };
    ijson::to_value(args).map_err(|e| Error::request(format!("invalid tool call arguments: {e}")))
}

/// Text output that parses as a JSON object is sent as is; anything else is
/// wrapped under `output`. Errors are wrapped under `error`.
fn tool_result_response(result: &ToolResultPart) -> Result<IValue, Error> {
    let mut text = String::new();
    for part in &result.content {
        match part {
            Part::Text(part) => text.push_str(&part.text),
            other => {
                return Err(Error::request(format!(
                    "tool result '{}' contains a {} part; only text is supported",
                    result.tool_call_id,
                    other.kind()
                )))
            }
        }
    }

    let object = match serde_json::from_str::<Value>(&text) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    };
    let response = match (result.is_error.unwrap_or(false), object) {
        (false, Some(object)) => object,
        (false, None) => json!({ "output": text }),
        (true, Some(object)) => json!({ "error": object }),
        (true, None) => json!({ "error": text }),
    };
    ijson::to_value(response).map_err(|e| Error::request(format!("invalid tool result: {e}")))
}

fn convert_tool(tool: &Tool) -> Result<FunctionDeclaration, Error> {
    let parameters_json_schema = match &tool.parameters {
        Value::Null => None,
        schema => Some(raw_json(schema)?),
    };
    Ok(FunctionDeclaration {
        name: tool.name.clone(),
        description: tool.description.clone(),
        parameters_json_schema,
    })
}

fn convert_tool_choice(choice: &ToolChoice) -> ToolConfig {
    let (mode, allowed_function_names) = match choice {
        ToolChoice::Auto => ("AUTO", None),
        ToolChoice::None => ("NONE", None),
        ToolChoice::Required => ("ANY", None),
        ToolChoice::Tool { tool_name } => ("ANY", Some(vec![tool_name.clone()])),
    };
    ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode,
            allowed_function_names,
        },
    }
}

fn generation_config(input: &LanguageModelInput) -> Result<GenerationConfig, Error> {
    let mut config = GenerationConfig {
        max_output_tokens: input.max_tokens,
        temperature: input.temperature,
        top_p: input.top_p,
        top_k: input.top_k,
        presence_penalty: input.presence_penalty,
        frequency_penalty: input.frequency_penalty,
        seed: input.seed,
        ..GenerationConfig::default()
    };

    if let Some(ResponseFormat::Json { schema, .. }) = &input.response_format {
        config.response_mime_type = Some("application/json");
        config.response_json_schema = schema.as_ref().map(raw_json).transpose()?;
    }

    if !input.modalities.is_empty() {
        config.response_modalities = Some(
            input
                .modalities
                .iter()
                .map(|modality| match modality {
                    Modality::Text => "TEXT",
                    Modality::Image => "IMAGE",
                    Modality::Audio => "AUDIO",
                })
                .collect(),
        );
    }

    if let Some(audio) = &input.audio {
        config.speech_config = Some(SpeechConfig {
            voice_config: audio.voice.clone().map(|voice_name| VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig { voice_name },
            }),
            language_code: audio.language.clone(),
        });
    }

    if let Some(reasoning) = &input.reasoning {
        // A zero budget is what turns thinking off on models that think by default.
        let thinking_budget = match (reasoning.enabled, reasoning.budget_tokens) {
            (_, Some(budget)) => Some(budget),
            (false, None) => Some(0),
            (true, None) => None,
        };
        config.thinking_config = Some(ThinkingConfig {
            include_thoughts: reasoning.enabled,
            thinking_budget,
        });
    }

    Ok(config)
}

fn raw_json(value: &Value) -> Result<Box<RawValue>, Error> {
    serde_json::value::to_raw_value(value)
        .map_err(|e| Error::request(format!("invalid JSON schema: {e}")))
}

fn audio_mime_type(audio: &AudioPart) -> String {
    match audio.format {
        AudioFormat::Wav => "audio/wav".to_string(),
        AudioFormat::Mp3 => "audio/mpeg".to_string(),
        AudioFormat::Linear16 => format!(
            "audio/L16;codec=pcm;rate={}",
            audio.sample_rate.unwrap_or(DEFAULT_PCM_RATE)
        ),
        AudioFormat::Flac => "audio/flac".to_string(),
        AudioFormat::Mulaw => "audio/basic".to_string(),
        AudioFormat::Alaw => "audio/alaw".to_string(),
        AudioFormat::Aac => "audio/aac".to_string(),
        AudioFormat::Opus => "audio/ogg".to_string(),
    }
}

/// Map an audio MIME type to its format, sample rate and channel count.
fn parse_audio_mime(mime_type: &str) -> Option<(AudioFormat, Option<u32>, Option<u32>)> {
    let (essence, params) = mime_type.split_once(';').unwrap_or((mime_type, ""));
    let rate = params
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok());

    let format = match essence.trim().to_ascii_lowercase().as_str() {
        "audio/l16" | "audio/pcm" => return Some((AudioFormat::Linear16, rate, Some(1))),
        "audio/wav" | "audio/wave" | "audio/x-wav" => AudioFormat::Wav,
        "audio/mpeg" | "audio/mp3" => AudioFormat::Mp3,
        "audio/flac" => AudioFormat::Flac,
        "audio/basic" | "audio/mulaw" => AudioFormat::Mulaw,
        "audio/alaw" => AudioFormat::Alaw,
        "audio/aac" => AudioFormat::Aac,
        "audio/ogg" | "audio/opus" => AudioFormat::Opus,
        _ => return None,
    };
    Some((format, rate, None))
}

fn new_tool_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

fn tool_call_id(id: Option<String>) -> String {
    id.filter(|id| !id.is_empty()).unwrap_or_else(new_tool_call_id)
}

pub(crate) fn map_finish_reason(reason: &str, has_tool_calls: bool) -> FinishReason {
    match reason {
        "STOP" if has_tool_calls => FinishReason::ToolCalls,
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "IMAGE_SAFETY" => {
            FinishReason::ContentFilter
        }
        "MALFORMED_FUNCTION_CALL" => FinishReason::Error,
        other => FinishReason::Other(other.to_string()),
    }
}

fn decode_inline_data(inline: InlineData) -> Result<Option<Part>, Error> {
    let data = BASE64
        .decode(inline.data.as_bytes())
        .map_err(|e| Error::protocol(PROVIDER, format!("invalid inlineData payload: {e}")))?;

    if inline.mime_type.to_ascii_lowercase().starts_with("image/") {
        return Ok(Some(Part::Image(ImagePart {
            data,
            mime_type: inline.mime_type,
            width: None,
            height: None,
        })));
    }

    match parse_audio_mime(&inline.mime_type) {
        Some((format, sample_rate, channels)) => Ok(Some(Part::Audio(AudioPart {
            audio_id: None,
            transcript: None,
            data,
            format,
            sample_rate,
            channels,
        }))),
        None => {
            warn!(mime_type = %inline.mime_type, "ignoring inline data of unsupported type");
            Ok(None)
        }
    }
}

fn is_signature_only(text: &str, signature: &Option<Signature>) -> bool {
    text.is_empty() && signature.is_some()
}

fn take_signature(part: &mut WirePart) -> Option<Signature> {
    part.thought_signature
        .take()
        .filter(|signature| !signature.is_empty())
        .map(Signature::new)
}

/// Convert one wire part of a complete response, appending to `content`.
fn parse_part(mut part: WirePart, content: &mut Vec<Part>) -> Result<(), Error> {
    let thought = part.is_thought();
    let signature = take_signature(&mut part);

    if let Some(call) = part.function_call {
        let args: Value = serde_json::to_value(&call.args)
            .map_err(|e| Error::protocol(PROVIDER, format!("invalid functionCall args: {e}")))?;
        let args = match args {
            Value::Null => json!({}),
            args @ Value::Object(_) => args,
            other => {
                return Err(Error::protocol(
                    PROVIDER,
                    format!("functionCall args for '{}' is not an object: {other}", call.name),
                ))
            }
        };
        content.push(Part::ToolCall(ToolCallPart {
            tool_call_id: tool_call_id(call.id),
            tool_name: call.name,
            args,
            thought_signature: signature,
        }));
        return Ok(());
    }

    if let Some(inline) = part.inline_data {
        if let Some(part) = decode_inline_data(inline)? {
            push_merged(content, part);
        }
        return Ok(());
    }

    match part.text {
        Some(text) if thought || is_signature_only(&text, &signature) => {
            push_merged(content, Part::Reasoning(ReasoningPart { text, signature }));
        }
        Some(text) => {
            push_merged(content, Part::text(text));
            if signature.is_some() {
                // Carried as an empty reasoning part so the next turn can echo it.
                push_merged(
                    content,
                    Part::Reasoning(ReasoningPart {
                        text: String::new(),
                        signature,
                    }),
                );
            }
        }
        None if signature.is_some() => push_merged(
            content,
            Part::Reasoning(ReasoningPart {
                text: String::new(),
                signature,
            }),
        ),
        None => {
            if part.function_response.is_some() {
                warn!("ignoring functionResponse part in model output");
            } else {
                warn!("ignoring part without a supported payload");
            }
        }
    }
    Ok(())
}

/// Append `part`, growing the previous part the way a stream would.
fn push_merged(content: &mut Vec<Part>, part: Part) {
    let empty = match &part {
        Part::Text(text) => text.text.is_empty(),
        Part::Reasoning(reasoning) => reasoning.text.is_empty() && reasoning.signature.is_none(),
        _ => false,
    };
    if empty {
        return;
    }

    let part = match content.last_mut() {
        Some(previous) => match merge_into(previous, part) {
            Some(part) => part,
            None => return,
        },
        None => part,
    };
    content.push(part);
}

/// Returns `next` back when it cannot extend `previous`.
fn merge_into(previous: &mut Part, next: Part) -> Option<Part> {
    match (previous, next) {
        (Part::Text(previous), Part::Text(next)) => {
            previous.text.push_str(&next.text);
            None
        }
        // Signatures are set once, so a second one starts a new part.
        (Part::Reasoning(previous), Part::Reasoning(next))
            if previous.signature.is_none() || next.signature.is_none() =>
        {
            previous.text.push_str(&next.text);
            if previous.signature.is_none() {
                previous.signature = next.signature;
            }
            None
        }
        (Part::Audio(previous), Part::Audio(next))
            if previous.format == next.format
                && previous.sample_rate == next.sample_rate
                && previous.channels == next.channels =>
        {
            previous.data.extend(next.data);
            None
        }
        (_, next) => Some(next),
    }
}

/// Convert a complete `generateContent` response.
pub(crate) fn parse_response(response: GenerateContentResponse) -> Result<ModelResponse, Error> {
    let GenerateContentResponse {
        candidates,
        usage_metadata,
        prompt_feedback,
        error,
        ..
    } = response;

    if let Some(error) = error {
        return Err(Error::protocol(PROVIDER, error.to_string()));
    }

    let usage = usage_metadata.map(Usage::from);
    let Some(candidate) = candidates.into_iter().next() else {
        if let Some(reason) = prompt_feedback.and_then(|feedback| feedback.block_reason) {
            debug!(%reason, "prompt was blocked");
            return Ok(ModelResponse {
                content: Vec::new(),
                usage,
                finish_reason: Some(FinishReason::ContentFilter),
            });
        }
        return Err(Error::protocol(PROVIDER, "response contained no candidates"));
    };

    let mut content = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        parse_part(part, &mut content)?;
    }

    let has_tool_calls = content.iter().any(|part| matches!(part, Part::ToolCall(_)));
    let finish_reason = candidate
        .finish_reason
        .as_deref()
        .map(|reason| map_finish_reason(reason, has_tool_calls));

    Ok(ModelResponse {
        content,
        usage,
        finish_reason,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growable {
    Text,
    Reasoning,
    Audio,
}

#[derive(Debug, Clone, Copy)]
struct OpenPart {
    kind: Growable,
    index: usize,
    signed: bool,
}

/// Assigns unified part indices to streamed wire parts.
///
/// Gemini numbers parts per chunk, so positions repeat across chunks. Text,
/// reasoning and audio keep growing the open part while the kind repeats;
/// tool calls and images always take a fresh index. Usage and the finish
/// reason are held back and reported once by [`StreamState::finish`].
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    next_index: usize,
    open: Option<OpenPart>,
    has_tool_calls: bool,
    usage: Option<UsageMetadata>,
    finish_reason: Option<FinishReason>,
    chunks: usize,
}

impl StreamState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn take_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// A part that may keep growing. A second signature closes a reasoning
    /// part, since signatures are set once per part.
    fn growable_index(&mut self, kind: Growable, signed: bool) -> usize {
        if let Some(open) = self.open.as_mut() {
            if open.kind == kind && !(signed && open.signed) {
                open.signed |= signed;
                return open.index;
            }
        }
        let index = self.take_index();
        self.open = Some(OpenPart {
            kind,
            index,
            signed,
        });
        index
    }

    fn standalone_index(&mut self) -> usize {
        self.open = None;
        self.take_index()
    }

    /// Turn one decoded chunk into partial responses.
    pub(crate) fn process(
        &mut self,
        chunk: GenerateContentResponse,
    ) -> Result<Vec<PartialResponse>, Error> {
        let GenerateContentResponse {
            candidates,
            usage_metadata,
            prompt_feedback,
            error,
            ..
        } = chunk;

        if let Some(error) = error {
            return Err(Error::protocol(PROVIDER, error.to_string()));
        }

        self.chunks += 1;
        // Every chunk repeats the running totals.
        if usage_metadata.is_some() {
            self.usage = usage_metadata;
        }

        let mut partials = Vec::new();
        let Some(candidate) = candidates.into_iter().next() else {
            if let Some(reason) = prompt_feedback.and_then(|feedback| feedback.block_reason) {
                debug!(%reason, "prompt was blocked");
                self.finish_reason = Some(FinishReason::ContentFilter);
            }
            return Ok(partials);
        };

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            self.plan_part(part, &mut partials)?;
        }

        if let Some(reason) = candidate.finish_reason {
            self.finish_reason = Some(map_finish_reason(&reason, self.has_tool_calls));
        }

        Ok(partials)
    }

    fn plan_part(
        &mut self,
        mut part: WirePart,
        partials: &mut Vec<PartialResponse>,
    ) -> Result<(), Error> {
        let thought = part.is_thought();
        let signature = take_signature(&mut part);

        if let Some(call) = part.function_call {
            self.has_tool_calls = true;
            let index = self.standalone_index();
            let args = match &call.args {
                args if args.is_null() => "{}".to_string(),
                args => serde_json::to_string(args).map_err(|e| {
                    Error::protocol(PROVIDER, format!("invalid functionCall args: {e}"))
                })?,
            };
            debug!(index, tool = %call.name, "tool call");
            partials.push(PartialResponse::delta(
                index,
                PartDelta::ToolCall(ToolCallPartDelta {
                    tool_call_id: Some(tool_call_id(call.id)),
                    tool_name: Some(call.name),
                    args: Some(args),
                    thought_signature: signature,
                }),
            ));
            return Ok(());
        }

        if let Some(inline) = part.inline_data {
            match decode_inline_data(inline)? {
                Some(Part::Audio(audio)) => {
                    let index = self.growable_index(Growable::Audio, false);
                    partials.push(PartialResponse::delta(
                        index,
                        PartDelta::Audio(AudioPartDelta {
                            audio_id: None,
                            data: audio.data,
                            format: Some(audio.format),
                            sample_rate: audio.sample_rate,
                            channels: audio.channels,
                            transcript: None,
                        }),
                    ));
                }
                Some(Part::Image(image)) => {
                    let index = self.standalone_index();
                    partials.push(PartialResponse::delta(index, PartDelta::Image(image)));
                }
                _ => {}
            }
            return Ok(());
        }

        let text = match part.text {
            Some(text) => text,
            None if signature.is_some() => String::new(),
            None => {
                warn!("ignoring streamed part without a supported payload");
                return Ok(());
            }
        };

        if thought || is_signature_only(&text, &signature) {
            self.plan_reasoning(text, signature, partials);
            return Ok(());
        }

        if !text.is_empty() {
            let index = self.growable_index(Growable::Text, false);
            partials.push(PartialResponse::text(index, text));
        }
        if signature.is_some() {
            // Same shape as a complete response: an empty reasoning part after the text.
            self.plan_reasoning(String::new(), signature, partials);
        }
        Ok(())
    }

    fn plan_reasoning(
        &mut self,
        text: String,
        signature: Option<Signature>,
        partials: &mut Vec<PartialResponse>,
    ) {
        if text.is_empty() && signature.is_none() {
            return;
        }
        let index = self.growable_index(Growable::Reasoning, signature.is_some());
        partials.push(PartialResponse::delta(
            index,
            PartDelta::Reasoning(ReasoningPartDelta { text, signature }),
        ));
    }

    /// The closing partial: final usage and finish reason.
    pub(crate) fn finish(&mut self) -> Result<PartialResponse, Error> {
        let finish_reason = self.finish_reason.take().ok_or_else(|| {
            Error::protocol(PROVIDER, "stream ended without a finish reason")
        })?;
        debug!(chunks = self.chunks, parts = self.next_index, "stream complete");
        Ok(PartialResponse::finish(
            self.usage.take().map(Usage::from),
            Some(finish_reason),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::StreamAccumulator;
    use crate::types::{AudioOptions, ReasoningOptions};

    fn chunk(json: &str) -> GenerateContentResponse {
        serde_json::from_str(json).unwrap()
    }

    fn request_json(input: &LanguageModelInput) -> Value {
        serde_json::to_value(build_request(input).unwrap()).unwrap()
    }

    #[test]
    fn test_build_request_basic() {
        let input = LanguageModelInput::user("Hello")
            .with_system_prompt("Be brief.")
            .max_tokens(256)
            .temperature(0.2);
        let body = request_json(&input);

        assert_eq!(
            body["systemInstruction"],
            json!({"parts": [{"text": "Be brief."}]})
        );
        assert_eq!(
            body["contents"],
            json!([{"role": "user", "parts": [{"text": "Hello"}]}])
        );
        assert_eq!(body["generationConfig"]["maxOutputTokens"], json!(256));
        assert!(body.get("tools").is_none());
        assert!(body.get("toolConfig").is_none());
    }

    #[test]
    fn test_build_request_tools_and_choice() {
        let input = LanguageModelInput::user("Weather in Paris?")
            .with_tools(vec![Tool::new(
                "get_weather",
                "Get the weather",
                json!({"type": "object", "properties": {"city": {"type": "string"}}}),
            )])
            .with_tool_choice(ToolChoice::Tool {
                tool_name: "get_weather".into(),
            });
        let body = request_json(&input);

        let declaration = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(declaration["name"], "get_weather");
        assert_eq!(
            declaration["parametersJsonSchema"]["properties"]["city"]["type"],
            "string"
        );
        assert_eq!(
            body["toolConfig"],
            json!({"functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": ["get_weather"]}})
        );
    }

    #[test]
    fn test_build_request_tool_round_trip_contents() {
        let input = LanguageModelInput::new(vec![
            Message::user([Part::text("What is 2+2?")]),
            Message::assistant([Part::ToolCall(
                ToolCallPart {
                    tool_call_id: "call_1".into(),
                    tool_name: "add".into(),
                    args: json!({"a": 2, "b": 2}),
                    thought_signature: None,
                }
                .with_thought_signature("c2lnbmF0dXJl"),
            )]),
            Message::tool([Part::tool_result("call_1", "add", vec![Part::text("4")])]),
        ]);
        let body = request_json(&input);

        assert_eq!(
            body["contents"][1],
            json!({"role": "model", "parts": [{
                "functionCall": {"name": "add", "args": {"a": 2, "b": 2}},
                "thoughtSignature": "c2lnbmF0dXJl"
            }]})
        );
        assert_eq!(
            body["contents"][2],
            json!({"role": "user", "parts": [{
                "functionResponse": {"name": "add", "response": {"output": "4"}}
            }]})
        );
    }

    #[test]
    fn test_tool_result_payloads() {
        let mut result = ToolResultPart {
            tool_call_id: "call_1".into(),
            tool_name: "lookup".into(),
            content: vec![Part::text(r#"{"temp": 21}"#)],
            is_error: None,
        };
        let value = serde_json::to_value(tool_result_response(&result).unwrap()).unwrap();
        assert_eq!(value, json!({"temp": 21}));

        result.is_error = Some(true);
        result.content = vec![Part::text("city not found")];
        let value = serde_json::to_value(tool_result_response(&result).unwrap()).unwrap();
        assert_eq!(value, json!({"error": "city not found"}));

        result.content = vec![Part::image(vec![1, 2, 3], "image/png")];
        assert!(matches!(
            tool_result_response(&result),
            Err(Error::Request(_))
        ));
    }

    #[test]
    fn test_build_request_generation_options() {
        let input = LanguageModelInput::user("Say hi")
            .with_modalities(vec![Modality::Text, Modality::Audio])
            .with_audio(AudioOptions {
                voice: Some("Kore".into()),
                language: Some("en-US".into()),
            })
            .with_reasoning(ReasoningOptions {
                enabled: true,
                budget_tokens: Some(1024),
            })
            .with_response_format(ResponseFormat::Json {
                name: "greeting".into(),
                description: None,
                schema: Some(json!({"type": "object"})),
            })
            .top_k(40)
            .seed(7);
        let config = &request_json(&input)["generationConfig"];

        assert_eq!(config["responseModalities"], json!(["TEXT", "AUDIO"]));
        assert_eq!(
            config["speechConfig"],
            json!({
                "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": "Kore"}},
                "languageCode": "en-US"
            })
        );
        assert_eq!(
            config["thinkingConfig"],
            json!({"includeThoughts": true, "thinkingBudget": 1024})
        );
        assert_eq!(config["responseMimeType"], "application/json");
        assert_eq!(config["responseJsonSchema"], json!({"type": "object"}));
        assert_eq!(config["topK"], 40);
        assert_eq!(config["seed"], 7);
    }

    #[test]
    fn test_build_request_does_not_touch_input() {
        let input = LanguageModelInput::user("Hi").with_tools(vec![Tool::new(
            "noop",
            "Does nothing",
            json!({"type": "object"}),
        )]);
        let before = input.clone();
        build_request(&input).unwrap();
        assert_eq!(input, before);
    }

    #[test]
    fn test_parse_response_text_and_tool_call() {
        let response = parse_response(chunk(
            r#"{
                "candidates": [{
                    "content": {"role": "model", "parts": [
                        {"text": "Checking."},
                        {"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}, "thoughtSignature": "AbC+/dEf=="}
                    ]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 8, "thoughtsTokenCount": 3}
            }"#,
        ))
        .unwrap();

        assert_eq!(response.text(), "Checking.");
        let calls = response.tool_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].tool_call_id.starts_with("call_"));
        assert_eq!(calls[0].args, json!({"city": "Paris"}));
        assert_eq!(
            calls[0].thought_signature.as_ref().map(Signature::as_str),
            Some("AbC+/dEf==")
        );
        assert_eq!(response.finish_reason, Some(FinishReason::ToolCalls));

        let usage = response.usage.unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 8);
        assert_eq!(usage.reasoning_tokens, Some(3));
    }

    #[test]
    fn test_parse_response_uses_wire_call_id() {
        let response = parse_response(chunk(
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"id":"fc-7","name":"f"}}]},"finishReason":"STOP"}]}"#,
        ))
        .unwrap();
        assert_eq!(response.tool_calls()[0].tool_call_id, "fc-7");
        assert_eq!(response.tool_calls()[0].args, json!({}));
    }

    #[test]
    fn test_parse_response_reasoning_parts() {
        let response = parse_response(chunk(
            r#"{"candidates":[{"content":{"parts":[
                {"text": "Let me think.", "thought": true},
                {"text": "Answer."},
                {"thoughtSignature": "c2ln"}
            ]},"finishReason":"STOP"}]}"#,
        ))
        .unwrap();

        assert_eq!(response.content.len(), 3);
        assert_eq!(response.content[0], Part::reasoning("Let me think."));
        assert_eq!(response.content[1], Part::text("Answer."));
        assert_eq!(
            response.content[2],
            Part::Reasoning(ReasoningPart {
                text: String::new(),
                signature: Some(Signature::new("c2ln")),
            })
        );
        assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn test_parse_response_pcm_audio() {
        let data = BASE64.encode([0u8, 1, 2, 3]);
        let response = parse_response(chunk(&format!(
            r#"{{"candidates":[{{"content":{{"parts":[{{"inlineData":{{"mimeType":"audio/L16;codec=pcm;rate=24000","data":"{data}"}}}}]}},"finishReason":"STOP"}}]}}"#
        )))
        .unwrap();

        let Part::Audio(audio) = &response.content[0] else {
            panic!("expected audio, got {:?}", response.content[0]);
        };
        assert_eq!(audio.format, AudioFormat::Linear16);
        assert_eq!(audio.sample_rate, Some(24000));
        assert_eq!(audio.channels, Some(1));
        assert_eq!(audio.data, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_parse_response_errors() {
        let error = parse_response(chunk(
            r#"{"error":{"code":500,"message":"internal","status":"INTERNAL"}}"#,
        ))
        .unwrap_err();
        assert!(matches!(error, Error::Protocol { .. }));

        let blocked =
            parse_response(chunk(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#)).unwrap();
        assert!(blocked.content.is_empty());
        assert_eq!(blocked.finish_reason, Some(FinishReason::ContentFilter));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("STOP", false), FinishReason::Stop);
        assert_eq!(map_finish_reason("MAX_TOKENS", false), FinishReason::Length);
        assert_eq!(map_finish_reason("RECITATION", false), FinishReason::ContentFilter);
        assert_eq!(
            map_finish_reason("MALFORMED_FUNCTION_CALL", false),
            FinishReason::Error
        );
        assert_eq!(
            map_finish_reason("LANGUAGE", false),
            FinishReason::Other("LANGUAGE".into())
        );
    }

    #[test]
    fn test_signature_survives_round_trip() {
        let signature = "CiQBVKhc7v1m+Yt/3Zq0kq9w5yB2xXj0q3nL8aZf0sQ==";
        let response = parse_response(chunk(&format!(
            r#"{{"candidates":[{{"content":{{"parts":[{{"functionCall":{{"name":"lookup","args":{{"q":"x"}}}},"thoughtSignature":"{signature}"}}]}},"finishReason":"STOP"}}]}}"#
        )))
        .unwrap();

        let follow_up = LanguageModelInput::user("Look it up").with_response(&response);
        let body = request_json(&follow_up);
        assert_eq!(body["contents"][1]["parts"][0]["thoughtSignature"], signature);
    }

    #[test]
    fn test_text_signature_survives_round_trip() {
        let response = parse_response(chunk(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Answer.","thoughtSignature":"c2lnLXRleHQ="}]},"finishReason":"STOP"}]}"#,
        ))
        .unwrap();

        assert_eq!(
            response.content,
            vec![
                Part::text("Answer."),
                Part::Reasoning(ReasoningPart {
                    text: String::new(),
                    signature: Some(Signature::new("c2lnLXRleHQ=")),
                }),
            ]
        );
        assert_eq!(response.text(), "Answer.");

        let follow_up = LanguageModelInput::user("Why?").with_response(&response);
        let body = request_json(&follow_up);
        assert_eq!(
            body["contents"][1],
            json!({"role": "model", "parts": [{"text": "Answer.", "thoughtSignature": "c2lnLXRleHQ="}]})
        );
    }

    #[test]
    fn test_bare_signature_without_text_is_sent_alone() {
        let input = LanguageModelInput::new(vec![
            Message::user([Part::text("Hi")]),
            Message::assistant([Part::Reasoning(ReasoningPart {
                text: String::new(),
                signature: Some(Signature::new("c2ln")),
            })]),
        ]);
        let body = request_json(&input);
        assert_eq!(
            body["contents"][1]["parts"],
            json!([{"text": "", "thoughtSignature": "c2ln"}])
        );
    }

    #[test]
    fn test_parse_response_merges_adjacent_parts() {
        let response = parse_response(chunk(
            r#"{"candidates":[{"content":{"parts":[
                {"text": "First, ", "thought": true},
                {"text": "then.", "thought": true},
                {"text": "Hello"},
                {"text": " there"},
                {"functionCall": {"name": "f", "args": {}}},
                {"text": "Bye"}
            ]},"finishReason":"STOP"}]}"#,
        ))
        .unwrap();

        assert_eq!(response.content.len(), 4);
        assert_eq!(response.content[0], Part::reasoning("First, then."));
        assert_eq!(response.content[1], Part::text("Hello there"));
        assert!(matches!(response.content[2], Part::ToolCall(_)));
        assert_eq!(response.content[3], Part::text("Bye"));
    }

    fn accumulate(chunks: &[&str]) -> Result<ModelResponse, Error> {
        let mut state = StreamState::new();
        let mut accumulator = StreamAccumulator::new();
        for json in chunks {
            for partial in state.process(chunk(json))? {
                accumulator.add_partial(partial)?;
            }
        }
        accumulator.add_partial(state.finish()?)?;
        accumulator.compute_response()
    }

    #[test]
    fn test_stream_text_continues_across_chunks() {
        let response = accumulate(&[
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello"}]}}],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":1}}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":" world"}]}}],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":2}}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"!"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":3}}"#,
        ])
        .unwrap();

        assert_eq!(response.content, vec![Part::text("Hello world!")]);
        let usage = response.usage.unwrap();
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 3);
        assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn test_stream_index_planning() {
        let mut state = StreamState::new();
        let indices = |partials: Vec<PartialResponse>| {
            partials
                .into_iter()
                .map(|p| p.delta.unwrap().index)
                .collect::<Vec<_>>()
        };

        let first = state
            .process(chunk(
                r#"{"candidates":[{"content":{"parts":[{"text":"plan","thought":true},{"text":"Sure"}]}}]}"#,
            ))
            .unwrap();
        assert_eq!(indices(first), vec![0, 1]);

        let second = state
            .process(chunk(
                r#"{"candidates":[{"content":{"parts":[{"text":", calling."},{"functionCall":{"name":"a","args":{}}},{"functionCall":{"name":"b","args":{}}}]}}]}"#,
            ))
            .unwrap();
        assert_eq!(indices(second), vec![1, 2, 3]);

        let third = state
            .process(chunk(
                r#"{"candidates":[{"content":{"parts":[{"text":"Done"}]},"finishReason":"STOP"}]}"#,
            ))
            .unwrap();
        assert_eq!(indices(third), vec![4]);

        let finish = state.finish().unwrap();
        assert_eq!(finish.finish_reason, Some(FinishReason::ToolCalls));
    }

    #[test]
    fn test_stream_tool_call_with_signature() {
        let response = accumulate(&[
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"get_weather","args":{"city":"Oslo"}},"thoughtSignature":"c2lnLTE="}]},"finishReason":"STOP"}]}"#,
        ])
        .unwrap();

        let call = response.tool_calls()[0];
        assert_eq!(call.args, json!({"city": "Oslo"}));
        assert_eq!(
            call.thought_signature.as_ref().map(Signature::as_str),
            Some("c2lnLTE=")
        );
    }

    #[test]
    fn test_stream_reasoning_signature_arrives_late() {
        let response = accumulate(&[
            r#"{"candidates":[{"content":{"parts":[{"text":"Thinking","thought":true}]}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{"text":" more","thought":true,"thoughtSignature":"c2ln"}]}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{"text":"Answer"}]},"finishReason":"STOP"}]}"#,
        ])
        .unwrap();

        assert_eq!(
            response.content,
            vec![
                Part::Reasoning(ReasoningPart {
                    text: "Thinking more".into(),
                    signature: Some(Signature::new("c2ln")),
                }),
                Part::text("Answer"),
            ]
        );
    }

    #[test]
    fn test_stream_matches_generate_for_signed_text() {
        let streamed = accumulate(&[
            r#"{"candidates":[{"content":{"parts":[{"text":"Mull","thought":true}]}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{"text":"ing.","thought":true},{"text":"Ans"}]}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{"text":"wer.","thoughtSignature":"c2lnLXRleHQ="}]},"finishReason":"STOP"}]}"#,
        ])
        .unwrap();
        let complete = parse_response(chunk(
            r#"{"candidates":[{"content":{"parts":[
                {"text":"Mulling.","thought":true},
                {"text":"Answer.","thoughtSignature":"c2lnLXRleHQ="}
            ]},"finishReason":"STOP"}]}"#,
        ))
        .unwrap();

        assert_eq!(streamed.content, complete.content);
        assert_eq!(
            streamed.content[2],
            Part::Reasoning(ReasoningPart {
                text: String::new(),
                signature: Some(Signature::new("c2lnLXRleHQ=")),
            })
        );
    }

    #[test]
    fn test_stream_error_payload() {
        let mut state = StreamState::new();
        let result = state.process(chunk(
            r#"{"error":{"code":429,"message":"quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#,
        ));
        assert!(matches!(result, Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_stream_without_finish_reason_is_incomplete() {
        let mut state = StreamState::new();
        state
            .process(chunk(r#"{"candidates":[{"content":{"parts":[{"text":"Hel"}]}}]}"#))
            .unwrap();
        assert!(matches!(state.finish(), Err(Error::Protocol { .. })));
    }
}
