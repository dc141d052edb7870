use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::convert::{build_request, parse_response, StreamState};
use super::options::{GoogleAction, GoogleModelOptions};
use super::types::{ErrorEnvelope, GenerateContentResponse};
use super::PROVIDER;
use crate::provider::LanguageModel;
use crate::sse_stream::SseStream;
use crate::types::{LanguageModelInput, PartialResponse};
use crate::{Error, ModelResponse, PartialStream};

/// Gemini models served by the Gemini API or Vertex AI.
///
/// Holds only read-only configuration, so one instance can serve concurrent
/// calls.
#[derive(Debug, Clone)]
pub struct GoogleModel {
    model_id: String,
    options: GoogleModelOptions,
    client: Client,
}

impl GoogleModel {
    /// Create a model handle. Credentials are checked when a call is made.
    pub fn new(model_id: impl Into<String>, options: GoogleModelOptions) -> Result<Self, Error> {
        let client = options.client()?;
        Ok(Self {
            model_id: model_id.into(),
            options,
            client,
        })
    }

    pub fn options(&self) -> &GoogleModelOptions {
        &self.options
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        action: GoogleAction,
        input: &LanguageModelInput,
    ) -> Result<reqwest::Response, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let endpoint = self.options.resolve_endpoint(&self.model_id, action)?;
        let body = build_request(input)?;
        debug!(url = %endpoint.url, header = endpoint.auth.name(), "sending request");

        let request = self
            .client
            .post(&endpoint.url)
            .header(endpoint.auth.name(), endpoint.auth.value())
            .json(&body);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            text = response.text() => text?,
        };
        Err(status_error(status, &text))
    }
}

/// 400 means the backend rejected the input; anything else is a protocol failure.
fn status_error(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error.to_string())
        .unwrap_or_else(|_| body.trim().to_string());

    if status == StatusCode::BAD_REQUEST {
        Error::request(format!("HTTP {status}: {message}"))
    } else {
        Error::protocol(PROVIDER, format!("HTTP {status}: {message}"))
    }
}

/// Decode an SSE body into partial responses, ending with the finish partial.
fn decode_stream<S, E>(
    body: S,
    cancel: CancellationToken,
    max_event_bytes: usize,
) -> impl Stream<Item = Result<PartialResponse, Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::try_stream! {
        let mut events = SseStream::new(body).with_max_event_bytes(max_event_bytes);
        let mut state = StreamState::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Some(Err(Error::Cancelled)),
                event = events.next() => event,
            };
            let Some(event) = event else { break };
            let event = event?;

            let data = event.data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }

            let chunk: GenerateContentResponse = serde_json::from_str(data).map_err(|e| {
                Error::protocol(PROVIDER, format!("failed to parse stream chunk: {e}"))
            })?;
            for partial in state.process(chunk)? {
                yield partial;
            }
        }

        yield state.finish()?;
    }
}

#[async_trait::async_trait]
impl LanguageModel for GoogleModel {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    #[instrument(name = "google.generate", skip_all, fields(model = %self.model_id))]
    async fn generate(
        &self,
        cancel: &CancellationToken,
        input: &LanguageModelInput,
    ) -> Result<ModelResponse, Error> {
        let response = self.send(cancel, GoogleAction::Generate, input).await?;

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            body = response.bytes() => body?,
        };
        let response: GenerateContentResponse = serde_json::from_slice(&body)
            .map_err(|e| Error::protocol(PROVIDER, format!("failed to parse response: {e}")))?;
        if let Some(version) = &response.model_version {
            debug!(%version, "model version");
        }

        parse_response(response)
    }

    #[instrument(name = "google.stream", skip_all, fields(model = %self.model_id))]
    async fn stream(
        &self,
        cancel: &CancellationToken,
        input: &LanguageModelInput,
    ) -> Result<PartialStream, Error> {
        let response = self.send(cancel, GoogleAction::Stream, input).await?;
        let body = Box::pin(response.bytes_stream());
        Ok(PartialStream::from_stream(decode_stream(
            body,
            cancel.clone(),
            self.options.max_stream_event_bytes(),
        )))
    }
}
