use tokio_util::sync::CancellationToken;

use crate::{Error, LanguageModelInput, ModelResponse, PartialStream};

/// The contract every provider adapter satisfies.
///
/// Callers and the accumulator depend only on this trait, never on a
/// concrete backend. Implementations hold read-only configuration and may be
/// shared across concurrent calls.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync + 'static {
    /// Provider identifier, e.g. "google".
    fn provider(&self) -> &'static str;

    /// Model name as sent to the backend.
    fn model_id(&self) -> &str;

    /// Perform one blocking round trip.
    async fn generate(
        &self,
        cancel: &CancellationToken,
        input: &LanguageModelInput,
    ) -> Result<ModelResponse, Error>;

    /// Start a streaming generation. The returned stream reads from the
    /// network only when polled and ends with an error if the backend fails.
    async fn stream(
        &self,
        cancel: &CancellationToken,
        input: &LanguageModelInput,
    ) -> Result<PartialStream, Error>;
}
