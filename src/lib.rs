//! A unified interface over generative language models.
//!
//! Adapters implement [`LanguageModel`]; streamed output is folded into a
//! complete [`ModelResponse`] by the [`StreamAccumulator`]. The Google adapter
//! covers Gemini through the Gemini API and Vertex AI.

pub mod accumulator;
pub mod error;
pub mod provider;
pub mod providers;
pub mod response;
pub mod sse_stream;
pub mod types;

pub use accumulator::StreamAccumulator;
pub use error::Error;
pub use provider::LanguageModel;
pub use providers::*;
pub use response::{ModelResponse, PartialStream};
pub use sse_stream::SseEvent;
pub use types::*;

pub use tokio_util::sync::CancellationToken;
