//! Google Gemini models through the Gemini API or Vertex AI.

mod client;
mod convert;
pub mod options;
pub mod types;

pub use client::GoogleModel;
pub use options::{AuthHeader, Endpoint, GoogleAction, GoogleModelOptions, ProviderType};

pub(crate) const PROVIDER: &str = "google";
