//! Backend adapters implementing [`LanguageModel`](crate::LanguageModel).

pub mod google;

pub use google::{GoogleModel, GoogleModelOptions};
