//! Stream a prompt from Gemini, printing text as it arrives, and fold the
//! partials into a complete response.
//!
//! Configure with the variables read by `GoogleModelOptions::from_env`
//! (a `.env` file works), then run:
//! `cargo run --example stream_accumulate -- "Why is the sky blue?"`

use futures::StreamExt;
use gemini_bridge_llm::{
    CancellationToken, ContentDelta, Error, GoogleModel, GoogleModelOptions, LanguageModel,
    LanguageModelInput, PartDelta, PartialResponse, StreamAccumulator,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gemini_bridge_llm=info")),
        )
        .init();

    let prompt = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Write a haiku about Rust.".to_string());
    let model_id = std::env::var("GOOGLE_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string());

    let mut options = GoogleModelOptions::from_env()?;
    if options.api_key.is_none() && options.access_token.is_none() {
        options = options.with_application_default_credentials().await?;
    }
    let model = GoogleModel::new(model_id, options)?;

    // Ctrl-C cancels the request.
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let input = LanguageModelInput::user(prompt);
    let mut partials = model.stream(&cancel, &input).await?.inspect(|partial| {
        if let Ok(PartialResponse {
            delta: Some(ContentDelta { part: PartDelta::Text(text), .. }),
            ..
        }) = partial
        {
            print!("{}", text.text);
        }
    });

    let mut accumulator = StreamAccumulator::new();
    while let Some(partial) = partials.next().await {
        accumulator.add_partial(partial?)?;
    }
    println!();

    let response = accumulator.compute_response()?;
    println!("\nParts: {}", response.content.len());
    println!("Finish reason: {:?}", response.finish_reason);
    if let Some(usage) = response.usage {
        println!(
            "Usage: {} input, {} output tokens",
            usage.input_tokens, usage.output_tokens
        );
    }
    Ok(())
}
