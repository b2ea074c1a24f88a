use keywheel::config::Config;
use keywheel::dispatch::{ChatMessage, CompletionRequest};
use keywheel::{CompletionReply, Dispatcher};

/// Smoke binary: `keywheel <provider/model> <prompt>` runs one completion
/// through the full engine with keys taken from the environment.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    let mut args = std::env::args().skip(1);
    let Some(model) = args.next() else {
        anyhow::bail!("usage: keywheel <provider/model> <prompt>");
    };
    let prompt: String = args.collect::<Vec<_>>().join(" ");
    if prompt.is_empty() {
        anyhow::bail!("usage: keywheel <provider/model> <prompt>");
    }

    let config = Config::from_env();
    let dispatcher = Dispatcher::new(config).await;

    let request = CompletionRequest::new(&model, vec![ChatMessage::user(&prompt)]);
    match dispatcher.acompletion(request).await? {
        Some(CompletionReply::Full(response)) => {
            println!("{}", response.content);
            tracing::info!(
                model = %response.model,
                prompt_tokens = response.prompt_tokens,
                completion_tokens = response.completion_tokens,
                "completion finished"
            );
        }
        // Request was built non-streaming; a stream here is a bug upstream.
        Some(CompletionReply::Stream(_)) => {
            tracing::error!("unexpected streaming reply for non-streaming request");
        }
        None => {
            tracing::error!(model, "no response: pool or deadline exhausted");
        }
    }

    dispatcher.close().await;
    Ok(())
}
