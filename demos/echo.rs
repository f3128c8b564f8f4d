//! Echo node - serves one channel until Ctrl-C.
//!
//! Command scripts are read from `$ORIGAMI_SCRIPTS` (default `./scripts`).
//!
//! ```text
//! RUST_LOG=origami_client=debug cargo run --example echo
//! ```
//!
//! Run `requester` next to it to send work.

use origami_client::{ChannelOptions, Client, HandlerError, RequestContext};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Deserialize, Debug)]
struct EchoInput {
    message: String,
}

#[derive(Serialize, Debug)]
struct EchoOutput {
    echo: String,
    served_by: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let scripts = std::env::var("ORIGAMI_SCRIPTS").unwrap_or_else(|_| "scripts".to_string());
    let served_by = std::process::id().to_string();

    let client = Client::builder()
        .scripts_dir(scripts)
        .app_name("echo-demo")
        .channel(
            "echo",
            ChannelOptions::default().concurrent(8),
            move |input: EchoInput, ctx: RequestContext| {
                let served_by = served_by.clone();
                async move {
                    if input.message.is_empty() {
                        return Err(HandlerError::named("ValidationError", "empty message"));
                    }
                    tracing::info!(request_id = ctx.request_id(), "echo from {}", ctx.sender_id());
                    Ok(EchoOutput {
                        echo: input.message,
                        served_by,
                    })
                }
            },
        )
        .on_reconnect(|| tracing::info!("reconnected"))
        .on_error(|e| tracing::warn!("link error: {}", e))
        .start()
        .await?;

    tracing::info!(node_id = client.node_id(), "serving channel echo");

    tokio::signal::ctrl_c().await?;
    client.stop().await?;
    Ok(())
}
