//! Requester node - sends a few requests to the `echo` channel.
//!
//! ```text
//! cargo run --example requester -- "hello" "world"
//! ```

use std::time::Duration;

use origami_client::{Client, RequestOptions, ResponseError};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let scripts = std::env::var("ORIGAMI_SCRIPTS").unwrap_or_else(|_| "scripts".to_string());
    let client = Client::builder()
        .scripts_dir(scripts)
        .app_name("requester-demo")
        .start()
        .await?;

    let mut messages: Vec<String> = std::env::args().skip(1).collect();
    if messages.is_empty() {
        messages = vec!["hello".into(), String::new()];
    }

    let options = RequestOptions::default().timeout(Duration::from_secs(5));
    for message in messages {
        let pending = client.request("echo", &json!({ "message": message }), options.clone())?;

        match pending.await {
            Ok(value) => println!("{} -> {}", message, value),
            Err(ResponseError::Processing(record)) => println!("{} -> failed: {}", message, record),
            Err(e) => println!("{} -> {}", message, e),
        }
    }

    client.stop().await?;
    Ok(())
}
