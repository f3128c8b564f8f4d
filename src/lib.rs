//! # origami-client
//!
//! Reliable request/response messaging for a pool of nodes that share a
//! Redis pub/sub transport.
//!
//! Every node is both a producer and a consumer. A producer submits a request
//! to a logical channel; the server picks a consumer node, and the two sides
//! walk through a handshake of acknowledged phases until the result has been
//! delivered and confirmed.
//!
//! ## Architecture
//!
//! - **Links** (TCP, RESP): heartbeat, listener and publisher connections
//! - **Commands**: server-side scripts loaded per epoch and invoked by handle
//! - **Core**: routes pushes to the producer and consumer state machines and
//!   runs the heartbeat and retry tick
//!
//! ## Example
//!
//! ```ignore
//! use origami_client::{ChannelOptions, Client, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> origami_client::Result<()> {
//!     let client = Client::builder()
//!         .channel("echo", ChannelOptions::default(), |v: serde_json::Value, _ctx| async move {
//!             Ok(v)
//!         })
//!         .start()
//!         .await?;
//!
//!     let reply = client.request("echo", &"ping", RequestOptions::default())?.await;
//!     println!("{:?}", reply);
//!
//!     client.stop().await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;

mod client;
mod consumer;
mod core;
mod drain;
mod producer;
mod table;
mod writer;

#[cfg(test)]
mod testing;

pub use client::{Client, ClientBuilder, ClientState, ErrorHook, LifecycleHook};
pub use config::{ClientConfig, Windows};
pub use control::{ChannelOptions, Command, ReservoirMode};
pub use error::{OrigamiError, Result};
pub use handler::{ErrorRecord, HandlerError, RequestContext};
pub use producer::{PendingResponse, RequestOptions, Response, ResponseError};
pub use writer::WriterConfig;
