//! Client configuration.
//!
//! Every field has a default, so a JSON document only needs the keys it
//! changes. Durations are given in milliseconds:
//!
//! ```
//! use std::time::Duration;
//! use origami_client::config::ClientConfig;
//!
//! let config = ClientConfig::from_json(r#"{
//!     "host": "redis.internal",
//!     "password": "secret",
//!     "requests": { "ack": 3000, "restart": 15000 }
//! }"#).unwrap();
//!
//! assert_eq!(config.port, 6379);
//! assert_eq!(config.requests.ack, Duration::from_secs(3));
//! assert_eq!(config.heartbeat.restart, Duration::from_secs(7));
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::codec::JsonCodec;
use crate::core::CoreSettings;
use crate::error::Result;
use crate::transport::{ConnectionConfig, DEFAULT_CLOSE_GRACE, DEFAULT_CONNECT_TIMEOUT};
use crate::writer::{WriterConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_PENDING_FRAMES};

/// Ack and restart windows of one family of handshakes.
///
/// A phase message unanswered for longer than `ack` is resent; one
/// unanswered for longer than `restart` makes the client rebuild its links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Windows {
    #[serde(deserialize_with = "millis")]
    pub ack: Duration,
    #[serde(deserialize_with = "millis")]
    pub restart: Duration,
}

impl Windows {
    pub const fn new(ack: Duration, restart: Duration) -> Self {
        Self { ack, restart }
    }

    /// Heartbeat and stop handshakes: 2s / 7s.
    pub const HEARTBEAT: Windows = Windows::new(Duration::from_secs(2), Duration::from_secs(7));

    /// Producer and consumer requests: 2s / 10s.
    pub const REQUESTS: Windows = Windows::new(Duration::from_secs(2), Duration::from_secs(10));
}

/// Everything needed to run a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Announced labels; `None` is announced as `"none"`.
    pub node_name: Option<String>,
    pub app_name: Option<String>,
    pub app_version: Option<String>,

    #[serde(deserialize_with = "millis")]
    pub connect_timeout: Duration,
    #[serde(deserialize_with = "millis")]
    pub close_grace: Duration,
    /// Bound on script load, subscribe and announce.
    #[serde(deserialize_with = "millis")]
    pub setup_timeout: Duration,
    #[serde(deserialize_with = "millis")]
    pub auth_timeout: Duration,
    /// Pause between a failed epoch and the next attempt.
    #[serde(deserialize_with = "millis")]
    pub reconnect_timeout: Duration,

    /// Pause before each heartbeat.
    #[serde(deserialize_with = "millis")]
    pub ping_interval: Duration,
    /// Period of the retry tick.
    #[serde(deserialize_with = "millis")]
    pub tick_interval: Duration,
    pub heartbeat: Windows,
    pub requests: Windows,

    /// Where command scripts not registered in code are read from.
    pub scripts_dir: PathBuf,

    /// Queued commands per link before sends fail with backpressure.
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            node_name: None,
            app_name: None,
            app_version: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
            setup_timeout: Duration::from_secs(2),
            auth_timeout: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(1),
            tick_interval: Duration::from_secs(2),
            heartbeat: Windows::HEARTBEAT,
            requests: Windows::REQUESTS,
            scripts_dir: PathBuf::from("scripts"),
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Parse a JSON document; missing keys keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        JsonCodec::decode(text)
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            channel_capacity: self.channel_capacity,
        }
    }

    /// Settings shared by the three links.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.host.clone(),
            port: self.port,
            connect_timeout: self.connect_timeout,
            close_grace: self.close_grace,
            writer: self.writer_config(),
        }
    }

    pub fn core_settings(&self) -> CoreSettings {
        CoreSettings {
            ping_interval: self.ping_interval,
            tick_interval: self.tick_interval,
            heartbeat: self.heartbeat,
            requests: self.requests,
        }
    }
}

fn millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
