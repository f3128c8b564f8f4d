//! Node announce arguments.
//!
//! The announce command tells the server which channels this node serves
//! and who the node is. Channel descriptors are passed as command keys, five
//! per channel, followed by the node description as plain arguments:
//!
//! ```text
//! keys: name, concurrent, reservoirMode, reservoirSize, reservoirInterval (per channel)
//! args: nodeId, nodeName, appName, appVersion, pid, hostname, platform, clientName, clientVersion
//! ```
//!
//! # Example
//!
//! ```
//! use origami_client::control::{build_announce, ChannelDescriptor, ChannelOptions, NodeInfo};
//!
//! let channels = vec![ChannelDescriptor::new("resize", ChannelOptions::default().concurrent(4))];
//! let node = NodeInfo::new("7c9e6679-7425-40de-944b-e07fc1f90ae7");
//!
//! let announce = build_announce(&channels, &node);
//! assert_eq!(announce.keys, vec!["resize", "4", "0", "0", "0"]);
//! assert_eq!(announce.args[0], "7c9e6679-7425-40de-944b-e07fc1f90ae7");
//! ```

use serde::Deserialize;

/// Client name reported to the server.
pub const CLIENT_NAME: &str = "Rust";

/// Client version reported to the server.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Placeholder for unset labels.
const NONE_LABEL: &str = "none";

/// Rate limiting mode enforced server-side for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservoirMode {
    #[default]
    Disable,
    Enable,
    /// One reservoir per request group.
    Grouped,
}

impl ReservoirMode {
    /// Numeric code sent on the wire.
    pub const fn code(self) -> u8 {
        match self {
            ReservoirMode::Disable => 0,
            ReservoirMode::Enable => 1,
            ReservoirMode::Grouped => 2,
        }
    }
}

/// Rate limiting hints for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct Reservoir {
    pub mode: ReservoirMode,
    pub size: u64,
    /// Refill interval in milliseconds.
    pub interval: u64,
}

/// Hints forwarded to the server when a channel is registered.
///
/// They are not enforced by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Maximum requests processed at once by this node (0 = unlimited).
    pub concurrent: u32,
    pub reservoir: Reservoir,
}

impl ChannelOptions {
    /// Set the concurrency limit.
    pub fn concurrent(mut self, limit: u32) -> Self {
        self.concurrent = limit;
        self
    }

    /// Set the reservoir hints.
    pub fn reservoir(mut self, mode: ReservoirMode, size: u64, interval: u64) -> Self {
        self.reservoir = Reservoir {
            mode,
            size,
            interval,
        };
        self
    }
}

/// A registered channel as announced to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub name: String,
    pub options: ChannelOptions,
}

impl ChannelDescriptor {
    pub fn new(name: &str, options: ChannelOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
        }
    }
}

/// Identity of this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    pub node_name: Option<String>,
    pub app_name: Option<String>,
    pub app_version: Option<String>,
    pub pid: u32,
    pub hostname: String,
    pub platform: String,
}

impl NodeInfo {
    /// Describe the current process.
    pub fn new(node_id: &str) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| NONE_LABEL.to_string());

        Self {
            node_id: node_id.to_string(),
            node_name: None,
            app_name: None,
            app_version: None,
            pid: std::process::id(),
            hostname,
            platform: std::env::consts::OS.to_string(),
        }
    }

    /// Set the optional labels.
    pub fn with_labels(
        mut self,
        node_name: Option<String>,
        app_name: Option<String>,
        app_version: Option<String>,
    ) -> Self {
        self.node_name = node_name;
        self.app_name = app_name;
        self.app_version = app_version;
        self
    }
}

/// Keys and arguments of the announce command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub keys: Vec<String>,
    pub args: Vec<String>,
}

/// Build the announce command arguments.
pub fn build_announce(channels: &[ChannelDescriptor], node: &NodeInfo) -> Announce {
    let mut keys = Vec::with_capacity(channels.len() * 5);

    for channel in channels {
        let options = &channel.options;
        keys.push(channel.name.clone());
        keys.push(options.concurrent.to_string());
        keys.push(options.reservoir.mode.code().to_string());
        keys.push(options.reservoir.size.to_string());
        keys.push(options.reservoir.interval.to_string());
    }

    let label = |value: &Option<String>| value.clone().unwrap_or_else(|| NONE_LABEL.to_string());

    let args = vec![
        node.node_id.clone(),
        label(&node.node_name),
        label(&node.app_name),
        label(&node.app_version),
        node.pid.to_string(),
        node.hostname.clone(),
        node.platform.clone(),
        CLIENT_NAME.to_string(),
        CLIENT_VERSION.to_string(),
    ];

    Announce { keys, args }
}
