//! Control module - the server-side command set.
//!
//! The server runs a fixed set of atomic scripts on behalf of the client.
//! This module knows their names, where their sources come from, how they
//! are loaded per connection epoch and how they are invoked.
//!
//! # Workflow
//!
//! 1. Sources are registered in code or read from a scripts directory
//! 2. Every epoch, each source is loaded (`SCRIPT LOAD`) and its handle kept
//! 3. The node announces its channels once, on the first epoch
//! 4. Producer, consumer and core invoke commands by handle (`EVALSHA`)

mod announce;
mod commands;

pub use announce::{
    build_announce, Announce, ChannelDescriptor, ChannelOptions, NodeInfo, Reservoir,
    ReservoirMode, CLIENT_NAME, CLIENT_VERSION,
};
pub use commands::{Command, CommandStore, HEADER_FILE};
