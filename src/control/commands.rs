//! Server-side atomic commands.
//!
//! Each [`Command`] is a script that is loaded once per connection epoch
//! (`SCRIPT LOAD`) to obtain an opaque handle, then invoked by handle
//! (`EVALSHA handle numkeys keys... args...`). Handles do not survive a
//! reconnect, so [`CommandStore::clear_handles`] runs whenever an epoch ends.
//!
//! # Example
//!
//! ```
//! use origami_client::control::{Command, CommandStore};
//!
//! let mut store = CommandStore::new();
//! store.register_source(Command::Heartbeat, "return 1");
//!
//! // No handle before the first load.
//! assert!(store.call(Command::Heartbeat, &["node"]).is_none());
//!
//! store.register_handle(Command::Heartbeat, "e0e1f9fabfc9d4800c877a703b823ac0578ff8db");
//! assert!(store.call(Command::Heartbeat, &["node"]).is_some());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use bytes::Bytes;

use crate::error::{OrigamiError, Result};
use crate::protocol::encode_command;

/// File prepended to every script loaded from a directory, when present.
pub const HEADER_FILE: &str = "header.lua";

/// Separator between the header and the script body.
const HEADER_SEPARATOR: &str = "\n\n\n";

/// The server-side commands this client invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Registers the node and its channels: `descriptors... | nodeId, ...`.
    Announce,
    /// `nodeId`
    Heartbeat,
    /// `nodeId`
    StopBroadcast,
    /// `nodeId, requestId, channel, params, group, noResponse, timeout, tryAfter, weight`
    SubmitRequest,
    /// `nodeId, requestId`
    AcceptAck,
    /// `nodeId, requestId, errored, payload`
    Respond,
    /// `nodeId, requestId`
    ResultAck,
}

impl Command {
    /// Every command, in load order.
    pub const ALL: [Command; 7] = [
        Command::Announce,
        Command::Heartbeat,
        Command::StopBroadcast,
        Command::SubmitRequest,
        Command::AcceptAck,
        Command::Respond,
        Command::ResultAck,
    ];

    /// Script file name for this command.
    pub const fn file_name(self) -> &'static str {
        match self {
            Command::Announce => "init.lua",
            Command::Heartbeat => "ping.lua",
            Command::StopBroadcast => "stop.lua",
            Command::SubmitRequest => "request.lua",
            Command::AcceptAck => "request_ack.lua",
            Command::Respond => "response.lua",
            Command::ResultAck => "response_ack.lua",
        }
    }

    /// Whether this command is loaded and sent on the heartbeat link
    /// instead of the publisher link.
    pub const fn uses_heartbeat_link(self) -> bool {
        matches!(self, Command::Heartbeat)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Announce => "announce",
            Command::Heartbeat => "heartbeat",
            Command::StopBroadcast => "stop-broadcast",
            Command::SubmitRequest => "submit-request",
            Command::AcceptAck => "request-accept-ack",
            Command::Respond => "respond",
            Command::ResultAck => "result-ack",
        };
        f.write_str(name)
    }
}

/// Script sources and the handles loaded for the current epoch.
///
/// Sources are fixed once the client is built; handles are replaced on
/// every epoch.
#[derive(Default)]
pub struct CommandStore {
    sources: HashMap<Command, String>,
    handles: RwLock<HashMap<Command, String>>,
}

impl CommandStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the script source for a command, replacing any previous one.
    pub fn register_source(&mut self, command: Command, source: impl Into<String>) {
        self.sources.insert(command, source.into());
    }

    /// Fill in every command without a source from `dir`.
    ///
    /// `dir/header.lua`, when present, is prepended to each loaded file.
    /// Missing files are skipped; [`CommandStore::ensure_sources`] reports them.
    ///
    /// # Errors
    ///
    /// Returns an I/O error for any failure other than a missing file.
    pub fn load_missing_from_dir(&mut self, dir: &Path) -> Result<()> {
        let header = read_optional(&dir.join(HEADER_FILE))?;

        for command in Command::ALL {
            if self.sources.contains_key(&command) {
                continue;
            }

            let path = dir.join(command.file_name());
            if let Some(body) = read_optional(&path)? {
                let source = match &header {
                    Some(header) => [header.as_str(), body.as_str()].join(HEADER_SEPARATOR),
                    None => body,
                };
                tracing::debug!("loaded {} from {}", command, path.display());
                self.sources.insert(command, source);
            }
        }

        Ok(())
    }

    /// Check that every command has a source.
    ///
    /// # Errors
    ///
    /// Returns [`OrigamiError::CommandMissing`] for the first command without one.
    pub fn ensure_sources(&self) -> Result<()> {
        match Command::ALL.into_iter().find(|c| !self.sources.contains_key(c)) {
            Some(command) => Err(OrigamiError::CommandMissing(command)),
            None => Ok(()),
        }
    }

    /// Source for a command.
    pub fn source(&self, command: Command) -> Option<&str> {
        self.sources.get(&command).map(String::as_str)
    }

    /// `SCRIPT LOAD` for a command's source.
    pub fn load_command(&self, command: Command) -> Option<Bytes> {
        self.source(command)
            .map(|source| encode_command(&["SCRIPT", "LOAD", source]))
    }

    /// Record the handle returned by the server for this epoch.
    pub fn register_handle(&self, command: Command, handle: impl Into<String>) {
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command, handle.into());
    }

    /// Handle loaded for this epoch.
    pub fn handle(&self, command: Command) -> Option<String> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&command)
            .cloned()
    }

    /// Forget all handles (end of epoch).
    pub fn clear_handles(&self) {
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Build `EVALSHA handle numkeys keys... args...`.
    ///
    /// Returns `None` if the command has no handle in this epoch.
    pub fn invoke<K, A>(&self, command: Command, keys: &[K], args: &[A]) -> Option<Bytes>
    where
        K: AsRef<str>,
        A: AsRef<str>,
    {
        let handle = self.handle(command)?;
        let numkeys = keys.len().to_string();

        let mut parts: Vec<&str> = Vec::with_capacity(3 + keys.len() + args.len());
        parts.push("EVALSHA");
        parts.push(&handle);
        parts.push(&numkeys);
        parts.extend(keys.iter().map(AsRef::as_ref));
        parts.extend(args.iter().map(AsRef::as_ref));

        Some(encode_command(&parts))
    }

    /// [`CommandStore::invoke`] with no keys.
    pub fn call<A: AsRef<str>>(&self, command: Command, args: &[A]) -> Option<Bytes> {
        self.invoke::<&str, A>(command, &[], args)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
