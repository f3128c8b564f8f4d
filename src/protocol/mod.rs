//! Protocol module - wire codec, reply buffering, and phase frames.
//!
//! This module implements everything that touches bytes on the wire:
//! - Command array encoding and incremental reply decoding
//! - Reply buffer for accumulating partial reads
//! - Channel naming and the fixed-width frames of each handshake phase

mod frames;
mod reply_buffer;
mod resp;

pub use frames::{
    submit_channel, AcceptDecisionFrame, IdFrame, Phase, ResultFrame, ResultStatus, SubmitFrame,
    CHANNEL_PREFIX, ID_LEN,
};
pub use reply_buffer::{ReplyBuffer, DEFAULT_MAX_BUFFERED};
pub use resp::{decode, encode_command, tags, Reply, CRLF, MAX_DEPTH};
