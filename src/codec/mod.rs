//! Codec module - serialization of frame payloads.
//!
//! - [`JsonCodec`] - JSON using `serde_json`, the payload format shared by
//!   every client in the pool
//!
//! # Design
//!
//! Codecs are implemented as marker structs with static methods rather than
//! trait objects, so the payload format is fixed at compile time.

mod json;

pub use json::JsonCodec;
