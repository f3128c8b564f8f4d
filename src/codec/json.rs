//! JSON codec using `serde_json`.
//!
//! Request parameters, handler results, and error records all travel as JSON
//! text inside the fixed-width frames, so every node in the pool can read them
//! regardless of the language it is written in.
//!
//! An absent value (`None`, `()`) serializes as the literal `null`.
//!
//! # Example
//!
//! ```
//! use origami_client::codec::JsonCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Resize {
//!     width: u32,
//!     height: u32,
//! }
//!
//! let msg = Resize { width: 640, height: 480 };
//! let encoded = JsonCodec::encode(&msg).unwrap();
//! let decoded: Resize = JsonCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use crate::error::Result;

/// JSON codec for structured payloads.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON text.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized (e.g. a map with
    /// non-string keys).
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    /// Decode JSON text to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the text is not valid JSON for type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
        Ok(serde_json::from_str(text)?)
    }
}
