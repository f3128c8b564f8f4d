//! Handler module - channel handlers and their failures.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps channel names to handlers
//! - [`RequestContext`] - identifies the request being handled
//! - [`HandlerError`] / [`ErrorRecord`] - how a failed request is reported
//!
//! # Example
//!
//! ```
//! use origami_client::control::ChannelOptions;
//! use origami_client::handler::{HandlerError, HandlerRegistry};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register("sqrt", ChannelOptions::default(), |n: f64, _ctx| async move {
//!     if n < 0.0 {
//!         return Err(HandlerError::named("RangeError", "negative input"));
//!     }
//!     Ok(n.sqrt())
//! });
//! ```

mod context;
mod failure;
mod registry;

pub use context::RequestContext;
pub use failure::{ErrorRecord, HandlerError};
pub use registry::{BoxFuture, Handler, HandlerRegistry, HandlerResult, TypedHandler};
