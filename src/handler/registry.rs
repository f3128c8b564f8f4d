//! Channel registry for dispatching inbound requests by channel name.
//!
//! Channels are registered before the node announces itself and do not
//! change afterwards. Registration order is kept so the announce payload is
//! deterministic.
//!
//! # Example
//!
//! ```
//! use origami_client::control::ChannelOptions;
//! use origami_client::handler::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register("echo", ChannelOptions::default(), |text: String, _ctx| async move {
//!     Ok(text)
//! });
//!
//! assert!(registry.get_handler("echo").is_some());
//! assert_eq!(registry.descriptors()[0].name, "echo");
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{HandlerError, RequestContext};
use crate::codec::JsonCodec;
use crate::control::{ChannelDescriptor, ChannelOptions};

/// Serialized (JSON) response, or the handler's failure.
pub type HandlerResult = std::result::Result<String, HandlerError>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for channel handlers.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request with its serialized parameters.
    fn call(&self, params: &str, ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that deserializes parameters and serializes the response.
pub struct TypedHandler<F, T, R, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Handler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    fn call(&self, params: &str, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match JsonCodec::decode(params) {
            Ok(v) => v,
            Err(e) => {
                let err = HandlerError::named("DecodeError", e.to_string());
                return Box::pin(async move { Err(err) });
            }
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            let response = fut.await?;
            JsonCodec::encode(&response)
                .map_err(|e| HandlerError::named("EncodeError", e.to_string()))
        })
    }
}

/// Entry for a registered channel.
struct ChannelEntry {
    name: String,
    options: ChannelOptions,
    handler: Arc<dyn Handler>,
}

/// Registry mapping channel names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    channels: Vec<ChannelEntry>,
    by_name: HashMap<String, usize>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel handler.
    ///
    /// Registering the same name again replaces the handler and options but
    /// keeps the original position.
    pub fn register<F, T, R, Fut>(&mut self, name: &str, options: ChannelOptions, handler: F)
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        self.register_handler(name, options, Arc::new(TypedHandler::new(handler)));
    }

    /// Register an already boxed handler.
    pub fn register_handler(
        &mut self,
        name: &str,
        options: ChannelOptions,
        handler: Arc<dyn Handler>,
    ) {
        let entry = ChannelEntry {
            name: name.to_string(),
            options,
            handler,
        };

        match self.by_name.get(name) {
            Some(&index) => self.channels[index] = entry,
            None => {
                self.by_name.insert(name.to_string(), self.channels.len());
                self.channels.push(entry);
            }
        }
    }

    /// Get a handler by channel name.
    pub fn get_handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.by_name
            .get(name)
            .map(|&index| self.channels[index].handler.clone())
    }

    /// Get the options a channel was registered with.
    pub fn get_options(&self, name: &str) -> Option<ChannelOptions> {
        self.by_name
            .get(name)
            .map(|&index| self.channels[index].options)
    }

    /// Registered channel names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Describe the registered channels for the announce command.
    pub fn descriptors(&self) -> Vec<ChannelDescriptor> {
        self.channels
            .iter()
            .map(|c| ChannelDescriptor::new(&c.name, c.options))
            .collect()
    }
}
