//! Request context for handlers.
//!
//! Identifies the request being processed. The handler's return value is
//! the response, so the context carries no sending methods.
//!
//! # Example
//!
//! ```ignore
//! async fn resize(params: Resize, ctx: RequestContext) -> Result<Image, HandlerError> {
//!     tracing::info!("resizing for {} ({})", ctx.sender_id(), ctx.request_id());
//!     do_resize(params).await
//! }
//! ```

/// Context passed to channel handlers.
///
/// `RequestContext` is `Clone` and can be moved into spawned tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    request_id: String,
    sender_id: String,
    channel: String,
}

impl RequestContext {
    pub fn new(request_id: &str, sender_id: &str, channel: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            sender_id: sender_id.to_string(),
            channel: channel.to_string(),
        }
    }

    /// Identifier of this request, shared by every phase of its handshake.
    #[inline]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Node id of the producer that issued the request.
    #[inline]
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Logical channel the request was addressed to.
    #[inline]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_accessors() {
        let ctx = RequestContext::new("req", "sender", "resize");

        assert_eq!(ctx.request_id(), "req");
        assert_eq!(ctx.sender_id(), "sender");
        assert_eq!(ctx.channel(), "resize");
        assert_eq!(ctx.clone(), ctx);
    }
}
