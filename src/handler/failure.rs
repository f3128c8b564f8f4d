//! Handler failures and the error record sent back to the producer.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured description of a failed request.
///
/// Serialized as `{name, message, stack, code, cause}`; absent fields are
/// `null` on the wire and `None` here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorRecord {
    pub name: Option<String>,
    pub message: Option<String>,
    pub stack: Option<String>,
    pub code: Option<Value>,
    pub cause: Option<Value>,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name.as_deref().unwrap_or("Error");
        match &self.message {
            Some(message) => write!(f, "{}: {}", name, message),
            None => f.write_str(name),
        }
    }
}

/// Error returned by a channel handler.
///
/// Any [`std::error::Error`] converts into it, so handlers can use `?`:
///
/// ```
/// use origami_client::handler::HandlerError;
///
/// fn parse(input: &str) -> Result<i64, HandlerError> {
///     Ok(input.parse::<i64>()?)
/// }
///
/// let err = parse("x").unwrap_err();
/// assert_eq!(err.record().name.as_deref(), Some("ParseIntError"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    record: ErrorRecord,
}

impl HandlerError {
    /// Generic error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    /// Error with an explicit name.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            record: ErrorRecord {
                name: Some(name.into()),
                message: Some(message.into()),
                ..ErrorRecord::default()
            },
        }
    }

    /// Attach an application error code.
    pub fn with_code(mut self, code: impl Into<Value>) -> Self {
        self.record.code = Some(code.into());
        self
    }

    /// Attach a cause.
    pub fn with_cause(mut self, cause: impl Into<Value>) -> Self {
        self.record.cause = Some(cause.into());
        self
    }

    /// Attach a stack or backtrace text.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.record.stack = Some(stack.into());
        self
    }

    pub fn record(&self) -> &ErrorRecord {
        &self.record
    }

    pub fn into_record(self) -> ErrorRecord {
        self.record
    }

    /// A handler task panicked.
    pub(crate) fn panic(message: String) -> Self {
        Self::named("Panic", message)
    }

    /// A handler task was cancelled before finishing.
    pub(crate) fn cancelled() -> Self {
        Self::named("Cancelled", "handler task was cancelled")
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.record.fmt(f)
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + 'static,
{
    fn from(error: E) -> Self {
        let mut handler_error = HandlerError::named(short_type_name::<E>(), error.to_string());
        if let Some(source) = error.source() {
            handler_error = handler_error.with_cause(source.to_string());
        }
        handler_error
    }
}

/// `core::num::error::ParseIntError` -> `ParseIntError`
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
