//! Transport module - TCP links to the server.
//!
//! Each client keeps three independent [`Connection`]s (heartbeat,
//! listener, publisher). Producer, consumer and core only see the
//! [`Link`] trait.

mod connection;

pub use connection::{
    CloseHandler, Connection, ConnectionConfig, ConnectionState, ErrorHandler, Link,
    MessageHandler, DEFAULT_CLOSE_GRACE, DEFAULT_CONNECT_TIMEOUT,
};
