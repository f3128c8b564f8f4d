//! One streaming TCP link to the server.
//!
//! A [`Connection`] owns a single socket and moves through
//! `Created → Connecting → Connected → Closing → Closed`. `connect()` and
//! `close()` are serialized through an async mutex, so overlapping calls run
//! one after the other instead of interleaving.
//!
//! Two ways of talking to the server are supported:
//!
//! - **request mode**: [`Connection::request`] writes a command and queues a
//!   resolver that is matched to the next decoded reply (FIFO).
//! - **send-only mode**: [`Connection::send`] writes with no correlation and
//!   inbound bytes are discarded without being parsed.
//!
//! Decoded replies are also handed to an optional message handler, which is
//! how subscription pushes reach the core.
//!
//! ```text
//! socket read half ─► ReplyBuffer ─┬─► message handler (pushes)
//!                                  └─► oldest pending request
//! callers ─► WriterHandle ─► writer task ─► socket write half
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};

use crate::error::{OrigamiError, Result};
use crate::protocol::{Reply, ReplyBuffer};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default bound on a connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time `close()` waits for the socket to wind down.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Size of the socket read buffer.
const READ_CHUNK: usize = 64 * 1024;

/// Outbound half of a link, as seen by the producer, consumer and core.
///
/// Implemented by [`Connection`]; tests substitute a recording link.
pub trait Link: Send + Sync {
    /// Fire-and-forget write of an encoded command.
    fn send(&self, command: Bytes) -> Result<()>;
}

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    Created,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Settings for a single link.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Bound on establishing the socket.
    pub connect_timeout: Duration,
    /// How long `close()` waits before tearing the socket down forcibly.
    pub close_grace: Duration,
    /// Writer task tuning.
    pub writer: WriterConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
            writer: WriterConfig::default(),
        }
    }
}

/// Receives every decoded reply while the link is not send-only.
pub type MessageHandler = Arc<dyn Fn(&Reply) + Send + Sync>;
/// Receives transport errors.
pub type ErrorHandler = Arc<dyn Fn(&OrigamiError) + Send + Sync>;
/// Called whenever the link ends up closed.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

type Resolver = oneshot::Sender<Result<Reply>>;

#[derive(Default)]
struct Handlers {
    message: Option<MessageHandler>,
    error: Option<ErrorHandler>,
    close: Option<CloseHandler>,
}

struct Shared {
    status: ConnectionState,
    /// Incremented on every connect attempt; stale tasks compare against it.
    epoch: u64,
    writer: Option<WriterHandle>,
    pending: VecDeque<Resolver>,
    shutdown: Option<oneshot::Sender<()>>,
    io_task: Option<JoinHandle<()>>,
}

struct Inner {
    name: String,
    config: ConnectionConfig,
    shared: Mutex<Shared>,
    ops: tokio::sync::Mutex<()>,
    send_only: AtomicBool,
    handlers: Mutex<Handlers>,
}

/// A cloneable handle to one link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a link in the `Created` state. `name` only appears in logs.
    pub fn new(name: &str, config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                config,
                shared: Mutex::new(Shared {
                    status: ConnectionState::Created,
                    epoch: 0,
                    writer: None,
                    pending: VecDeque::new(),
                    shutdown: None,
                    io_task: None,
                }),
                ops: tokio::sync::Mutex::new(()),
                send_only: AtomicBool::new(false),
                handlers: Mutex::new(Handlers::default()),
            }),
        }
    }

    /// Link name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared().status
    }

    /// Whether inbound bytes are currently being discarded.
    pub fn is_send_only(&self) -> bool {
        self.inner.send_only.load(Ordering::Acquire)
    }

    /// Toggle send-only mode. Setting the current value again is a no-op.
    ///
    /// Entering send-only mode fails every in-flight request with
    /// [`OrigamiError::ConnectionLost`], since their replies will be discarded.
    pub fn set_send_only(&self, send_only: bool) {
        let previous = self.inner.send_only.swap(send_only, Ordering::AcqRel);
        if previous == send_only {
            return;
        }

        tracing::debug!(link = %self.inner.name, send_only, "send-only mode changed");
        if send_only {
            let pending = std::mem::take(&mut self.inner.shared().pending);
            fail_pending(pending);
        }
    }

    /// Install or remove the message handler.
    pub fn on_message(&self, handler: Option<MessageHandler>) {
        self.inner.handlers().message = handler;
    }

    /// Install the error handler, replacing any previous one.
    pub fn on_error(&self, handler: ErrorHandler) {
        self.inner.handlers().error = Some(handler);
    }

    /// Install the close handler, replacing any previous one.
    pub fn on_close(&self, handler: CloseHandler) {
        self.inner.handlers().close = Some(handler);
    }

    /// Open the socket.
    ///
    /// Connecting an already connected link is a no-op.
    ///
    /// # Errors
    ///
    /// - [`OrigamiError::ConnectFailed`] if the transport reports an error
    /// - [`OrigamiError::ConnectionClosed`] if the peer aborts the attempt or
    ///   it does not complete within the connect timeout
    pub async fn connect(&self) -> Result<()> {
        let _op = self.inner.ops.lock().await;

        let epoch = {
            let mut shared = self.inner.shared();
            if shared.status == ConnectionState::Connected {
                return Ok(());
            }
            shared.epoch += 1;
            shared.status = ConnectionState::Connecting;
            shared.epoch
        };

        let config = &self.inner.config;
        let attempt = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await;

        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.inner.mark_closed(epoch);
                let err = match e.kind() {
                    std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::UnexpectedEof => {
                        OrigamiError::ConnectionClosed
                    }
                    _ => OrigamiError::ConnectFailed(e),
                };
                if matches!(err, OrigamiError::ConnectFailed(_)) {
                    self.inner.emit_error(&err);
                }
                self.inner.emit_close();
                return Err(err);
            }
            Err(_) => {
                tracing::warn!(
                    link = %self.inner.name,
                    "connect to {}:{} timed out after {:?}",
                    config.host,
                    config.port,
                    config.connect_timeout
                );
                self.inner.mark_closed(epoch);
                self.inner.emit_close();
                return Err(OrigamiError::ConnectionClosed);
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(link = %self.inner.name, "set_nodelay failed: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        {
            let mut shared = self.inner.shared();
            shared.status = ConnectionState::Connected;
            shared.writer = Some(writer);
            shared.shutdown = Some(shutdown_tx);

            let inner = self.inner.clone();
            shared.io_task = Some(tokio::spawn(async move {
                inner.run_io(epoch, read_half, writer_task, shutdown_rx).await;
            }));
        }

        tracing::info!(link = %self.inner.name, "connected to {}:{}", config.host, config.port);
        Ok(())
    }

    /// Shut the link down.
    ///
    /// Resolves once the socket has wound down or the close grace period has
    /// elapsed, whichever comes first. Outstanding requests fail with
    /// [`OrigamiError::ConnectionLost`].
    pub async fn close(&self) -> Result<()> {
        let _op = self.inner.ops.lock().await;

        let (epoch, shutdown, io_task) = {
            let mut shared = self.inner.shared();
            match shared.status {
                ConnectionState::Created | ConnectionState::Closed => return Ok(()),
                _ => {}
            }
            shared.status = ConnectionState::Closing;
            if let Some(writer) = shared.writer.take() {
                tracing::debug!(
                    link = %self.inner.name,
                    queued = writer.pending_count(),
                    "closing"
                );
            }
            (shared.epoch, shared.shutdown.take(), shared.io_task.take())
        };

        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }

        if let Some(mut task) = io_task {
            if tokio::time::timeout(self.inner.config.close_grace, &mut task)
                .await
                .is_err()
            {
                tracing::debug!(link = %self.inner.name, "close grace elapsed, aborting socket");
                task.abort();
            }
        }

        self.inner.finish(epoch);
        Ok(())
    }

    /// Write a command and wait for its reply.
    ///
    /// Error replies from the server are returned as `Ok(Reply::Error(_))`.
    ///
    /// # Errors
    ///
    /// - [`OrigamiError::SendOnlyEnabled`] in send-only mode
    /// - [`OrigamiError::ConnectionLost`] if the link is not connected, or
    ///   breaks before the reply arrives
    pub async fn request(&self, command: Bytes) -> Result<Reply> {
        if self.is_send_only() {
            return Err(OrigamiError::SendOnlyEnabled);
        }

        let rx = {
            let mut shared = self.inner.shared();
            let writer = match (&shared.status, &shared.writer) {
                (ConnectionState::Connected, Some(writer)) => writer.clone(),
                _ => return Err(OrigamiError::ConnectionLost),
            };

            let (tx, rx) = oneshot::channel();
            shared.pending.push_back(tx);
            if let Err(e) = writer.try_send(command) {
                shared.pending.pop_back();
                return Err(e);
            }
            rx
        };

        rx.await.unwrap_or(Err(OrigamiError::ConnectionLost))
    }

    /// Write a command without waiting for anything.
    ///
    /// # Errors
    ///
    /// - [`OrigamiError::SendOnlyDisabled`] unless in send-only mode
    /// - [`OrigamiError::ConnectionLost`] if the link is not connected
    /// - [`OrigamiError::Backpressure`] if the writer queue is full
    pub fn send(&self, command: Bytes) -> Result<()> {
        if !self.is_send_only() {
            return Err(OrigamiError::SendOnlyDisabled);
        }

        let writer = {
            let shared = self.inner.shared();
            match shared.status {
                ConnectionState::Connected => shared.writer.clone(),
                _ => None,
            }
        };

        match writer {
            Some(writer) => writer.try_send(command),
            None => Err(OrigamiError::ConnectionLost),
        }
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.shared().pending.len()
    }
}

impl Link for Connection {
    fn send(&self, command: Bytes) -> Result<()> {
        Connection::send(self, command)
    }
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_error(&self, error: &OrigamiError) {
        let handler = self.handlers().error.clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    fn emit_close(&self) {
        let handler = self.handlers().close.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn mark_closed(&self, epoch: u64) {
        let mut shared = self.shared();
        if shared.epoch == epoch {
            shared.status = ConnectionState::Closed;
        }
    }

    /// Retire the given epoch: fail all pending requests and report the close.
    fn finish(&self, epoch: u64) {
        let pending = {
            let mut shared = self.shared();
            if shared.epoch != epoch || shared.status == ConnectionState::Closed {
                return;
            }
            shared.status = ConnectionState::Closed;
            shared.writer = None;
            shared.shutdown = None;
            std::mem::take(&mut shared.pending)
        };

        fail_pending(pending);
        tracing::debug!(link = %self.name, "closed");
        self.emit_close();
    }

    async fn run_io(
        self: Arc<Self>,
        epoch: u64,
        reader: OwnedReadHalf,
        mut writer_task: JoinHandle<Result<()>>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let outcome = tokio::select! {
            r = self.read_loop(reader) => r,
            r = &mut writer_task => writer_outcome(r),
            _ = &mut shutdown => writer_outcome(writer_task.await),
        };

        if let Err(e) = outcome {
            let closing = self.shared().status == ConnectionState::Closing;
            if !closing {
                tracing::warn!(link = %self.name, "link failed: {}", e);
                self.emit_error(&e);
            }
        }

        self.finish(epoch);
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf) -> Result<()> {
        let mut replies = ReplyBuffer::new();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }

            if self.send_only.load(Ordering::Acquire) {
                replies.clear();
                continue;
            }

            for reply in replies.push(&buf[..n])? {
                self.dispatch(reply);
            }
        }
    }

    fn dispatch(&self, reply: Reply) {
        let handler = self.handlers().message.clone();

        if let Some(handler) = &handler {
            handler(&reply);
            if is_push(&reply) {
                return;
            }
        }

        let resolver = self.shared().pending.pop_front();
        if let Some(resolver) = resolver {
            let _ = resolver.send(Ok(reply));
        }
    }
}

fn fail_pending(pending: VecDeque<Resolver>) {
    for resolver in pending {
        let _ = resolver.send(Err(OrigamiError::ConnectionLost));
    }
}

fn writer_outcome(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(_) => Err(OrigamiError::ConnectionLost),
    }
}

/// Whether a reply is an unsolicited subscription push rather than a
/// command reply.
fn is_push(reply: &Reply) -> bool {
    matches!(
        reply.as_array().and_then(|items| items.first()).and_then(Reply::as_str),
        Some("message") | Some("pmessage")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_command;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpSocket};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn close_counter(conn: &Connection) -> Arc<AtomicUsize> {
        let closes = Arc::new(AtomicUsize::new(0));
        let c = closes.clone();
        conn.on_close(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        closes
    }

    fn config_for(listener: &TcpListener) -> ConnectionConfig {
        ConnectionConfig {
            port: listener.local_addr().unwrap().port(),
            close_grace: Duration::from_millis(200),
            ..ConnectionConfig::default()
        }
    }

    /// Replies to every command with a bulk string of its last argument.
    async fn echo_server(listener: TcpListener) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut commands = ReplyBuffer::new();
        let mut buf = vec![0u8; 4096];

        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for command in commands.push(&buf[..n]).unwrap() {
                let args = command.as_array().unwrap();
                let last = args.last().and_then(Reply::as_bytes).unwrap_or_default();
                let reply = format!("${}\r\n{}\r\n", last.len(), String::from_utf8_lossy(last));
                socket.write_all(reply.as_bytes()).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_request_reply_fifo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new("test", config_for(&listener));
        tokio::spawn(echo_server(listener));

        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        let (first, second) = tokio::join!(
            conn.request(encode_command(&["ECHO", "one"])),
            conn.request(encode_command(&["ECHO", "two"])),
        );

        assert_eq!(first.unwrap().as_str(), Some("one"));
        assert_eq!(second.unwrap().as_str(), Some("two"));
        assert_eq!(conn.pending_requests(), 0);

        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = config_for(&listener);
        drop(listener);

        let errors = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let conn = Connection::new("test", config);
        let e = errors.clone();
        conn.on_error(Arc::new(move |_: &OrigamiError| {
            e.fetch_add(1, Ordering::SeqCst);
        }));
        let c = closes.clone();
        conn.on_close(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let result = conn.connect().await;

        assert!(matches!(result, Err(OrigamiError::ConnectFailed(_))));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_without_socket() {
        let conn = Connection::new("test", ConnectionConfig::default());

        let result = conn.request(encode_command(&["PING"])).await;
        assert!(matches!(result, Err(OrigamiError::ConnectionLost)));
    }

    #[tokio::test]
    async fn test_send_only_guards() {
        let conn = Connection::new("test", ConnectionConfig::default());

        let result = conn.send(encode_command(&["PING"]));
        assert!(matches!(result, Err(OrigamiError::SendOnlyDisabled)));

        conn.set_send_only(true);
        conn.set_send_only(true);
        assert!(conn.is_send_only());

        let result = conn.request(encode_command(&["PING"])).await;
        assert!(matches!(result, Err(OrigamiError::SendOnlyEnabled)));
    }

    #[tokio::test]
    async fn test_peer_close_drains_all_pending() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new("test", config_for(&listener));

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            // Read at least one command, then hang up without replying.
            let _ = socket.read(&mut buf).await;
        });

        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        conn.on_close(Arc::new(move || {
            let _ = closed_tx.send(());
        }));

        conn.connect().await.unwrap();

        let (first, second) = tokio::join!(
            conn.request(encode_command(&["GET", "a"])),
            conn.request(encode_command(&["GET", "b"])),
        );

        assert!(matches!(first, Err(OrigamiError::ConnectionLost)));
        assert!(matches!(second, Err(OrigamiError::ConnectionLost)));

        closed_rx.recv().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_message_handler_receives_pushes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new("test", config_for(&listener));

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let push = encode_command(&["message", "origami.a1", "x"]);
            socket.write_all(&push).await.unwrap();
            let mut buf = vec![0u8; 64];
            let _ = socket.read(&mut buf).await;
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.on_message(Some(Arc::new(move |reply: &Reply| {
            let _ = tx.send(reply.clone());
        })));

        conn.connect().await.unwrap();

        let reply = rx.recv().await.unwrap();
        let items = reply.as_array().unwrap();
        assert_eq!(items[1].as_str(), Some("origami.a1"));
        assert_eq!(items[2].as_str(), Some("x"));

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_only_writes_and_ignores_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new("test", config_for(&listener));

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut commands = ReplyBuffer::new();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                for command in commands.push(&buf[..n]).unwrap() {
                    socket.write_all(b"+OK\r\n").await.unwrap();
                    let _ = seen_tx.send(command);
                }
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<Reply>();
        conn.on_message(Some(Arc::new(move |reply: &Reply| {
            let _ = tx.send(reply.clone());
        })));

        conn.connect().await.unwrap();
        conn.set_send_only(true);
        conn.send(encode_command(&["PUBLISH", "ch", "hi"])).unwrap();

        let command = seen_rx.recv().await.unwrap();
        assert_eq!(command.as_array().unwrap()[2].as_str(), Some("hi"));

        conn.close().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new("test", config_for(&listener));
        tokio::spawn(echo_server(listener));

        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Created);

        conn.connect().await.unwrap();
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_only_switch_fails_pending_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new("test", config_for(&listener));

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            // Swallow commands and never answer.
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    return;
                }
            }
        });

        conn.connect().await.unwrap();

        let waiting = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(encode_command(&["GET", "a"])).await }
        });
        while conn.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }

        conn.set_send_only(true);

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(OrigamiError::ConnectionLost)));
        assert_eq!(conn.pending_requests(), 0);
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_closes_link() {
        // A zero backlog listener that is never accepted from: once its queue
        // holds a connection, further SYNs are dropped and connect hangs.
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(0).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut fillers = Vec::new();
        for _ in 0..8 {
            match tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => fillers.push(stream),
                _ => break,
            }
        }

        let conn = Connection::new(
            "test",
            ConnectionConfig {
                port: addr.port(),
                connect_timeout: Duration::from_secs(1),
                ..ConnectionConfig::default()
            },
        );
        let closes = close_counter(&conn);

        let start = Instant::now();
        let result = conn.connect().await;

        assert!(matches!(result, Err(OrigamiError::ConnectionClosed)));
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        drop(fillers);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_aborts_after_grace_when_peer_stalls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new("test", config_for(&listener));
        let closes = close_counter(&conn);

        let (held_tx, held_rx) = oneshot::channel();
        tokio::spawn(async move {
            // Keep the socket open without reading or sending FIN.
            let (socket, _) = listener.accept().await.unwrap();
            let _ = held_rx.await;
            drop(socket);
        });

        conn.connect().await.unwrap();

        // Far more than the socket buffers hold, so the writer never finishes.
        conn.set_send_only(true);
        let payload = vec![b'x'; 64 * 1024 * 1024];
        conn.send(encode_command(&[&b"PUBLISH"[..], &b"ch"[..], &payload[..]])).unwrap();
        tokio::task::yield_now().await;

        let start = Instant::now();
        conn.close().await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        conn.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        let _ = held_tx.send(());
    }
}
