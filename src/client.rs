//! Client builder and connection supervisor.
//!
//! The [`ClientBuilder`] collects configuration, channel handlers and command
//! sources. The [`Client`] runs the lifecycle of one node:
//! 1. Connect (and authenticate) the heartbeat, listener and publisher links
//! 2. Load every command script and keep the handles for this epoch
//! 3. Subscribe to the node's channels and route pushes to the core
//! 4. Announce the node (first epoch only)
//! 5. Switch heartbeat and publisher to send-only and start the core
//!
//! A failed step, a link closing or a stall reported by the core tears the
//! epoch down and, after `reconnect_timeout`, runs the sequence again.
//!
//! # Example
//!
//! ```ignore
//! use origami_client::{Client, ChannelOptions, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .host("127.0.0.1")
//!         .channel("upper", ChannelOptions::default(), |text: String, _ctx| async move {
//!             Ok(text.to_uppercase())
//!         })
//!         .on_error(|e| eprintln!("link error: {}", e))
//!         .start()
//!         .await?;
//!
//!     let reply = client.request("upper", &"hello", RequestOptions::default())?.await;
//!     println!("{:?}", reply);
//!
//!     client.stop().await
//! }
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, Windows};
use crate::control::{build_announce, ChannelOptions, Command, CommandStore, NodeInfo};
use crate::core::{Core, CoreLinks};
use crate::error::{OrigamiError, Result};
use crate::handler::{HandlerError, HandlerRegistry, RequestContext};
use crate::producer::{PendingResponse, RequestOptions};
use crate::protocol::{encode_command, Reply};
use crate::transport::Connection;

/// Lifecycle callback without arguments.
pub type LifecycleHook = Arc<dyn Fn() + Send + Sync>;
/// Receives link and setup errors.
pub type ErrorHook = Arc<dyn Fn(&OrigamiError) + Send + Sync>;

/// Lifecycle state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// First connection attempt in progress.
    Connecting,
    Connected,
    /// Rebuilding the links after a failure.
    Reconnecting,
    /// `stop()` is draining in-flight work.
    Closing,
    Closed,
}

#[derive(Default, Clone)]
struct Hooks {
    on_connect: Option<LifecycleHook>,
    on_reconnect: Option<LifecycleHook>,
    on_close: Option<LifecycleHook>,
    on_error: Option<ErrorHook>,
}

/// Builder for configuring and creating a client.
pub struct ClientBuilder {
    config: ClientConfig,
    registry: HandlerRegistry,
    commands: CommandStore,
    hooks: Hooks,
}

impl ClientBuilder {
    /// Create a new client builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            registry: HandlerRegistry::new(),
            commands: CommandStore::new(),
            hooks: Hooks::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    /// Authenticate every link with this password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.config.node_name = Some(name.into());
        self
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = Some(name.into());
        self
    }

    pub fn app_version(mut self, version: impl Into<String>) -> Self {
        self.config.app_version = Some(version.into());
        self
    }

    /// Default: 5 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Default: 1 second
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.config.close_grace = grace;
        self
    }

    /// Bound on script load, subscribe and announce.
    ///
    /// Default: 2 seconds
    pub fn setup_timeout(mut self, timeout: Duration) -> Self {
        self.config.setup_timeout = timeout;
        self
    }

    /// Default: 10 seconds
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.config.auth_timeout = timeout;
        self
    }

    /// Pause before rebuilding the links after a failure.
    ///
    /// Default: 2 seconds
    pub fn reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.config.reconnect_timeout = timeout;
        self
    }

    /// Default: 1 second
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// Default: 2 seconds
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Windows of the heartbeat and stop handshakes.
    ///
    /// Default: 2s / 7s
    pub fn heartbeat_windows(mut self, windows: Windows) -> Self {
        self.config.heartbeat = windows;
        self
    }

    /// Windows of producer and consumer requests.
    ///
    /// Default: 2s / 10s
    pub fn request_windows(mut self, windows: Windows) -> Self {
        self.config.requests = windows;
        self
    }

    /// Directory scripts not registered in code are read from.
    pub fn scripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scripts_dir = dir.into();
        self
    }

    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.max_pending_frames = limit;
        self
    }

    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Register a handler for a logical channel.
    ///
    /// The options are announced to the server, which enforces them.
    pub fn channel<F, T, R, Fut>(mut self, name: &str, options: ChannelOptions, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    {
        self.registry.register(name, options, handler);
        self
    }

    /// Provide a command's script source instead of reading it from disk.
    pub fn command_source(mut self, command: Command, source: impl Into<String>) -> Self {
        self.commands.register_source(command, source);
        self
    }

    /// Called after the links connect for the first time.
    pub fn on_connect<F: Fn() + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.hooks.on_connect = Some(Arc::new(hook));
        self
    }

    /// Called after the links connect again following a failure.
    pub fn on_reconnect<F: Fn() + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.hooks.on_reconnect = Some(Arc::new(hook));
        self
    }

    /// Called when a connected epoch ends.
    pub fn on_close<F: Fn() + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.hooks.on_close = Some(Arc::new(hook));
        self
    }

    /// Called for link and setup errors. Repeats of the same message are
    /// reported once.
    pub fn on_error<F: Fn(&OrigamiError) + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    /// Build the client without connecting.
    ///
    /// # Errors
    ///
    /// - [`OrigamiError::CommandMissing`] if a command has no source in code
    ///   or in the scripts directory
    /// - [`OrigamiError::Io`] if the scripts directory cannot be read
    pub fn build(mut self) -> Result<Client> {
        self.commands.load_missing_from_dir(&self.config.scripts_dir)?;
        self.commands.ensure_sources()?;
        Ok(Client::new(self.config, self.registry, self.commands, self.hooks))
    }

    /// Build the client and wait for its first epoch to come up.
    pub async fn start(self) -> Result<Client> {
        let client = self.build()?;
        client.start().await?;
        Ok(client)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

enum Event {
    /// A link closed while connected.
    LinkClosed,
    /// The core detected a stall.
    Restart,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    stopped: bool,
    announced: bool,
    connected_once: bool,
    supervisor: Option<JoinHandle<()>>,
    events: Option<mpsc::UnboundedReceiver<Event>>,
}

struct Links {
    heartbeat: Connection,
    listener: Connection,
    publisher: Connection,
}

impl Links {
    fn all(&self) -> [&Connection; 3] {
        [&self.heartbeat, &self.listener, &self.publisher]
    }
}

/// Reports errors, swallowing immediate repeats of the same message.
struct ErrorReporter {
    last: Mutex<Option<String>>,
    hook: Option<ErrorHook>,
}

impl ErrorReporter {
    fn report(&self, error: &OrigamiError) {
        let message = error.to_string();
        {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if last.as_deref() == Some(message.as_str()) {
                return;
            }
            *last = Some(message);
        }

        tracing::error!("{}", error);
        if let Some(hook) = &self.hook {
            hook(error);
        }
    }

    fn reset(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

struct ClientInner {
    config: ClientConfig,
    node: NodeInfo,
    links: Links,
    commands: Arc<CommandStore>,
    core: Arc<Core>,
    hooks: Hooks,
    errors: Arc<ErrorReporter>,
    state: Arc<Mutex<ClientState>>,
    lifecycle: Mutex<Lifecycle>,
    abandon: Notify,
}

/// A node in the pool.
///
/// Cheap to clone; clones share the same links and request tables.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn new(
        config: ClientConfig,
        registry: HandlerRegistry,
        commands: CommandStore,
        hooks: Hooks,
    ) -> Self {
        let node_id = uuid::Uuid::new_v4().to_string();
        let node = NodeInfo::new(&node_id).with_labels(
            config.node_name.clone(),
            config.app_name.clone(),
            config.app_version.clone(),
        );

        let connection = config.connection_config();
        let links = Links {
            heartbeat: Connection::new("heartbeat", connection.clone()),
            listener: Connection::new("listener", connection.clone()),
            publisher: Connection::new("publisher", connection),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ClientState::Closed));
        let errors = Arc::new(ErrorReporter {
            last: Mutex::new(None),
            hook: hooks.on_error.clone(),
        });

        for link in links.all() {
            let errors = errors.clone();
            link.on_error(Arc::new(move |e: &OrigamiError| errors.report(e)));

            let state = state.clone();
            let events = events_tx.clone();
            link.on_close(Arc::new(move || {
                let current = *state.lock().unwrap_or_else(PoisonError::into_inner);
                if matches!(current, ClientState::Connected | ClientState::Closing) {
                    let _ = events.send(Event::LinkClosed);
                }
            }));
        }

        let commands = Arc::new(commands);
        let restart_events = events_tx;
        let core = Arc::new(Core::new(
            &node_id,
            config.core_settings(),
            CoreLinks {
                heartbeat: Arc::new(links.heartbeat.clone()),
                publisher: Arc::new(links.publisher.clone()),
            },
            commands.clone(),
            registry,
            Arc::new(move || {
                let _ = restart_events.send(Event::Restart);
            }),
        ));

        let lifecycle = Lifecycle {
            events: Some(events_rx),
            ..Lifecycle::default()
        };

        Self {
            inner: Arc::new(ClientInner {
                config,
                node,
                links,
                commands,
                core,
                hooks,
                errors,
                state,
                lifecycle: Mutex::new(lifecycle),
                abandon: Notify::new(),
            }),
        }
    }

    /// This node's id, embedded in every channel name.
    pub fn node_id(&self) -> &str {
        &self.inner.node.node_id
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    /// Requests issued or accepted by this node that have not finished.
    pub fn active_requests(&self) -> usize {
        self.inner.core.producer().active() + self.inner.core.consumer().active()
    }

    /// Issue a request to a logical channel.
    ///
    /// May be called before the client is connected; the request goes out
    /// once the first epoch is up.
    ///
    /// # Errors
    ///
    /// - [`OrigamiError::Stopped`] after [`Client::stop`]
    /// - [`OrigamiError::Json`] if `params` cannot be serialized
    pub fn request<P>(
        &self,
        channel: &str,
        params: &P,
        options: RequestOptions,
    ) -> Result<PendingResponse>
    where
        P: Serialize + ?Sized,
    {
        if self.inner.lifecycle().stopped {
            return Err(OrigamiError::Stopped);
        }
        self.inner.core.producer().request(channel, params, options)
    }

    /// Connect and wait for the first epoch to come up.
    ///
    /// Transient failures are retried every `reconnect_timeout`; this only
    /// returns early on a fatal setup error. Calling it again once started
    /// does nothing.
    ///
    /// # Errors
    ///
    /// - [`OrigamiError::Stopped`] if the client was stopped
    /// - [`OrigamiError::CommandMissing`] / [`OrigamiError::AnnounceRejected`]
    ///   on fatal setup failures
    pub async fn start(&self) -> Result<()> {
        let (first_tx, first_rx) = oneshot::channel();

        {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.stopped {
                return Err(OrigamiError::Stopped);
            }
            if lifecycle.started {
                return Ok(());
            }
            let Some(events) = lifecycle.events.take() else {
                return Ok(());
            };
            lifecycle.started = true;
            self.inner.set_state(ClientState::Connecting);

            let inner = self.inner.clone();
            lifecycle.supervisor = Some(tokio::spawn(supervise(inner, events, first_tx)));
        }

        first_rx.await.unwrap_or(Err(OrigamiError::Stopped))
    }

    /// Withdraw from service and disconnect.
    ///
    /// When connected: tell the server to stop routing work here, wait for
    /// accepted requests, then for issued requests, to finish. A stall during
    /// the drain abandons it. A stopped client cannot be started again.
    pub async fn stop(&self) -> Result<()> {
        let was_connected = {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.stopped {
                return Ok(());
            }
            lifecycle.stopped = true;
            let was_connected = self.inner.state() == ClientState::Connected;
            self.inner.set_state(ClientState::Closing);
            was_connected
        };

        if was_connected {
            let core = self.inner.core.clone();
            let drain = async move {
                core.stop_requests_accepting().await;
                core.consumer().stop().await;
                core.producer().stop().await;
            };

            tokio::select! {
                _ = drain => tracing::info!("drained, closing links"),
                _ = self.inner.abandon.notified() => {
                    tracing::warn!("links failed while stopping, abandoning drain");
                }
            }
        }

        let supervisor = self.inner.lifecycle().supervisor.take();
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }
        self.inner.core.stop();

        self.inner.commands.clear_handles();
        self.inner.close_links().await;
        self.inner.set_state(ClientState::Closed);
        Ok(())
    }
}

impl ClientInner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Run the setup sequence once. On success the client is `Connected`.
    async fn run_epoch(self: &Arc<Self>) -> Result<()> {
        self.links.heartbeat.set_send_only(false);
        self.links.publisher.set_send_only(false);

        for link in self.links.all() {
            link.connect().await?;
            self.authenticate(link).await?;
        }

        let hook = {
            let mut lifecycle = self.lifecycle();
            let first = !lifecycle.connected_once;
            lifecycle.connected_once = true;
            if first {
                self.hooks.on_connect.clone()
            } else {
                self.hooks.on_reconnect.clone()
            }
        };
        if let Some(hook) = hook {
            hook();
        }

        self.load_commands().await?;
        self.subscribe().await?;
        self.announce().await?;

        self.links.heartbeat.set_send_only(true);
        self.links.publisher.set_send_only(true);

        self.set_state(ClientState::Connected);
        self.errors.reset();
        self.core.start(Instant::now());

        tracing::info!(node_id = %self.node.node_id, "connected");
        Ok(())
    }

    async fn authenticate(&self, link: &Connection) -> Result<()> {
        let Some(password) = &self.config.password else {
            return Ok(());
        };

        let mut args = vec!["AUTH"];
        if let Some(username) = &self.config.username {
            args.push(username);
        }
        args.push(password);

        let reply = timed_request(link, encode_command(&args), self.config.auth_timeout).await?;
        if reply.as_str() == Some("OK") {
            return Ok(());
        }

        let reason = match &reply {
            Reply::Error(message) => message.clone(),
            other => format!("unexpected reply {:?}", other),
        };
        tracing::warn!(link = link.name(), "authentication failed: {}", reason);
        let err = OrigamiError::AuthFailed(reason);
        self.errors.report(&err);
        Err(err)
    }

    async fn load_commands(&self) -> Result<()> {
        for command in Command::ALL {
            let load = self
                .commands
                .load_command(command)
                .ok_or(OrigamiError::CommandMissing(command))?;

            let link = if command.uses_heartbeat_link() {
                &self.links.heartbeat
            } else {
                &self.links.publisher
            };

            let reply = checked(timed_request(link, load, self.config.setup_timeout).await?)?;
            let handle = reply
                .as_str()
                .ok_or_else(|| OrigamiError::Protocol(format!("bad handle for {}", command)))?;
            self.commands.register_handle(command, handle);
        }

        tracing::debug!("loaded {} commands", Command::ALL.len());
        Ok(())
    }

    async fn subscribe(&self) -> Result<()> {
        let mut args = vec!["SUBSCRIBE".to_string()];
        args.extend(self.core.subscriptions());

        let listener = &self.links.listener;
        checked(timed_request(listener, encode_command(&args), self.config.setup_timeout).await?)?;

        let core = self.core.clone();
        listener.on_message(Some(Arc::new(move |reply: &Reply| core.dispatch(reply))));
        Ok(())
    }

    async fn announce(&self) -> Result<()> {
        if self.lifecycle().announced {
            return Ok(());
        }

        let descriptors = self.core.consumer().registry().descriptors();
        let announce = build_announce(&descriptors, &self.node);
        let command = self
            .commands
            .invoke(Command::Announce, &announce.keys, &announce.args)
            .ok_or(OrigamiError::CommandMissing(Command::Announce))?;

        let reply = checked(
            timed_request(&self.links.publisher, command, self.config.setup_timeout).await?,
        )?;
        if !is_truthy(&reply) {
            return Err(OrigamiError::AnnounceRejected);
        }

        self.lifecycle().announced = true;
        tracing::info!(
            node_id = %self.node.node_id,
            channels = descriptors.len(),
            "node announced"
        );
        Ok(())
    }

    /// Tear down the current epoch. In-flight requests stay tracked for the
    /// reconnect replay.
    async fn end_epoch(&self) {
        let was_connected = self.state() == ClientState::Connected;

        self.core.stop();
        self.commands.clear_handles();
        if was_connected {
            self.set_state(ClientState::Reconnecting);
            if let Some(hook) = &self.hooks.on_close {
                hook();
            }
        }

        self.close_links().await;
    }

    async fn close_links(&self) {
        self.links.listener.on_message(None);
        for link in self.links.all() {
            if let Err(e) = link.close().await {
                tracing::debug!(link = link.name(), "close failed: {}", e);
            }
        }
    }
}

async fn supervise(
    inner: Arc<ClientInner>,
    mut events: mpsc::UnboundedReceiver<Event>,
    first: oneshot::Sender<Result<()>>,
) {
    let mut first = Some(first);

    loop {
        match inner.run_epoch().await {
            Ok(()) => {
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }

                if !wait_for_epoch_end(&inner, &mut events).await {
                    return;
                }
                tracing::warn!("connection lost, reconnecting");
                inner.end_epoch().await;
                // The other links of the dead epoch report their close too.
                while events.try_recv().is_ok() {}
            }
            Err(e) if is_fatal(&e) => {
                inner.errors.report(&e);
                inner.end_epoch().await;
                inner.set_state(ClientState::Closed);
                inner.lifecycle().stopped = true;
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(e));
                }
                return;
            }
            Err(e) => {
                tracing::warn!("connection attempt failed: {}", e);
                inner.end_epoch().await;
            }
        }

        tokio::time::sleep(inner.config.reconnect_timeout).await;
    }
}

/// Wait until the connected epoch ends. Returns `false` when no more events
/// can arrive.
async fn wait_for_epoch_end(
    inner: &ClientInner,
    events: &mut mpsc::UnboundedReceiver<Event>,
) -> bool {
    loop {
        let Some(event) = events.recv().await else {
            return false;
        };

        match (inner.state(), event) {
            (ClientState::Connected, Event::LinkClosed | Event::Restart) => return true,
            (ClientState::Closing, _) => inner.abandon.notify_one(),
            _ => {}
        }
    }
}

fn is_fatal(error: &OrigamiError) -> bool {
    matches!(
        error,
        OrigamiError::CommandMissing(_) | OrigamiError::AnnounceRejected
    )
}

async fn timed_request(link: &Connection, command: Bytes, timeout: Duration) -> Result<Reply> {
    match tokio::time::timeout(timeout, link.request(command)).await {
        Ok(result) => result,
        Err(_) => Err(OrigamiError::Timeout),
    }
}

/// Turn an error reply into a protocol error.
fn checked(reply: Reply) -> Result<Reply> {
    match reply {
        Reply::Error(message) => Err(OrigamiError::Protocol(message)),
        other => Ok(other),
    }
}

fn is_truthy(reply: &Reply) -> bool {
    match reply {
        Reply::Integer(n) => *n != 0,
        Reply::Simple(s) => !s.is_empty(),
        Reply::Bulk(Some(b)) => !b.is_empty(),
        Reply::Array(Some(_)) => true,
        Reply::Bulk(None) | Reply::Array(None) | Reply::Error(_) => false,
    }
}
