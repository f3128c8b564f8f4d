//! Orchestrator: heartbeat, stop handshake, retry tick and message routing.
//!
//! The core owns the [`Producer`] and [`Consumer`] and routes every
//! subscription push to one of them by channel name. Two handshakes of its
//! own run next to theirs:
//!
//! - **heartbeat**: after each `ping_interval` a heartbeat goes out on the
//!   heartbeat link; the next one waits for its ack.
//! - **stop**: [`Core::stop_requests_accepting`] tells the server this node
//!   is withdrawing and resolves once the server confirms.
//!
//! One periodic tick checks, in order, the heartbeat, the stop handshake, the
//! producer and the consumer. The first to report a stall ends the tick and
//! fires the restart hook; the rest waits for the next epoch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::Windows;
use crate::consumer::Consumer;
use crate::control::{Command, CommandStore};
use crate::handler::HandlerRegistry;
use crate::producer::Producer;
use crate::protocol::{submit_channel, Phase, Reply};
use crate::table::Staleness;
use crate::transport::Link;

/// Called when the tick decides the links must be rebuilt.
pub type RestartHook = Arc<dyn Fn() + Send + Sync>;

/// Timing of the core's loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreSettings {
    pub ping_interval: Duration,
    pub tick_interval: Duration,
    pub heartbeat: Windows,
    pub requests: Windows,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
            tick_interval: Duration::from_secs(2),
            heartbeat: Windows::HEARTBEAT,
            requests: Windows::REQUESTS,
        }
    }
}

/// Outbound links used by the core and its components.
#[derive(Clone)]
pub struct CoreLinks {
    /// Carries heartbeats only.
    pub heartbeat: Arc<dyn Link>,
    /// Carries every other command.
    pub publisher: Arc<dyn Link>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    HeartbeatAck,
    StopAck,
    Accepted,
    Result,
    ResultAckConfirmed,
    AcceptDecision,
    ResponseAck,
    /// Inbound work for a logical channel.
    Submit(String),
}

#[derive(Default)]
struct CoreState {
    ping_sent: Option<Instant>,
    stop_sent: Option<Instant>,
    stop_requested: bool,
    tasks: Vec<JoinHandle<()>>,
}

/// Per-node orchestrator.
pub struct Core {
    node_id: String,
    settings: CoreSettings,
    links: CoreLinks,
    commands: Arc<CommandStore>,
    producer: Arc<Producer>,
    consumer: Arc<Consumer>,
    routes: HashMap<String, Route>,
    state: Mutex<CoreState>,
    ping_ack: Arc<Notify>,
    stop_done: watch::Sender<bool>,
    on_restart: RestartHook,
}

impl Core {
    pub fn new(
        node_id: &str,
        settings: CoreSettings,
        links: CoreLinks,
        commands: Arc<CommandStore>,
        registry: HandlerRegistry,
        on_restart: RestartHook,
    ) -> Self {
        let producer = Arc::new(Producer::new(
            node_id,
            links.publisher.clone(),
            commands.clone(),
        ));
        let consumer = Arc::new(Consumer::new(
            node_id,
            links.publisher.clone(),
            commands.clone(),
            registry,
        ));

        let mut routes = HashMap::new();
        routes.insert(Phase::HeartbeatAck.channel(node_id), Route::HeartbeatAck);
        routes.insert(Phase::StopAck.channel(node_id), Route::StopAck);
        routes.insert(Phase::Accepted.channel(node_id), Route::Accepted);
        routes.insert(Phase::Result.channel(node_id), Route::Result);
        routes.insert(
            Phase::ResultAckConfirmed.channel(node_id),
            Route::ResultAckConfirmed,
        );
        routes.insert(Phase::AcceptDecision.channel(node_id), Route::AcceptDecision);
        routes.insert(Phase::ResponseAck.channel(node_id), Route::ResponseAck);
        for name in consumer.registry().names() {
            routes.insert(submit_channel(node_id, name), Route::Submit(name.to_string()));
        }

        let (stop_done, _) = watch::channel(false);

        Self {
            node_id: node_id.to_string(),
            settings,
            links,
            commands,
            producer,
            consumer,
            routes,
            state: Mutex::new(CoreState::default()),
            ping_ack: Arc::new(Notify::new()),
            stop_done,
            on_restart,
        }
    }

    fn state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn producer(&self) -> &Arc<Producer> {
        &self.producer
    }

    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.consumer
    }

    /// Every channel the listener link must subscribe to.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.routes.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Begin an epoch: replay in-flight work, then start the heartbeat and
    /// the tick.
    pub fn start(self: &Arc<Self>, now: Instant) {
        self.stop();

        {
            let mut state = self.state();
            state.ping_sent = None;
            if state.stop_sent.is_some() {
                state.stop_sent = Some(now);
                self.send_stop();
            }
        }

        self.consumer.restart(now);
        self.producer.restart(now);

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::downgrade(self),
            self.ping_ack.clone(),
            self.settings.ping_interval,
        ));
        let tick = tokio::spawn(tick_loop(Arc::downgrade(self), self.settings.tick_interval));

        self.state().tasks = vec![heartbeat, tick];
    }

    /// End the epoch's loops. In-flight state is kept for the next start.
    pub fn stop(&self) {
        let tasks = std::mem::take(&mut self.state().tasks);
        for task in tasks {
            task.abort();
        }
    }

    /// Tell the server this node stops taking work.
    ///
    /// Resolves once the server confirms. Resolves at once when the command
    /// is not loaded, since there is no one to tell. Repeated calls share the
    /// same handshake.
    pub fn stop_requests_accepting(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.stop_done.subscribe();

        {
            let mut state = self.state();
            if !state.stop_requested {
                state.stop_requested = true;
                if self.commands.handle(Command::StopBroadcast).is_some() {
                    state.stop_sent = Some(Instant::now());
                    self.send_stop();
                } else {
                    self.stop_done.send_replace(true);
                }
            }
        }

        async move {
            let _ = rx.wait_for(|done| *done).await;
        }
    }

    /// Route one decoded push from the listener link.
    ///
    /// Anything other than `["message", channel, payload]` on a known channel
    /// is ignored.
    pub fn dispatch(&self, reply: &Reply) {
        let Some([kind, channel, payload]) = reply.as_array() else {
            return;
        };
        if kind.as_bytes() != Some(b"message".as_slice()) {
            return;
        }
        let (Some(channel), Some(payload)) = (channel.as_str(), payload.as_bytes()) else {
            return;
        };
        let Some(route) = self.routes.get(channel) else {
            tracing::debug!("message on unrouted channel {}", channel);
            return;
        };

        match route {
            Route::HeartbeatAck => self.on_heartbeat_ack(),
            Route::StopAck => self.on_stop_ack(),
            Route::Accepted => self.producer.on_accepted(payload),
            Route::Result => self.producer.on_result(payload),
            Route::ResultAckConfirmed => self.producer.on_result_ack(payload),
            Route::AcceptDecision => self.consumer.on_accept_decision(payload),
            Route::ResponseAck => self.consumer.on_response_ack(payload),
            Route::Submit(name) => self.consumer.on_submit(name, payload),
        }
    }

    fn on_heartbeat_ack(&self) {
        if self.state().ping_sent.take().is_some() {
            self.ping_ack.notify_one();
        }
    }

    fn on_stop_ack(&self) {
        self.state().stop_sent = None;
        self.stop_done.send_replace(true);
    }

    /// One retry pass. Returns `true` when the links must be rebuilt.
    pub fn tick(&self, now: Instant) -> bool {
        let heartbeat = self.settings.heartbeat;
        let requests = self.settings.requests;

        {
            let mut state = self.state();

            if let Some(sent) = state.ping_sent {
                match Staleness::of(sent, now, heartbeat.ack, heartbeat.restart) {
                    Staleness::Fresh => {}
                    Staleness::Resend => self.send_ping(),
                    Staleness::Stalled => {
                        tracing::warn!("heartbeat unanswered for {:?}", now - sent);
                        state.ping_sent = None;
                        return true;
                    }
                }
            }

            if let Some(sent) = state.stop_sent {
                match Staleness::of(sent, now, heartbeat.ack, heartbeat.restart) {
                    Staleness::Fresh => {}
                    Staleness::Resend => self.send_stop(),
                    Staleness::Stalled => {
                        tracing::warn!("stop broadcast unanswered for {:?}", now - sent);
                        return true;
                    }
                }
            }
        }

        self.producer.cleaner(now, requests.ack, requests.restart)
            || self.consumer.cleaner(now, requests.ack, requests.restart)
    }

    /// Send a heartbeat and start waiting for its ack. Returns `false` when
    /// the command is not loaded yet.
    fn begin_ping(&self) -> bool {
        let mut state = self.state();
        if self.commands.handle(Command::Heartbeat).is_none() {
            return false;
        }
        state.ping_sent = Some(Instant::now());
        self.send_ping();
        true
    }

    fn send_ping(&self) {
        let Some(command) = self.commands.call(Command::Heartbeat, &[&self.node_id]) else {
            return;
        };
        if let Err(e) = self.links.heartbeat.send(command) {
            tracing::debug!("heartbeat send failed: {}", e);
        }
    }

    fn send_stop(&self) {
        let Some(command) = self.commands.call(Command::StopBroadcast, &[&self.node_id]) else {
            return;
        };
        if let Err(e) = self.links.publisher.send(command) {
            tracing::debug!("stop broadcast send failed: {}", e);
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn heartbeat_loop(core: Weak<Core>, ack: Arc<Notify>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let sent = match core.upgrade() {
            Some(core) => core.begin_ping(),
            None => return,
        };

        if sent {
            ack.notified().await;
        }
    }
}

async fn tick_loop(core: Weak<Core>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(core) = core.upgrade() else {
            return;
        };

        if core.tick(Instant::now()) {
            tracing::warn!("stall detected, restarting links");
            (core.on_restart)();
            return;
        }
    }
}
