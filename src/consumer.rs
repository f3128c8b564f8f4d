//! Inbound request lifecycle.
//!
//! ```text
//! submit ─► SendingRequestAck ──'1'──► ProcessingRequest ──handler done──► SendingResponse ──ack──► (removed)
//!                  │
//!                  └──'0'──► (removed)
//! ```
//!
//! Handlers run on their own tokio task. A slow handler does not hold up the
//! tick, and a panicking one is reported to the producer as a failed request.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::codec::JsonCodec;
use crate::control::{Command, CommandStore};
use crate::drain::Drain;
use crate::handler::{Handler, HandlerError, HandlerRegistry, RequestContext};
use crate::protocol::{AcceptDecisionFrame, IdFrame, SubmitFrame};
use crate::table::{RequestTable, Staleness};
use crate::transport::Link;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SendingRequestAck,
    ProcessingRequest,
    SendingResponse,
}

struct InboundRequest {
    id: String,
    sender_id: String,
    channel: String,
    state: State,
    params: String,
    response: String,
    errored: bool,
    timestamp: Instant,
    handler: Arc<dyn Handler>,
}

/// Accepts requests for registered channels and returns handler results.
pub struct Consumer {
    node_id: String,
    link: Arc<dyn Link>,
    commands: Arc<CommandStore>,
    registry: HandlerRegistry,
    table: Mutex<RequestTable<InboundRequest>>,
    drain: Drain,
}

impl Consumer {
    pub fn new(
        node_id: &str,
        link: Arc<dyn Link>,
        commands: Arc<CommandStore>,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            link,
            commands,
            registry,
            table: Mutex::new(RequestTable::new()),
            drain: Drain::new(),
        }
    }

    fn table(&self) -> MutexGuard<'_, RequestTable<InboundRequest>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Channels this consumer serves.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// `b`: a request submitted to the logical `channel`.
    ///
    /// Ignored while stopping, for unregistered channels and for ids that are
    /// already tracked.
    pub fn on_submit(&self, channel: &str, payload: &[u8]) {
        if self.drain.is_stopping() {
            tracing::warn!("stopping, dropping request for {}", channel);
            return;
        }

        let frame = match SubmitFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("dropping submit for {}: {}", channel, e);
                return;
            }
        };

        let Some(handler) = self.registry.get_handler(channel) else {
            tracing::debug!("no handler registered for {}", channel);
            return;
        };

        let mut table = self.table();
        if table.contains(frame.request_id) {
            tracing::debug!(request_id = frame.request_id, "duplicate submit ignored");
            return;
        }

        let entry = InboundRequest {
            id: frame.request_id.to_string(),
            sender_id: frame.sender_id.to_string(),
            channel: channel.to_string(),
            state: State::SendingRequestAck,
            params: frame.params.to_string(),
            response: String::new(),
            errored: false,
            timestamp: Instant::now(),
            handler,
        };

        self.send_phase(&entry);
        table.insert(frame.request_id, entry);
        drop(table);
        self.drain.begin();
    }

    /// `d`: the server confirmed (`'1'`) or discarded (`'0'`) an accepted
    /// request. On confirmation the handler is started.
    pub fn on_accept_decision(self: &Arc<Self>, payload: &[u8]) {
        let frame = match AcceptDecisionFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("dropping accept decision: {}", e);
                return;
            }
        };

        let mut table = self.table();
        let Some(entry) = table.get_mut(frame.request_id) else {
            tracing::debug!(request_id = frame.request_id, "decision for unknown request");
            return;
        };

        if entry.state != State::SendingRequestAck {
            return;
        }

        if !frame.proceed {
            table.remove(frame.request_id);
            drop(table);
            tracing::debug!(request_id = frame.request_id, "request discarded by server");
            self.drain.end();
            return;
        }

        entry.state = State::ProcessingRequest;
        let ctx = RequestContext::new(&entry.id, &entry.sender_id, &entry.channel);
        let handler = Arc::clone(&entry.handler);
        let params = entry.params.clone();
        let id = entry.id.clone();
        drop(table);

        // The handler is invoked inside the task, so a panic in its
        // synchronous part is caught like any other.
        let work = async move { handler.call(&params, ctx).await };

        let consumer = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match tokio::spawn(work).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(HandlerError::panic(panic_message(e.into_panic()))),
                Err(_) => Err(HandlerError::cancelled()),
            };

            match outcome {
                Ok(response) => consumer.complete(&id, false, response),
                Err(e) => {
                    tracing::debug!(request_id = %id, "handler failed: {}", e);
                    let record = JsonCodec::encode(e.record()).unwrap_or_else(|_| "null".into());
                    consumer.complete(&id, true, record);
                }
            }
        });
    }

    /// `g`: the server confirmed the response. Terminal.
    pub fn on_response_ack(&self, payload: &[u8]) {
        let frame = match IdFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("dropping response ack: {}", e);
                return;
            }
        };

        let removed = self.table().remove(frame.request_id);
        match removed {
            Some(_) => self.drain.end(),
            None => tracing::debug!(request_id = frame.request_id, "ack for unknown request"),
        }
    }

    /// Resend stale phase messages. Returns `true` once an entry has waited
    /// longer than `restart`.
    pub fn cleaner(&self, now: Instant, ack: Duration, restart: Duration) -> bool {
        let table = self.table();

        for entry in table.values() {
            if entry.state == State::ProcessingRequest {
                continue;
            }

            match Staleness::of(entry.timestamp, now, ack, restart) {
                Staleness::Fresh => {}
                Staleness::Resend => self.send_phase(entry),
                Staleness::Stalled => {
                    tracing::warn!(request_id = %entry.id, state = ?entry.state, "request stalled");
                    return true;
                }
            }
        }

        false
    }

    /// Resend every in-flight phase message with `now` as its new baseline.
    pub fn restart(&self, now: Instant) {
        let mut table = self.table();

        for entry in table.values_mut() {
            if entry.state == State::ProcessingRequest {
                continue;
            }
            entry.timestamp = now;
            self.send_phase(entry);
        }
    }

    /// Stop accepting new requests and wait for tracked ones to finish.
    pub fn stop(&self) -> impl Future<Output = ()> + Send + 'static {
        self.drain.stop()
    }

    pub fn active(&self) -> usize {
        self.drain.active()
    }

    fn complete(&self, id: &str, errored: bool, response: String) {
        let mut table = self.table();
        let Some(entry) = table.get_mut(id) else {
            return;
        };
        if entry.state != State::ProcessingRequest {
            return;
        }

        entry.errored = errored;
        entry.response = response;
        entry.state = State::SendingResponse;
        entry.timestamp = Instant::now();
        self.send_phase(entry);
    }

    fn send_phase(&self, entry: &InboundRequest) {
        let node_id = self.node_id.as_str();
        let command = match entry.state {
            State::SendingRequestAck => {
                self.commands.call(Command::AcceptAck, &[node_id, &entry.id])
            }
            State::SendingResponse => {
                let errored = if entry.errored { "1" } else { "0" };
                self.commands.call(
                    Command::Respond,
                    &[node_id, &entry.id, errored, &entry.response],
                )
            }
            State::ProcessingRequest => return,
        };

        let Some(command) = command else {
            tracing::debug!(request_id = %entry.id, "command not loaded yet, send deferred");
            return;
        };

        if let Err(e) = self.link.send(command) {
            tracing::debug!(request_id = %entry.id, "send failed: {}", e);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ChannelOptions;
    use crate::handler::ErrorRecord;
    use crate::testing::RecordingLink;
    use serde_json::json;

    const NODE: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
    const SENDER: &str = "16fd2706-8baf-433b-82eb-8c7fada847da";
    const REQ: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";
    const ACK: Duration = Duration::from_secs(2);
    const RESTART: Duration = Duration::from_secs(10);

    fn setup() -> (Arc<Consumer>, Arc<RecordingLink>) {
        let mut registry = HandlerRegistry::new();
        registry.register("double", ChannelOptions::default(), |n: i64, _ctx| async move {
            Ok(n * 2)
        });
        registry.register("fail", ChannelOptions::default(), |_: (), _ctx| async {
            Err::<(), _>(HandlerError::new("boom"))
        });
        registry.register("panic", ChannelOptions::default(), |_: (), _ctx| async {
            if true {
                panic!("handler exploded");
            }
            Ok(())
        });
        registry.register("eager", ChannelOptions::default(), |explode: bool, _ctx| {
            if explode {
                panic!("panicked before returning a future");
            }
            async move { Ok(explode) }
        });
        registry.register(
            "whoami",
            ChannelOptions::default(),
            |_: (), ctx: RequestContext| async move {
                Ok(json!([ctx.request_id(), ctx.sender_id(), ctx.channel()]))
            },
        );

        let link = Arc::new(RecordingLink::default());
        let commands = CommandStore::new();
        commands.register_handle(Command::AcceptAck, "ack");
        commands.register_handle(Command::Respond, "respond");
        let consumer = Consumer::new(NODE, link.clone(), Arc::new(commands), registry);
        (Arc::new(consumer), link)
    }

    fn submit(params: &str) -> Vec<u8> {
        format!("{}{}{}", REQ, SENDER, params).into_bytes()
    }

    fn decision(flag: char) -> Vec<u8> {
        format!("{}{}", flag, REQ).into_bytes()
    }

    #[tokio::test]
    async fn test_happy_path() {
        let (consumer, link) = setup();

        consumer.on_submit("double", &submit("21"));
        assert_eq!(link.take(), vec![vec!["EVALSHA", "ack", "0", NODE, REQ]]);
        assert_eq!(consumer.active(), 1);

        consumer.on_accept_decision(&decision('1'));
        let sent = link.wait_for(1).await;
        assert_eq!(sent, vec![vec!["EVALSHA", "respond", "0", NODE, REQ, "0", "42"]]);

        consumer.on_response_ack(REQ.as_bytes());
        assert_eq!(consumer.active(), 0);
    }

    #[tokio::test]
    async fn test_context_is_passed_to_handler() {
        let (consumer, link) = setup();

        consumer.on_submit("whoami", &submit("null"));
        consumer.on_accept_decision(&decision('1'));

        let sent = link.wait_for(2).await;
        let response: serde_json::Value = serde_json::from_str(&sent[1][6]).unwrap();
        assert_eq!(response, json!([REQ, SENDER, "whoami"]));
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported() {
        let (consumer, link) = setup();

        consumer.on_submit("fail", &submit("null"));
        consumer.on_accept_decision(&decision('1'));

        let sent = link.wait_for(2).await;
        assert_eq!(sent[1][5], "1");
        let record: ErrorRecord = serde_json::from_str(&sent[1][6]).unwrap();
        assert_eq!(record.message.as_deref(), Some("boom"));

        // The entry still reaches its terminal state normally.
        consumer.on_response_ack(REQ.as_bytes());
        assert_eq!(consumer.active(), 0);
    }

    #[tokio::test]
    async fn test_handler_panic_is_reported() {
        let (consumer, link) = setup();

        consumer.on_submit("panic", &submit("null"));
        consumer.on_accept_decision(&decision('1'));

        let sent = link.wait_for(2).await;
        assert_eq!(sent[1][5], "1");
        let record: ErrorRecord = serde_json::from_str(&sent[1][6]).unwrap();
        assert_eq!(record.name.as_deref(), Some("Panic"));
        assert_eq!(record.message.as_deref(), Some("handler exploded"));
    }

    #[tokio::test]
    async fn test_synchronous_handler_panic_leaves_table_usable() {
        let (consumer, link) = setup();

        consumer.on_submit("eager", &submit("true"));
        consumer.on_accept_decision(&decision('1'));

        let sent = link.wait_for(2).await;
        assert_eq!(sent[1][5], "1");
        let record: ErrorRecord = serde_json::from_str(&sent[1][6]).unwrap();
        assert_eq!(record.name.as_deref(), Some("Panic"));
        assert_eq!(record.message.as_deref(), Some("panicked before returning a future"));

        consumer.on_response_ack(REQ.as_bytes());
        assert_eq!(consumer.active(), 0);

        // A second request on the same consumer walks every phase normally.
        link.take();
        consumer.on_submit("eager", &submit("false"));
        consumer.on_accept_decision(&decision('1'));
        let sent = link.wait_for(2).await;
        assert_eq!(sent[1][5..], ["0".to_string(), "false".to_string()]);
        consumer.on_response_ack(REQ.as_bytes());
        assert_eq!(consumer.active(), 0);
    }

    #[tokio::test]
    async fn test_bad_params_fail_request() {
        let (consumer, link) = setup();

        consumer.on_submit("double", &submit("\"nope\""));
        consumer.on_accept_decision(&decision('1'));

        let sent = link.wait_for(2).await;
        assert_eq!(sent[1][5], "1");
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_ignored() {
        let (consumer, link) = setup();

        consumer.on_submit("double", &submit("1"));
        consumer.on_submit("double", &submit("1"));

        assert_eq!(link.take().len(), 1);
        assert_eq!(consumer.active(), 1);
    }

    #[tokio::test]
    async fn test_discarded_request_is_removed() {
        let (consumer, link) = setup();

        consumer.on_submit("double", &submit("1"));
        consumer.on_accept_decision(&decision('0'));

        assert_eq!(consumer.active(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(link.take().len(), 1);
    }

    #[tokio::test]
    async fn test_decision_ignored_outside_ack_phase() {
        let (consumer, link) = setup();

        consumer.on_submit("double", &submit("1"));
        consumer.on_accept_decision(&decision('1'));
        link.wait_for(2).await;

        // A late duplicate neither reruns the handler nor drops the entry.
        consumer.on_accept_decision(&decision('1'));
        consumer.on_accept_decision(&decision('0'));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(link.take().is_empty());
        assert_eq!(consumer.active(), 1);
    }

    #[tokio::test]
    async fn test_unknown_channel_and_malformed_frames() {
        let (consumer, link) = setup();

        consumer.on_submit("missing", &submit("1"));
        consumer.on_submit("double", b"too short");
        consumer.on_accept_decision(b"1abc");
        consumer.on_response_ack(REQ.as_bytes());

        assert!(link.take().is_empty());
        assert_eq!(consumer.active(), 0);
    }

    #[tokio::test]
    async fn test_cleaner_resends_and_detects_stall() {
        let (consumer, link) = setup();
        consumer.on_submit("double", &submit("1"));
        link.take();
        let start = Instant::now();

        assert!(!consumer.cleaner(start + Duration::from_secs(1), ACK, RESTART));
        assert!(link.take().is_empty());

        assert!(!consumer.cleaner(start + Duration::from_secs(3), ACK, RESTART));
        assert_eq!(link.take(), vec![vec!["EVALSHA", "ack", "0", NODE, REQ]]);

        assert!(consumer.cleaner(start + Duration::from_secs(11), ACK, RESTART));
        assert_eq!(consumer.active(), 1);
    }

    #[tokio::test]
    async fn test_restart_resends_response() {
        let (consumer, link) = setup();
        consumer.on_submit("double", &submit("5"));
        consumer.on_accept_decision(&decision('1'));
        link.wait_for(2).await;

        consumer.restart(Instant::now());

        let sent = link.take();
        assert_eq!(sent, vec![vec!["EVALSHA", "respond", "0", NODE, REQ, "0", "10"]]);
    }

    #[tokio::test]
    async fn test_stop_blocks_new_work_and_drains() {
        let (consumer, link) = setup();
        consumer.on_submit("double", &submit("1"));
        link.take();

        let stopped = tokio::spawn(consumer.stop());

        let other = "9b2f8f0e-3c1d-4a7e-8a4f-2b6a1c9d0e11";
        consumer.on_submit("double", format!("{}{}1", other, SENDER).as_bytes());
        assert!(link.take().is_empty());

        consumer.on_accept_decision(&decision('1'));
        link.wait_for(1).await;
        assert!(!stopped.is_finished());

        consumer.on_response_ack(REQ.as_bytes());
        stopped.await.unwrap();
    }
}
