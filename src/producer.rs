//! Outbound request lifecycle.
//!
//! ```text
//! request() ─► SendingRequest ──accepted──► ProcessingRequest ──result──► SendingResponseAck ──confirmed──► (removed)
//!                   │                                                         ▲
//!                   └───────────────────────────result────────────────────────┘
//! ```
//!
//! Every outbound phase message is resent by [`Producer::cleaner`] until the
//! next phase arrives. The caller's [`PendingResponse`] settles exactly once,
//! on the first result.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::codec::JsonCodec;
use crate::control::{Command, CommandStore};
use crate::drain::Drain;
use crate::error::Result;
use crate::handler::ErrorRecord;
use crate::protocol::{IdFrame, ResultFrame, ResultStatus};
use crate::table::{RequestTable, Staleness};
use crate::transport::Link;

/// Why a request did not produce a value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResponseError {
    /// The consumer's handler failed.
    #[error("request failed: {0}")]
    Processing(ErrorRecord),

    /// The server gave up waiting for a consumer.
    #[error("request timed out")]
    Timeout,

    /// The result payload could not be decoded.
    #[error("malformed result: {0}")]
    Malformed(String),

    /// The producer was dropped before the request settled.
    #[error("request abandoned")]
    Abandoned,
}

/// Outcome of one request.
pub type Response = std::result::Result<Value, ResponseError>;

/// Options for [`Producer::request`].
///
/// `timeout` and `try_after` travel to the server in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    /// Queue group on the server.
    pub group: String,
    pub weight: u32,
    /// Delay before the server first offers the request to a consumer.
    pub try_after: Duration,
    /// Server-side deadline; zero means none.
    pub timeout: Duration,
    /// Fire-and-forget: the request is done once the server accepts it.
    pub no_response: bool,
    /// Reserved; kept on the entry but not sent.
    pub no_response_ack: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            weight: 0,
            try_after: Duration::ZERO,
            timeout: Duration::ZERO,
            no_response: false,
            no_response_ack: false,
        }
    }
}

impl RequestOptions {
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn try_after(mut self, delay: Duration) -> Self {
        self.try_after = delay;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn no_response(mut self, no_response: bool) -> Self {
        self.no_response = no_response;
        self
    }

    pub fn no_response_ack(mut self, no_response_ack: bool) -> Self {
        self.no_response_ack = no_response_ack;
        self
    }
}

/// Handle to a request in flight. Resolves to its [`Response`].
#[derive(Debug)]
pub struct PendingResponse {
    request_id: String,
    rx: oneshot::Receiver<Response>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for PendingResponse {
    type Output = Response;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ResponseError::Abandoned)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SendingRequest,
    ProcessingRequest,
    SendingResponseAck,
}

struct OutboundRequest {
    id: String,
    channel: String,
    options: RequestOptions,
    params: String,
    state: State,
    timestamp: Instant,
    settle: Option<oneshot::Sender<Response>>,
}

impl OutboundRequest {
    fn settle(&mut self, response: Response) {
        if let Some(tx) = self.settle.take() {
            // The caller may have dropped its handle; nothing to report then.
            let _ = tx.send(response);
        }
    }
}

/// Issues requests and drives them to completion.
pub struct Producer {
    node_id: String,
    link: Arc<dyn Link>,
    commands: Arc<CommandStore>,
    table: Mutex<RequestTable<OutboundRequest>>,
    drain: Drain,
}

impl Producer {
    pub fn new(node_id: &str, link: Arc<dyn Link>, commands: Arc<CommandStore>) -> Self {
        Self {
            node_id: node_id.to_string(),
            link,
            commands,
            table: Mutex::new(RequestTable::new()),
            drain: Drain::new(),
        }
    }

    fn table(&self) -> MutexGuard<'_, RequestTable<OutboundRequest>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a request to `channel`.
    ///
    /// The submit is sent right away when the command is loaded; otherwise
    /// it goes out on the next reconnect replay.
    ///
    /// # Errors
    ///
    /// Returns an error only if `params` cannot be serialized.
    pub fn request<P>(
        &self,
        channel: &str,
        params: &P,
        options: RequestOptions,
    ) -> Result<PendingResponse>
    where
        P: Serialize + ?Sized,
    {
        let params = JsonCodec::encode(params)?;
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        let entry = OutboundRequest {
            id: id.clone(),
            channel: channel.to_string(),
            options,
            params,
            state: State::SendingRequest,
            timestamp: Instant::now(),
            settle: Some(tx),
        };

        if self.track(entry) {
            tracing::debug!(request_id = %id, "submitted request to {}", channel);
        }
        Ok(PendingResponse { request_id: id, rx })
    }

    /// Insert a new entry and send its submit. An id that is already tracked
    /// is refused and its handle settles as abandoned.
    fn track(&self, entry: OutboundRequest) -> bool {
        let id = entry.id.clone();
        let mut table = self.table();

        if !table.insert(&id, entry) {
            drop(table);
            tracing::warn!(request_id = %id, "request id already tracked, dropping submit");
            return false;
        }
        if let Some(entry) = table.get_mut(&id) {
            self.send_phase(entry);
        }
        drop(table);

        self.drain.begin();
        true
    }

    /// `c`: the server accepted a request.
    pub fn on_accepted(&self, payload: &[u8]) {
        let frame = match IdFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("dropping accept: {}", e);
                return;
            }
        };

        let mut table = self.table();
        let Some(entry) = table.get_mut(frame.request_id) else {
            tracing::debug!(request_id = frame.request_id, "accept for unknown request");
            return;
        };

        if entry.state != State::SendingRequest {
            return;
        }

        if entry.options.no_response {
            if let Some(mut entry) = table.remove(frame.request_id) {
                entry.settle(Ok(Value::Null));
            }
            drop(table);
            self.drain.end();
            return;
        }

        entry.state = State::ProcessingRequest;
    }

    /// `e`: result of a request.
    pub fn on_result(&self, payload: &[u8]) {
        let frame = match ResultFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("dropping result: {}", e);
                return;
            }
        };

        let mut table = self.table();
        let Some(entry) = table.get_mut(frame.request_id) else {
            tracing::debug!(request_id = frame.request_id, "result for unknown request");
            return;
        };

        if entry.state != State::SendingResponseAck {
            entry.settle(decode_response(&frame));
            entry.state = State::SendingResponseAck;
            entry.timestamp = Instant::now();
        }

        self.send_phase(entry);
    }

    /// `f`: the server confirmed the result ack. Terminal.
    pub fn on_result_ack(&self, payload: &[u8]) {
        let frame = match IdFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("dropping result ack: {}", e);
                return;
            }
        };

        let removed = self.table().remove(frame.request_id);
        match removed {
            Some(_) => self.drain.end(),
            None => {
                tracing::debug!(request_id = frame.request_id, "result ack for unknown request")
            }
        }
    }

    /// Resend stale phase messages.
    ///
    /// Returns `true` as soon as one entry has waited longer than `restart`;
    /// that entry stays in the table for the reconnect replay.
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

    /// Wait until every tracked request has finished.
    pub fn stop(&self) -> impl Future<Output = ()> + Send + 'static {
        self.drain.stop()
    }

    /// Number of requests not yet finished.
    pub fn active(&self) -> usize {
        self.drain.active()
    }

    fn send_phase(&self, entry: &OutboundRequest) {
        let command = match entry.state {
            State::SendingRequest => {
                let timeout = entry.options.timeout.as_millis().to_string();
                let try_after = entry.options.try_after.as_millis().to_string();
                let weight = entry.options.weight.to_string();
                let no_response = if entry.options.no_response { "1" } else { "0" };

                self.commands.call(
                    Command::SubmitRequest,
                    &[
                        self.node_id.as_str(),
                        &entry.id,
                        &entry.channel,
                        &entry.params,
                        &entry.options.group,
                        no_response,
                        &timeout,
                        &try_after,
                        &weight,
                    ],
                )
            }
            State::SendingResponseAck => self
                .commands
                .call(Command::ResultAck, &[self.node_id.as_str(), &entry.id]),
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

fn decode_response(frame: &ResultFrame<'_>) -> Response {
    match frame.status {
        ResultStatus::Ok => JsonCodec::decode::<Value>(frame.payload)
            .map_err(|e| ResponseError::Malformed(e.to_string())),
        ResultStatus::Failed => match JsonCodec::decode::<ErrorRecord>(frame.payload) {
            Ok(record) => Err(ResponseError::Processing(record)),
            Err(e) => Err(ResponseError::Malformed(e.to_string())),
        },
        ResultStatus::TimedOut => Err(ResponseError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingLink;
    use serde_json::json;

    const NODE: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
    const ACK: Duration = Duration::from_secs(2);
    const RESTART: Duration = Duration::from_secs(10);

    fn setup() -> (Producer, Arc<RecordingLink>) {
        let link = Arc::new(RecordingLink::default());
        let commands = CommandStore::new();
        commands.register_handle(Command::SubmitRequest, "submit");
        commands.register_handle(Command::ResultAck, "rack");
        let producer = Producer::new(NODE, link.clone(), Arc::new(commands));
        (producer, link)
    }

    fn result(status: char, id: &str, payload: &str) -> Vec<u8> {
        format!("{}{}{}", status, id, payload).into_bytes()
    }

    #[tokio::test]
    async fn test_happy_path() {
        let (producer, link) = setup();

        let pending = producer
            .request("ch", &json!({"x": 1}), RequestOptions::default())
            .unwrap();
        let id = pending.request_id().to_string();

        let sent = link.take();
        assert_eq!(
            sent,
            vec![vec![
                "EVALSHA",
                "submit",
                "0",
                NODE,
                id.as_str(),
                "ch",
                r#"{"x":1}"#,
                "default",
                "0",
                "0",
                "0",
                "0",
            ]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()]
        );

        producer.on_accepted(id.as_bytes());
        producer.on_result(&result('0', &id, r#"{"y":2}"#));

        assert_eq!(pending.await, Ok(json!({"y": 2})));

        let sent = link.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][1], "rack");
        assert_eq!(sent[0][4], id);
        assert_eq!(producer.active(), 1);

        producer.on_result_ack(id.as_bytes());
        assert_eq!(producer.active(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_refused() {
        let (producer, link) = setup();
        let id = "0f8fad5b-d9cb-469f-a165-70867728950e";

        let entry = |tx| OutboundRequest {
            id: id.to_string(),
            channel: "ch".to_string(),
            options: RequestOptions::default(),
            params: "1".to_string(),
            state: State::SendingRequest,
            timestamp: Instant::now(),
            settle: Some(tx),
        };

        let (first_tx, _first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();

        assert!(producer.track(entry(first_tx)));
        assert!(!producer.track(entry(second_tx)));

        assert_eq!(link.take().len(), 1);
        assert_eq!(producer.active(), 1);

        let refused = PendingResponse {
            request_id: id.to_string(),
            rx: second_rx,
        };
        assert_eq!(refused.await, Err(ResponseError::Abandoned));
    }

    #[tokio::test]
    async fn test_absent_params_serialize_as_null() {
        let (producer, link) = setup();

        producer.request("ch", &(), RequestOptions::default()).unwrap();
        producer
            .request("ch", &None::<u32>, RequestOptions::default())
            .unwrap();

        let sent = link.take();
        assert_eq!(sent[0][6], "null");
        assert_eq!(sent[1][6], "null");
    }

    #[tokio::test]
    async fn test_options_on_the_wire() {
        let (producer, link) = setup();
        let options = RequestOptions::default()
            .group("images")
            .weight(3)
            .try_after(Duration::from_millis(250))
            .timeout(Duration::from_secs(30))
            .no_response(true);

        producer.request("ch", &1, options).unwrap();

        let sent = link.take();
        assert_eq!(&sent[0][7..], &["images", "1", "30000", "250", "3"]);
    }

    #[tokio::test]
    async fn test_processing_error_and_timeout() {
        let (producer, _link) = setup();

        let failed = producer.request("ch", &1, RequestOptions::default()).unwrap();
        let failed_id = failed.request_id().to_string();
        let timed_out = producer.request("ch", &1, RequestOptions::default()).unwrap();
        let timed_out_id = timed_out.request_id().to_string();

        producer.on_result(&result(
            '1',
            &failed_id,
            r#"{"name":"Error","message":"boom","stack":null,"code":null,"cause":null}"#,
        ));
        producer.on_result(&result('2', &timed_out_id, ""));

        match failed.await {
            Err(ResponseError::Processing(record)) => {
                assert_eq!(record.message.as_deref(), Some("boom"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(timed_out.await, Err(ResponseError::Timeout));
    }

    #[tokio::test]
    async fn test_malformed_result() {
        let (producer, _link) = setup();
        let pending = producer.request("ch", &1, RequestOptions::default()).unwrap();
        let id = pending.request_id().to_string();

        producer.on_result(&result('0', &id, "{not json"));

        assert!(matches!(pending.await, Err(ResponseError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_duplicate_result_resends_ack_only() {
        let (producer, link) = setup();
        let pending = producer.request("ch", &1, RequestOptions::default()).unwrap();
        let id = pending.request_id().to_string();
        link.take();

        producer.on_result(&result('0', &id, "1"));
        producer.on_result(&result('0', &id, "2"));

        assert_eq!(pending.await, Ok(json!(1)));
        let sent = link.take();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|args| args[1] == "rack"));
    }

    #[tokio::test]
    async fn test_no_response_settles_on_accept() {
        let (producer, _link) = setup();
        let pending = producer
            .request("ch", &1, RequestOptions::default().no_response(true))
            .unwrap();
        let id = pending.request_id().to_string();

        producer.on_accepted(id.as_bytes());

        assert_eq!(producer.active(), 0);
        assert_eq!(pending.await, Ok(Value::Null));
    }

    #[test]
    fn test_unknown_ids_are_ignored() {
        let (producer, link) = setup();
        let unknown = "0f8fad5b-d9cb-469f-a165-70867728950e";

        producer.on_accepted(unknown.as_bytes());
        producer.on_result(&result('0', unknown, "1"));
        producer.on_result_ack(unknown.as_bytes());
        producer.on_accepted(b"short");

        assert!(link.take().is_empty());
        assert_eq!(producer.active(), 0);
    }

    #[tokio::test]
    async fn test_cleaner_resends_once_past_ack_window() {
        let (producer, link) = setup();
        let pending = producer.request("ch", &1, RequestOptions::default()).unwrap();
        let id = pending.request_id().to_string();
        link.take();
        let start = Instant::now();

        assert!(!producer.cleaner(start, ACK, RESTART));
        assert!(link.take().is_empty());

        assert!(!producer.cleaner(start + Duration::from_secs(3), ACK, RESTART));
        let sent = link.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][1], "submit");

        // Resending keeps the original timestamp and creates no new entry.
        assert_eq!(producer.active(), 1);
        producer.on_accepted(id.as_bytes());
        producer.on_result(&result('0', &id, "true"));
        assert_eq!(pending.await, Ok(json!(true)));
    }

    #[tokio::test]
    async fn test_cleaner_skips_processing_entries() {
        let (producer, link) = setup();
        let pending = producer.request("ch", &1, RequestOptions::default()).unwrap();
        producer.on_accepted(pending.request_id().as_bytes());
        link.take();

        let later = Instant::now() + Duration::from_secs(60);
        assert!(!producer.cleaner(later, ACK, RESTART));
        assert!(link.take().is_empty());
    }

    #[tokio::test]
    async fn test_stall_keeps_entry_for_replay() {
        let (producer, link) = setup();
        let _pending = producer.request("ch", &1, RequestOptions::default()).unwrap();
        link.take();

        let later = Instant::now() + Duration::from_secs(11);
        assert!(producer.cleaner(later, ACK, RESTART));
        assert_eq!(producer.active(), 1);

        producer.restart(later);
        assert_eq!(link.take().len(), 1);
        assert!(!producer.cleaner(later + Duration::from_secs(1), ACK, RESTART));
    }

    #[tokio::test]
    async fn test_send_deferred_until_handles_loaded() {
        let link = Arc::new(RecordingLink::default());
        let commands = Arc::new(CommandStore::new());
        let producer = Producer::new(NODE, link.clone(), commands.clone());

        let _pending = producer.request("ch", &1, RequestOptions::default()).unwrap();
        assert!(link.take().is_empty());

        commands.register_handle(Command::SubmitRequest, "submit");
        producer.restart(Instant::now());
        assert_eq!(link.take().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_terminal_state() {
        let (producer, _link) = setup();
        let pending = producer.request("ch", &1, RequestOptions::default()).unwrap();
        let id = pending.request_id().to_string();

        let stopped = tokio::spawn(producer.stop());
        producer.on_result(&result('0', &id, "1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopped.is_finished());

        producer.on_result_ack(id.as_bytes());
        stopped.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_producer_abandons_request() {
        let (producer, _link) = setup();
        let pending = producer.request("ch", &1, RequestOptions::default()).unwrap();

        drop(producer);

        assert_eq!(pending.await, Err(ResponseError::Abandoned));
    }
}
