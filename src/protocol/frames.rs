//! Channel names and the fixed-width message frames carried on them.
//!
//! Every exchange is addressed by `origami.` + a phase letter + the node id
//! (+ the logical channel name for inbound work):
//!
//! ```text
//! letter  recipient  payload
//! a       core       heartbeat ack (ignored)
//! b       consumer   request_id[36] sender_id[36] params...
//! c       producer   request_id[36]                    request accepted
//! d       consumer   status[1] request_id[36]          '1' proceed, '0' discarded
//! e       producer   status[1] request_id[36] result... '0' ok, '1' error, other = timeout
//! f       producer   request_id[36]                    result ack confirmed
//! g       consumer   request_id[36]                    response ack
//! h       core       stop ack (ignored)
//! ```
//!
//! Frames are validated by length before any field is read; a frame that does
//! not match its layout is a protocol error and is never partially applied.

use crate::error::{OrigamiError, Result};

/// Prefix shared by every channel name.
pub const CHANNEL_PREFIX: &str = "origami.";

/// Width of a request or node id (hyphenated UUID).
pub const ID_LEN: usize = 36;

/// One step of a handshake, identified on the wire by a single letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// `a`: server confirmed a heartbeat.
    HeartbeatAck,
    /// `b`: a request submitted to one of this node's channels.
    Submit,
    /// `c`: the server accepted a request this node produced.
    Accepted,
    /// `d`: the server confirmed or discarded a request this node accepted.
    AcceptDecision,
    /// `e`: result of a request this node produced.
    Result,
    /// `f`: the server confirmed this node's result ack.
    ResultAckConfirmed,
    /// `g`: the server confirmed a result this node sent.
    ResponseAck,
    /// `h`: the server confirmed this node's stop broadcast.
    StopAck,
}

impl Phase {
    /// Every phase, in letter order.
    pub const ALL: [Phase; 8] = [
        Phase::HeartbeatAck,
        Phase::Submit,
        Phase::Accepted,
        Phase::AcceptDecision,
        Phase::Result,
        Phase::ResultAckConfirmed,
        Phase::ResponseAck,
        Phase::StopAck,
    ];

    /// Wire letter for this phase.
    pub const fn letter(self) -> char {
        match self {
            Phase::HeartbeatAck => 'a',
            Phase::Submit => 'b',
            Phase::Accepted => 'c',
            Phase::AcceptDecision => 'd',
            Phase::Result => 'e',
            Phase::ResultAckConfirmed => 'f',
            Phase::ResponseAck => 'g',
            Phase::StopAck => 'h',
        }
    }

    /// Phase for a wire letter.
    pub fn from_letter(letter: char) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.letter() == letter)
    }

    /// Channel name for this phase on the given node.
    ///
    /// For [`Phase::Submit`] this is only the prefix; use [`submit_channel`].
    pub fn channel(self, node_id: &str) -> String {
        let mut name = String::with_capacity(CHANNEL_PREFIX.len() + 1 + node_id.len());
        name.push_str(CHANNEL_PREFIX);
        name.push(self.letter());
        name.push_str(node_id);
        name
    }
}

/// Channel on which `node_id` receives requests for the logical `channel`.
pub fn submit_channel(node_id: &str, channel: &str) -> String {
    let mut name = Phase::Submit.channel(node_id);
    name.push_str(channel);
    name
}

fn utf8(payload: &[u8]) -> Result<&str> {
    std::str::from_utf8(payload)
        .map_err(|_| OrigamiError::Protocol("frame is not valid UTF-8".into()))
}

fn id_at<'a>(text: &'a str, start: usize, frame: &str) -> Result<&'a str> {
    text.get(start..start + ID_LEN)
        .filter(|id| id.is_ascii())
        .ok_or_else(|| OrigamiError::Protocol(format!("{} frame has a malformed id", frame)))
}

fn check_len(text: &str, exact: Option<usize>, min: usize, frame: &str) -> Result<()> {
    let ok = match exact {
        Some(n) => text.len() == n,
        None => text.len() >= min,
    };
    if ok {
        Ok(())
    } else {
        Err(OrigamiError::Protocol(format!(
            "{} frame has invalid length {}",
            frame,
            text.len()
        )))
    }
}

/// `b`: inbound request for a registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitFrame<'a> {
    pub request_id: &'a str,
    pub sender_id: &'a str,
    /// Serialized parameters (JSON).
    pub params: &'a str,
}

impl<'a> SubmitFrame<'a> {
    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        let text = utf8(payload)?;
        check_len(text, None, 2 * ID_LEN, "submit")?;

        Ok(Self {
            request_id: id_at(text, 0, "submit")?,
            sender_id: id_at(text, ID_LEN, "submit")?,
            params: &text[2 * ID_LEN..],
        })
    }

    pub fn encode(&self) -> String {
        [self.request_id, self.sender_id, self.params].concat()
    }
}

/// `c`, `f`, `g`: a bare request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdFrame<'a> {
    pub request_id: &'a str,
}

impl<'a> IdFrame<'a> {
    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        let text = utf8(payload)?;
        check_len(text, Some(ID_LEN), ID_LEN, "id")?;

        Ok(Self {
            request_id: id_at(text, 0, "id")?,
        })
    }

    pub fn encode(&self) -> String {
        self.request_id.to_string()
    }
}

/// `d`: whether an accepted request should be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptDecisionFrame<'a> {
    /// `false` when the transport discarded the request.
    pub proceed: bool,
    pub request_id: &'a str,
}

impl<'a> AcceptDecisionFrame<'a> {
    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        let text = utf8(payload)?;
        check_len(text, Some(1 + ID_LEN), 1 + ID_LEN, "accept decision")?;

        let proceed = match text.as_bytes()[0] {
            b'1' => true,
            b'0' => false,
            other => {
                return Err(OrigamiError::Protocol(format!(
                    "accept decision frame has unknown status 0x{:02x}",
                    other
                )))
            }
        };

        Ok(Self {
            proceed,
            request_id: id_at(text, 1, "accept decision")?,
        })
    }

    pub fn encode(&self) -> String {
        let flag = if self.proceed { "1" } else { "0" };
        [flag, self.request_id].concat()
    }
}

/// Outcome carried by a result frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// Handler succeeded; payload is its serialized return value.
    Ok,
    /// Handler failed; payload is a serialized error record.
    Failed,
    /// The server gave up waiting for a consumer; payload is meaningless.
    TimedOut,
}

impl ResultStatus {
    fn from_byte(b: u8) -> Self {
        match b {
            b'0' => ResultStatus::Ok,
            b'1' => ResultStatus::Failed,
            _ => ResultStatus::TimedOut,
        }
    }

    fn as_flag(self) -> &'static str {
        match self {
            ResultStatus::Ok => "0",
            ResultStatus::Failed => "1",
            ResultStatus::TimedOut => "2",
        }
    }
}

/// `e`: result of a produced request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultFrame<'a> {
    pub status: ResultStatus,
    pub request_id: &'a str,
    pub payload: &'a str,
}

impl<'a> ResultFrame<'a> {
    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        let text = utf8(payload)?;
        check_len(text, None, 1 + ID_LEN, "result")?;

        Ok(Self {
            status: ResultStatus::from_byte(text.as_bytes()[0]),
            request_id: id_at(text, 1, "result")?,
            payload: &text[1 + ID_LEN..],
        })
    }

    pub fn encode(&self) -> String {
        [self.status.as_flag(), self.request_id, self.payload].concat()
    }
}
