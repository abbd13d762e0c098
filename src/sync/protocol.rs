//! Text wire format spoken between initiator and responder over UDP.
//!
//! | payload              | reply                      |
//! |----------------------|----------------------------|
//! | `READY`              | `OK` / `NO`                |
//! | decimal µs timestamp | responder's µs timestamp   |
//! | `START <delay_us>`   | `ACK` / `NO`               |
//! | anything else        | `ERR`                      |

use std::fmt;

pub const READY: &str = "READY";
pub const START: &str = "START";

/// Largest datagram either side reads.
pub const MAX_DATAGRAM: usize = 128;

/// A request received by the peer command server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Ready,
    /// Clock probe carrying the initiator's send timestamp.
    Ping(i64),
    /// Start the staged capture after this many microseconds.
    Start(u64),
    /// `START` with a missing, malformed or negative delay.
    InvalidStart,
    Unknown,
}

impl Request {
    pub fn parse(payload: &str) -> Self {
        let payload = payload.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if payload.starts_with(READY) {
            return Request::Ready;
        }
        if let Some(rest) = payload.strip_prefix(START) {
            return match rest.trim().parse::<i64>() {
                Ok(delay) if delay >= 0 => Request::Start(delay as u64),
                _ => Request::InvalidStart,
            };
        }
        match payload.parse::<i64>() {
            Ok(ts) => Request::Ping(ts),
            Err(_) => Request::Unknown,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Ready => f.write_str(READY),
            Request::Ping(ts) => write!(f, "{}", ts),
            Request::Start(delay) => write!(f, "{} {}", START, delay),
            Request::InvalidStart => f.write_str(START),
            Request::Unknown => f.write_str("?"),
        }
    }
}

/// A reply sent by the peer command server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Ready and armed.
    Ok,
    /// Not ready, or start refused.
    No,
    /// Start accepted.
    Ack,
    Err,
    /// Responder clock reading, in reply to a ping.
    Timestamp(i64),
}

impl Reply {
    pub fn parse(payload: &str) -> Option<Self> {
        let payload = payload.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if payload.starts_with("ACK") {
            Some(Reply::Ack)
        } else if payload.starts_with("OK") {
            Some(Reply::Ok)
        } else if payload.starts_with("NO") {
            Some(Reply::No)
        } else if payload.starts_with("ERR") {
            Some(Reply::Err)
        } else {
            payload.parse::<i64>().ok().map(Reply::Timestamp)
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => f.write_str("OK"),
            Reply::No => f.write_str("NO"),
            Reply::Ack => f.write_str("ACK"),
            Reply::Err => f.write_str("ERR"),
            Reply::Timestamp(ts) => write!(f, "{}", ts),
        }
    }
}
