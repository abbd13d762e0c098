//! Scheduled start: per-side delays and the `START` command.

use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use crate::error::{SyncError, TransportError};
use crate::sync::estimator::SyncMetrics;
use crate::sync::protocol::{Reply, Request};
use crate::sync::retry::RetryPolicy;
use crate::sync::transport::send_and_receive;

/// Delays, relative to the `START` exchange, after which each side begins its
/// first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartSchedule {
    /// Measured from the instant the acknowledged `START` was sent.
    pub initiator_delay_us: i64,
    /// Measured by the responder from receipt of `START`.
    pub responder_delay_us: i64,
}

impl StartSchedule {
    /// Responder waits the bare margin after receipt. The initiator adds one
    /// trip (so both count from the same physical instant) plus the clock
    /// disparity, floored at zero.
    pub fn compute(safety_margin_us: i64, metrics: &SyncMetrics) -> Self {
        let initiator = safety_margin_us + metrics.trip_time_us + metrics.cpu_disparity_us;
        Self {
            initiator_delay_us: initiator.max(0),
            responder_delay_us: safety_margin_us.max(0),
        }
    }
}

/// A caller-supplied positive hint overrides the configured margin.
pub fn safety_margin_us(hint_us: Option<i64>, default_us: i64) -> i64 {
    match hint_us {
        Some(hint) if hint > 0 => hint,
        _ => default_us,
    }
}

/// Send `START <delay_us>` until the peer acknowledges, at most `retries`
/// times, `retry_delay` apart. A `NO` ends the exchange immediately.
///
/// Returns the instant the acknowledged attempt was sent; the initiator's
/// deadline is anchored there.
#[instrument]
pub async fn start_with_retry(
    peer: &str,
    delay_us: i64,
    retries: u32,
    retry_delay: Duration,
    query_timeout: Duration,
) -> Result<Instant, SyncError> {
    let request = Request::Start(delay_us.max(0) as u64).to_string();
    let policy = RetryPolicy::attempts(retries.max(1), retry_delay, query_timeout);
    let request = request.as_str();

    let retryable = |e: &SyncError| !matches!(e, SyncError::Rejected(_));
    let result = policy
        .run_while(retryable, |attempt, limit| async move {
            let sent_at = Instant::now();
            let reply = match send_and_receive(peer, request, limit).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("START attempt {} failed: {}", attempt + 1, e);
                    return Err(e.into());
                }
            };
            match Reply::parse(&reply) {
                Some(Reply::Ack) => Ok(sent_at),
                Some(Reply::No) => {
                    warn!("START attempt {} refused", attempt + 1);
                    Err(SyncError::Rejected("start refused".into()))
                }
                _ => Err(TransportError::Malformed(reply).into()),
            }
        })
        .await;

    if result.is_ok() {
        info!("Peer acknowledged START {}us", delay_us);
    }
    result
}
