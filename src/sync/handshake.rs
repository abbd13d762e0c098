//! Readiness polling: wait until the responder is idle and has a capture staged.

use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::error::{SyncError, TransportError};
use crate::sync::protocol::{Reply, Request};
use crate::sync::retry::RetryPolicy;
use crate::sync::transport::send_and_receive;

/// Single `READY` query.
pub async fn ready_check(peer: &str, limit: Duration) -> Result<(), SyncError> {
    let reply = send_and_receive(peer, &Request::Ready.to_string(), limit).await?;
    match Reply::parse(&reply) {
        Some(Reply::Ok) => Ok(()),
        Some(Reply::No) => Err(SyncError::Rejected("peer not armed".into())),
        _ => Err(TransportError::Malformed(reply).into()),
    }
}

/// Poll `peer` every `poll` until it reports ready or `timeout` of wall time
/// has passed. Each query is bounded by `query_timeout` on its own.
#[instrument]
pub async fn wait_ready(
    peer: &str,
    timeout: Duration,
    poll: Duration,
    query_timeout: Duration,
) -> Result<(), SyncError> {
    let started = Instant::now();
    let policy = RetryPolicy::within(timeout, poll, query_timeout);
    let result = policy
        .run(|attempt, limit| async move {
            let result = ready_check(peer, limit).await;
            if let Err(e) = &result {
                debug!("Ready check {} failed: {}", attempt, e);
            }
            result
        })
        .await;

    match result {
        Ok(()) => {
            debug!("Peer ready after {:?}", started.elapsed());
            Ok(())
        }
        Err(e) => {
            warn!("Peer not ready after {:?}: {}", started.elapsed(), e);
            Err(SyncError::Timeout(timeout))
        }
    }
}
