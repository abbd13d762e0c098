//! Clock-offset estimate between initiator and responder.
//!
//! A simplified NTP exchange: each ping carries the local send time, the peer
//! answers with its own clock, and the one-way delay is taken as half the round
//! trip. Forward and return paths are assumed symmetric.

use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::error::{SyncError, TransportError};
use crate::sync::protocol::{Reply, Request};
use crate::sync::retry::RetryPolicy;
use crate::sync::transport::send_and_receive;

/// Network delay and clock offset measured for one capture sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMetrics {
    /// One-way delay estimate, average RTT / 2.
    pub trip_time_us: i64,
    /// Positive when the initiator's clock reads ahead of the peer's.
    pub cpu_disparity_us: i64,
}

/// One successful ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingSample {
    /// Local clock when the ping was sent.
    pub sent_us: i64,
    /// Local clock when the reply arrived.
    pub received_us: i64,
    /// Peer clock carried in the reply.
    pub peer_us: i64,
}

impl PingSample {
    pub fn rtt_us(&self) -> i64 {
        self.received_us - self.sent_us
    }

    /// Local clock minus peer clock at the instant the peer answered.
    pub fn disparity_us(&self) -> i64 {
        let local_at_peer = self.sent_us + self.rtt_us() / 2;
        local_at_peer - self.peer_us
    }
}

impl SyncMetrics {
    /// Average over successful samples only. `None` if there are none.
    pub fn from_samples(samples: &[PingSample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as i64;
        let rtt_sum: i64 = samples.iter().map(PingSample::rtt_us).sum();
        let disparity_sum: i64 = samples.iter().map(PingSample::disparity_us).sum();
        Some(Self {
            trip_time_us: (rtt_sum / n) / 2,
            cpu_disparity_us: disparity_sum / n,
        })
    }
}

async fn ping(peer: &str, clock: &Clock, limit: Duration) -> Result<PingSample, TransportError> {
    let sent_us = clock.now_us();
    let reply = send_and_receive(peer, &Request::Ping(sent_us).to_string(), limit).await?;
    let received_us = clock.now_us();
    match Reply::parse(&reply) {
        Some(Reply::Timestamp(peer_us)) => Ok(PingSample {
            sent_us,
            received_us,
            peer_us,
        }),
        _ => {
            debug!("Discarding malformed ping reply {:?}", reply);
            Err(TransportError::Malformed(reply))
        }
    }
}

/// Ping `peer` `sample_count` times and aggregate the successful samples.
#[instrument(skip(clock))]
pub async fn measure(
    peer: &str,
    clock: &Clock,
    sample_count: u32,
    attempt_timeout: Duration,
) -> Result<SyncMetrics, SyncError> {
    let policy = RetryPolicy::attempts(sample_count, Duration::ZERO, attempt_timeout);
    let samples = policy
        .collect(|_, limit| ping(peer, clock, limit))
        .await;

    let metrics = SyncMetrics::from_samples(&samples).ok_or(SyncError::NoSamples)?;
    info!(
        "Clock estimate from {}/{} pings: trip={}us disparity={}us",
        samples.len(),
        sample_count,
        metrics.trip_time_us,
        metrics.cpu_disparity_us
    );
    metrics::histogram!("syncam_sync_trip_time_us").record(metrics.trip_time_us as f64);
    metrics::histogram!("syncam_sync_disparity_us").record(metrics.cpu_disparity_us as f64);
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    fn sample(sent_us: i64, rtt: i64, peer_us: i64) -> PingSample {
        PingSample {
            sent_us,
            received_us: sent_us + rtt,
            peer_us,
        }
    }

    #[test]
    fn averages_only_successful_samples() {
        // Three successes out of five attempts; the two timeouts never become samples.
        let samples = [
            sample(1_000, 100, 1_050),
            sample(2_000, 200, 2_100),
            sample(3_000, 300, 3_150),
        ];
        let m = SyncMetrics::from_samples(&samples).unwrap();
        assert_eq!(m.trip_time_us, 100);
        assert_eq!(m.cpu_disparity_us, 0);
    }

    #[test]
    fn disparity_sign_follows_initiator_clock() {
        // Peer clock is 5ms behind: initiator reads ahead, positive disparity.
        let ahead = sample(10_000, 400, 10_200 - 5_000);
        assert_eq!(ahead.disparity_us(), 5_000);
        let behind = sample(10_000, 400, 10_200 + 3_000);
        assert_eq!(behind.disparity_us(), -3_000);
    }

    #[test]
    fn no_samples_is_failure() {
        assert_eq!(SyncMetrics::from_samples(&[]), None);
    }

    /// Replies to pings with a clock offset by `offset_us`; drops every
    /// `drop_every`-th ping and answers one garbage reply.
    async fn fake_peer(offset_us: i64, drop_every: usize) -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        let clock = Clock::new();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let mut n = 0;
            loop {
                let Ok((_, from)) = socket.recv_from(&mut buf).await else { break };
                n += 1;
                if n % drop_every == 0 {
                    continue;
                }
                let reply = if n == 1 {
                    "bogus".to_string()
                } else {
                    (clock.now_us() - offset_us).to_string()
                };
                let _ = socket.send_to(reply.as_bytes(), from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn measure_skips_lost_and_malformed_pings() {
        let peer = fake_peer(0, 3).await;
        let clock = Clock::new();
        let m = measure(&peer, &clock, 5, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(m.trip_time_us >= 0);
        assert!(m.trip_time_us < 20_000);
    }

    #[tokio::test]
    async fn measure_fails_without_any_reply() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = silent.local_addr().unwrap().to_string();
        let clock = Clock::new();
        let err = measure(&peer, &clock, 3, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoSamples));
    }
}
