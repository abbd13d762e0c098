//! Responder's UDP command listener.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::{debug, error, info, warn};

use crate::clock::{deadline_after, Clock};
use crate::pipeline::request::CaptureRequest;
use crate::pipeline::state::{PeerCaptureState, StartDecision};
use crate::sync::protocol::{Reply, Request, MAX_DATAGRAM};

/// Capture handed to the worker after a START was acknowledged.
#[derive(Debug, Clone)]
pub struct StagedStart {
    pub request: CaptureRequest,
    /// Receipt of START plus the requested delay. A repeated START can move it
    /// later, see [`PeerCaptureState::settle_start`].
    pub deadline: Instant,
}

/// Answers `READY`, pings and `START` from the initiator.
///
/// Never waits on capture: an accepted START is acknowledged first and then
/// handed to the capture worker over `starts`.
pub struct PeerCommandServer {
    socket: UdpSocket,
    state: PeerCaptureState,
    clock: Clock,
    starts: flume::Sender<StagedStart>,
    duplicate_window: Duration,
}

impl PeerCommandServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        state: PeerCaptureState,
        clock: Clock,
        starts: flume::Sender<StagedStart>,
        duplicate_window: Duration,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Peer command server listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            state,
            clock,
            starts,
            duplicate_window,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until the socket fails.
    pub async fn run(self) -> io::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    // ICMP unreachable from an earlier reply on some platforms.
                    debug!("Ignoring receive error: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let received_at = Instant::now();
            let payload = String::from_utf8_lossy(&buf[..len]);
            let request = Request::parse(&payload);

            let (reply, dispatch) = self.handle(request, received_at);
            if let Err(e) = self.socket.send_to(reply.to_string().as_bytes(), from).await {
                warn!("Reply to {} failed: {}", from, e);
            }

            if let Some(start) = dispatch {
                self.dispatch(start);
            }
        }
    }

    fn handle(&self, request: Request, received_at: Instant) -> (Reply, Option<StagedStart>) {
        match request {
            Request::Ready => {
                let snap = self.state.snapshot();
                let reply = if snap.ready && !snap.in_progress {
                    Reply::Ok
                } else {
                    Reply::No
                };
                debug!("READY -> {}", reply);
                (reply, None)
            }
            Request::Ping(_) => (Reply::Timestamp(self.clock.now_us()), None),
            Request::Start(delay_us) => {
                match self
                    .state
                    .try_begin(delay_us, received_at, self.duplicate_window)
                {
                    StartDecision::Accepted(request) => {
                        info!("START accepted, capturing in {}us", delay_us);
                        let deadline = deadline_after(received_at, delay_us as i64);
                        (Reply::Ack, Some(StagedStart { request, deadline }))
                    }
                    StartDecision::Duplicate => {
                        info!("Repeated START {}us acknowledged, deadline re-anchored", delay_us);
                        (Reply::Ack, None)
                    }
                    StartDecision::Rejected => {
                        warn!("START refused: nothing staged or capture running");
                        (Reply::No, None)
                    }
                }
            }
            Request::InvalidStart => {
                warn!("START with invalid delay refused");
                (Reply::No, None)
            }
            Request::Unknown => (Reply::Err, None),
        }
    }

    fn dispatch(&self, start: StagedStart) {
        if let Err(e) = self.starts.try_send(start) {
            error!("Capture worker unavailable, dropping START: {}", e);
            self.state.finish();
        }
    }
}
