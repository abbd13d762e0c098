//! Peer coordination over UDP: wire format, clock estimate, readiness,
//! scheduled start and the responder's command server.

pub mod estimator;
pub mod handshake;
pub mod protocol;
pub mod retry;
pub mod schedule;
pub mod server;
pub mod transport;

pub use estimator::{measure, SyncMetrics};
pub use handshake::wait_ready;
pub use retry::RetryPolicy;
pub use schedule::{safety_margin_us, start_with_retry, StartSchedule};
pub use server::{PeerCommandServer, StagedStart};
pub use transport::send_and_receive;
