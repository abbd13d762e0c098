//! Error types shared across the sync protocol, camera and capture pipeline.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure of a single UDP request/response exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer did not answer in time. Callers read this as "unreachable or busy".
    #[error("no reply from peer within {0:?}")]
    Timeout(Duration),

    /// The peer address could not be resolved.
    #[error("failed to resolve peer address {0}")]
    Resolve(String),

    /// The peer answered with something outside the protocol vocabulary.
    #[error("unexpected reply {0:?}")]
    Malformed(String),

    /// Local socket or network stack failure.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Failure of a peer coordination step (handshake, clock estimate, start command).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("peer did not become ready within {0:?}")]
    Timeout(Duration),

    /// The peer answered but declined.
    #[error("peer rejected request: {0}")]
    Rejected(String),

    #[error("no usable clock samples")]
    NoSamples,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure of the HTTP prepare call to the peer.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The peer answered with a non-success status and this short reason.
    #[error("peer refused with {status}: {reason}")]
    Refused { status: u16, reason: String },
}

/// Camera driver failure.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera init failed: {0}")]
    Init(String),

    #[error("frame acquisition failed: {0}")]
    Acquire(String),

    #[error("camera not initialized")]
    NotInitialized,

    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(crate::capture::PixelFormat),
}

/// Outcome of a capture sequence as seen by the HTTP caller.
///
/// The `Display` strings are the short messages returned in HTTP error bodies.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera init failed")]
    CameraInit(#[source] CameraError),

    #[error("slave not ready")]
    PeerNotReady(#[source] SyncError),

    #[error("udp sync failed")]
    SyncFailed(#[source] SyncError),

    #[error("slave start failed")]
    PeerStartFailed(#[source] SyncError),

    #[error("capture busy")]
    Busy,

    #[error("capture prep failed")]
    PrepareFailed(#[source] CameraError),

    #[error("capture task not ready")]
    WorkerUnavailable,
}

impl CaptureError {
    /// Whether the request was turned away because another sequence owns the camera.
    pub fn is_busy(&self) -> bool {
        matches!(self, CaptureError::Busy)
    }
}

/// Configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
