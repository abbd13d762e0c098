//! HTTP surface: capture trigger, status, live view.
//!
//! - `GET|POST /api/capture` - run (initiator) or stage (responder) a capture
//! - `GET /api/status` - JSON status
//! - `GET|POST /api/stream/start`, `/api/stream/stop` - live view switch
//! - `GET /stream` - MJPEG live view

pub mod client;
pub mod handlers;

use std::io;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::capture::SharedCamera;
use crate::clock::Clock;
use crate::pipeline::request::RequestDefaults;
use crate::pipeline::sequence::Phase;
use crate::pipeline::state::PeerCaptureState;
use crate::pipeline::worker::CaptureQueue;
use crate::stream::StreamControl;
use crate::Role;

pub use client::PeerClient;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub role: Role,
    pub device_id: u32,
    pub queue: CaptureQueue,
    pub peer_state: PeerCaptureState,
    pub stream: StreamControl,
    pub camera: SharedCamera,
    pub phase: watch::Receiver<Phase>,
    pub clock: Clock,
    /// Size, format and frame cap applied to incoming requests.
    pub defaults: RequestDefaults,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/capture", get(handlers::capture).post(handlers::capture))
        .route("/api/status", get(handlers::status))
        .route(
            "/api/stream/start",
            get(handlers::stream_start).post(handlers::stream_start),
        )
        .route(
            "/api/stream/stop",
            get(handlers::stream_stop).post(handlers::stream_stop),
        )
        .route("/stream", get(handlers::live_stream))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    info!("HTTP server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
