use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use serde::Serialize;
use tracing::{info, warn};

use super::AppState;
use crate::error::CaptureError;
use crate::pipeline::request::{CaptureParams, CaptureRequest};
use crate::pipeline::sequence::Phase;
use crate::stream;
use crate::Role;

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        let status = if self.is_busy() {
            StatusCode::CONFLICT
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, self.to_string()).into_response()
    }
}

/// Initiator: run a whole sequence. Responder: stage one for the next START.
///
/// Parameters come from the query string, the urlencoded body, or both; body
/// fields win. A POST without a form body is fine.
pub async fn capture(
    State(state): State<AppState>,
    Query(query): Query<CaptureParams>,
    body: Option<Form<CaptureParams>>,
) -> Result<&'static str, CaptureError> {
    let params = match body {
        Some(Form(body)) => body.or(query),
        None => query,
    };
    let request = CaptureRequest::from_params(&params, &state.defaults);
    info!(
        "Capture request: session={} frames={} size={} format={}",
        request.session, request.frame_count, request.frame_size, request.pixel_format
    );

    match state.role {
        Role::Initiator => {
            let report = state.queue.capture(request).await?;
            info!(
                "Session {} done: {}/{} frames written, synced={}",
                report.session,
                report.written.len(),
                report.requested,
                report.synced
            );
        }
        Role::Responder => {
            if !state.peer_state.is_idle() {
                return Err(CaptureError::Busy);
            }
            state.queue.prepare(request).await?;
        }
    }
    Ok("OK")
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub role: Role,
    pub device_id: u32,
    pub stream_enabled: bool,
    pub stream_active: bool,
    pub capture_ready: bool,
    pub capture_active: bool,
    pub phase: Phase,
    pub uptime_ms: i64,
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let stream = state.stream.status();
    let flags = state.peer_state.snapshot();
    let phase = *state.phase.borrow();
    Json(StatusResponse {
        role: state.role,
        device_id: state.device_id,
        stream_enabled: stream.enabled,
        stream_active: stream.active,
        capture_ready: flags.ready,
        capture_active: flags.in_progress || state.queue.is_busy() || phase.is_active(),
        phase,
        uptime_ms: state.clock.now_ms(),
    })
}

pub async fn stream_start(State(state): State<AppState>) -> &'static str {
    state.stream.enable();
    "OK"
}

pub async fn stream_stop(State(state): State<AppState>) -> &'static str {
    state.stream.disable();
    "OK"
}

/// MJPEG live view, one client at a time.
pub async fn live_stream(State(state): State<AppState>) -> Response {
    let status = state.stream.status();
    if !status.enabled {
        return (StatusCode::CONFLICT, "stream disabled").into_response();
    }
    let Some(session) = state.stream.try_begin() else {
        warn!("Refusing second live view client");
        return (StatusCode::CONFLICT, "stream already active").into_response();
    };

    let body = Body::from_stream(stream::mjpeg_stream(state.camera.clone(), session));
    ([(header::CONTENT_TYPE, stream::CONTENT_TYPE)], body).into_response()
}
