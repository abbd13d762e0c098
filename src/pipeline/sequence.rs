//! Capture sequence state machine for both roles.
//!
//! Initiator: stop stream, reconfigure, drain, handshake with the peer,
//! schedule, capture, restore. Responder: the same minus the handshake, split
//! across `prepare_responder` (on the HTTP request) and `run_staged` (on START).

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::driver::drain_frames;
use crate::capture::storage::TimestampSequence;
use crate::capture::{CameraDriver, FrameLease, FrameSize, FrameStore, PixelFormat, SharedCamera};
use crate::clock::{deadline_after, sleep_until, Clock};
use crate::error::{CameraError, CaptureError, PeerError};
use crate::http::client::PeerClient;
use crate::pipeline::request::CaptureRequest;
use crate::pipeline::state::PeerCaptureState;
use crate::stream::StreamControl;
use crate::sync::{self, StagedStart, StartSchedule, SyncMetrics};
use crate::{Config, SequenceConfig, SyncConfig};

/// Where the capture pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    StreamStopping,
    CameraReconfiguring,
    FrameDraining,
    PeerHandshake,
    /// Responder only: configured and waiting for START.
    Staged,
    Scheduling,
    Capturing,
    CameraRestoring,
    /// Last sequence failed; cleared when the next one starts.
    Aborted,
}

impl Phase {
    /// Whether a sequence currently owns the camera.
    pub fn is_active(self) -> bool {
        !matches!(self, Phase::Idle | Phase::Aborted | Phase::Staged)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of a completed sequence. Frames that failed are counted, not fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub session: String,
    pub requested: u32,
    pub written: Vec<PathBuf>,
    pub failed: u32,
    /// Started on a schedule agreed with the peer rather than solo.
    pub synced: bool,
    /// Driver hand-over time of the first frame written.
    pub first_frame_at: Option<Instant>,
}

/// The initiator's view of its peer.
#[derive(Debug, Clone)]
pub struct PeerLink {
    /// `host:port` of the peer command server.
    pub udp_addr: String,
    /// Used to ask the peer to stage; `None` if the peer is armed another way.
    pub client: Option<PeerClient>,
}

/// Runs capture sequences against one camera. Only this type reconfigures it.
pub struct Sequencer {
    camera: SharedCamera,
    stream: StreamControl,
    store: FrameStore,
    clock: Clock,
    sequence: SequenceConfig,
    sync: SyncConfig,
    /// Streaming configuration restored after every sequence.
    streaming: (PixelFormat, FrameSize),
    peer: Option<PeerLink>,
    /// Runtime for peer HTTP calls that overlap blocking camera work.
    io: Handle,
    phase: watch::Sender<Phase>,
}

type CameraGuard<'a> = tokio::sync::MutexGuard<'a, Box<dyn CameraDriver>>;

impl Sequencer {
    pub fn new(
        camera: SharedCamera,
        stream: StreamControl,
        store: FrameStore,
        clock: Clock,
        config: &Config,
        io: Handle,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            camera,
            stream,
            store,
            clock,
            sequence: config.sequence.clone(),
            sync: config.sync.clone(),
            streaming: (config.camera.pixel_format, config.camera.frame_size),
            peer: None,
            io,
            phase,
        }
    }

    pub fn with_peer(mut self, peer: PeerLink) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn phases(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: Phase) {
        debug!("Phase -> {}", phase);
        self.phase.send_replace(phase);
    }

    fn outcome(&self, result: Result<CaptureReport, CaptureError>) -> Result<CaptureReport, CaptureError> {
        let label = match &result {
            Ok(report) => {
                self.set_phase(Phase::Idle);
                metrics::counter!("syncam_frames_written_total").increment(report.written.len() as u64);
                metrics::counter!("syncam_frames_failed_total").increment(report.failed as u64);
                "ok"
            }
            Err(e) => {
                self.set_phase(Phase::Aborted);
                error!("Capture sequence aborted: {}", e);
                "aborted"
            }
        };
        metrics::counter!("syncam_sequences_total", "outcome" => label).increment(1);
        result
    }

    /// Full initiator sequence. Returns once the frames are on disk or the
    /// sequence definitively failed.
    #[instrument(skip(self, request), fields(session = %request.session, frames = request.frame_count))]
    pub async fn run_initiator(&self, request: CaptureRequest) -> Result<CaptureReport, CaptureError> {
        let result = self.initiator_sequence(&request).await;
        self.outcome(result)
    }

    async fn initiator_sequence(&self, request: &CaptureRequest) -> Result<CaptureReport, CaptureError> {
        self.set_phase(Phase::StreamStopping);
        self.stream.stop_and_wait(self.sequence.stream_stop_timeout()).await;
        let prepare = self.launch_prepare(request);

        let mut camera = self.camera.lock().await;
        if let Err(e) = self.reconfigure(&mut camera, request) {
            self.restore(&mut camera);
            return Err(CaptureError::CameraInit(e));
        }

        let margin_us = sync::safety_margin_us(request.start_hint_us, self.sync.safety_margin_us());
        let deadline = match self.handshake(prepare, margin_us).await {
            Ok(deadline) => deadline,
            Err(e) => {
                self.restore(&mut camera);
                return Err(e);
            }
        };

        self.set_phase(Phase::Scheduling);
        sleep_until(deadline.instant).await;
        let report = self.capture_frames(&mut camera, request, deadline.synced);
        self.restore(&mut camera);
        Ok(report)
    }

    fn launch_prepare(&self, request: &CaptureRequest) -> Option<JoinHandle<Result<(), PeerError>>> {
        let client = self.peer.as_ref()?.client.clone()?;
        let params = request.to_params();
        Some(self.io.spawn(async move { client.prepare(&params).await }))
    }

    /// Peer handshake, clock estimate and START. Yields the local deadline for
    /// the first frame; solo deadlines are anchored at "now".
    async fn handshake(
        &self,
        prepare: Option<JoinHandle<Result<(), PeerError>>>,
        margin_us: i64,
    ) -> Result<Deadline, CaptureError> {
        let Some(peer) = &self.peer else {
            return Ok(Deadline::solo(margin_us));
        };
        self.set_phase(Phase::PeerHandshake);

        if let Some(prepare) = prepare {
            match prepare.await {
                Ok(Ok(())) => debug!("Peer prepare completed"),
                Ok(Err(e)) => warn!("Peer prepare failed: {}", e),
                Err(e) => warn!("Peer prepare task failed: {}", e),
            }
        }

        let ready = sync::wait_ready(
            &peer.udp_addr,
            self.sync.ready_timeout(),
            self.sync.ready_poll(),
            self.sync.query_timeout(),
        )
        .await;
        if let Err(e) = ready {
            return self.go_solo(CaptureError::PeerNotReady(e), margin_us);
        }

        let metrics = match sync::measure(
            &peer.udp_addr,
            &self.clock,
            self.sync.ping_count,
            self.sync.query_timeout(),
        )
        .await
        {
            Ok(metrics) => metrics,
            Err(e) => return self.go_solo(CaptureError::SyncFailed(e), margin_us),
        };

        self.set_phase(Phase::Scheduling);
        let schedule = StartSchedule::compute(margin_us, &metrics);
        info!(
            "Start schedule: local +{}us, peer +{}us",
            schedule.initiator_delay_us, schedule.responder_delay_us
        );
        match sync::start_with_retry(
            &peer.udp_addr,
            schedule.responder_delay_us,
            self.sync.start_retries,
            self.sync.start_retry_delay(),
            self.sync.query_timeout(),
        )
        .await
        {
            Ok(anchor) => Ok(Deadline {
                instant: deadline_after(anchor, schedule.initiator_delay_us),
                synced: true,
            }),
            Err(e) => self.go_solo(CaptureError::PeerStartFailed(e), margin_us),
        }
    }

    fn go_solo(&self, cause: CaptureError, margin_us: i64) -> Result<Deadline, CaptureError> {
        if !self.sync.allow_peer_missing {
            return Err(cause);
        }
        let reason = std::error::Error::source(&cause).map(ToString::to_string);
        warn!(
            "{}: {}, continuing without peer",
            cause,
            reason.unwrap_or_default()
        );
        let solo = SyncMetrics::default();
        Ok(Deadline::solo(StartSchedule::compute(margin_us, &solo).initiator_delay_us))
    }

    /// Responder half one: reconfigure and arm `request` for the next START.
    #[instrument(skip(self, request, state), fields(session = %request.session))]
    pub async fn prepare_responder(
        &self,
        request: CaptureRequest,
        state: &PeerCaptureState,
    ) -> Result<(), CaptureError> {
        if !state.is_idle() {
            return Err(CaptureError::Busy);
        }
        self.set_phase(Phase::StreamStopping);
        self.stream.stop_and_wait(self.sequence.stream_stop_timeout()).await;

        let mut camera = self.camera.lock().await;
        if let Err(e) = self.reconfigure(&mut camera, &request) {
            self.restore(&mut camera);
            self.set_phase(Phase::Aborted);
            return Err(CaptureError::PrepareFailed(e));
        }
        if let Err(e) = state.stage(request) {
            self.restore(&mut camera);
            self.set_phase(Phase::Idle);
            return Err(e);
        }
        self.set_phase(Phase::Staged);
        info!("Capture staged, waiting for START");
        Ok(())
    }

    /// Responder half two: wait for the agreed deadline and capture.
    ///
    /// The deadline is re-read from `state` after each wait, since a repeated
    /// START may have moved it.
    #[instrument(skip(self, start, state), fields(session = %start.request.session))]
    pub async fn run_staged(
        &self,
        start: StagedStart,
        state: &PeerCaptureState,
    ) -> Result<CaptureReport, CaptureError> {
        self.set_phase(Phase::Scheduling);
        let mut deadline = start.deadline;
        loop {
            sleep_until(deadline).await;
            match state.settle_start(Instant::now()) {
                Some(later) => {
                    info!(
                        "START repeated, deadline moved by {:?}",
                        later.saturating_duration_since(deadline)
                    );
                    deadline = later;
                }
                None => break,
            }
        }
        let mut camera = self.camera.lock().await;
        let report = self.capture_frames(&mut camera, &start.request, true);
        self.restore(&mut camera);
        self.outcome(Ok(report))
    }

    /// Put the camera back after a staged capture that never got its START.
    pub async fn abandon_staged(&self, request: &CaptureRequest) {
        warn!("No START for staged session {}, restoring camera", request.session);
        let mut camera = self.camera.lock().await;
        self.restore(&mut camera);
        self.set_phase(Phase::Idle);
    }

    fn reconfigure(
        &self,
        camera: &mut CameraGuard<'_>,
        request: &CaptureRequest,
    ) -> Result<(), CameraError> {
        self.set_phase(Phase::CameraReconfiguring);
        camera.deinit();
        camera.reinit(request.pixel_format, request.frame_size)?;

        self.set_phase(Phase::FrameDraining);
        let drained = drain_frames(&mut ***camera, self.sequence.drop_frames);
        debug!("Drained {}/{} frames", drained, self.sequence.drop_frames);
        Ok(())
    }

    fn capture_frames(
        &self,
        camera: &mut CameraGuard<'_>,
        request: &CaptureRequest,
        synced: bool,
    ) -> CaptureReport {
        self.set_phase(Phase::Capturing);
        let mut stamps = TimestampSequence::default();
        let mut written = Vec::new();
        let mut first_frame_at = None;
        let mut failed = 0;

        for index in 0..request.frame_count {
            let lease = match FrameLease::acquire(&mut ***camera) {
                Ok(lease) => lease,
                Err(e) => {
                    warn!("Frame {} acquisition failed: {}", index, e);
                    failed += 1;
                    continue;
                }
            };
            let previous = stamps.last();
            let ts = stamps.next(self.clock.now_ms());
            match self.store.write_frame(&request.session, ts, &lease) {
                Ok(path) => {
                    info!(
                        "Frame {} ({} bytes) -> {} (+{}ms)",
                        index,
                        lease.len(),
                        path.display(),
                        previous.map_or(0, |p| ts - p)
                    );
                    written.push(path);
                    first_frame_at.get_or_insert(lease.timestamp);
                }
                Err(e) => {
                    warn!("Frame {} write failed: {}", index, e);
                    failed += 1;
                }
            }
        }

        CaptureReport {
            session: request.session.clone(),
            requested: request.frame_count,
            written,
            failed,
            synced,
            first_frame_at,
        }
    }

    /// Back to the streaming configuration. Failure is logged only.
    fn restore(&self, camera: &mut CameraGuard<'_>) {
        self.set_phase(Phase::CameraRestoring);
        let (format, size) = self.streaming;
        camera.deinit();
        match camera.reinit(format, size) {
            Ok(()) => debug!("Camera restored to {} {}", format, size),
            Err(e) => error!("Camera restore failed: {}", e),
        }
    }
}

struct Deadline {
    instant: Instant,
    synced: bool,
}

impl Deadline {
    fn solo(delay_us: i64) -> Self {
        Self {
            instant: deadline_after(Instant::now(), delay_us),
            synced: false,
        }
    }
}
