//! Dedicated capture thread and the queue that feeds it.
//!
//! HTTP handlers submit jobs through [`CaptureQueue`]; the UDP command server
//! hands over acknowledged STARTs. Both land on one thread that owns camera
//! reconfiguration, so sequences never overlap.

use std::future::pending;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

use crate::error::CaptureError;
use crate::pipeline::request::CaptureRequest;
use crate::pipeline::sequence::{CaptureReport, Sequencer};
use crate::pipeline::state::PeerCaptureState;
use crate::sync::StagedStart;

/// Jobs waiting for the capture thread, including the one in flight.
pub const QUEUE_DEPTH: usize = 2;

pub enum Job {
    /// Initiator: run a full sequence.
    Capture {
        request: CaptureRequest,
        reply: oneshot::Sender<Result<CaptureReport, CaptureError>>,
        permit: OwnedSemaphorePermit,
    },
    /// Responder: reconfigure and stage.
    Prepare {
        request: CaptureRequest,
        reply: oneshot::Sender<Result<(), CaptureError>>,
        permit: OwnedSemaphorePermit,
    },
}

/// Submission side. Cheap to clone; one request in flight at a time, a second
/// is turned away with [`CaptureError::Busy`] without waiting.
#[derive(Debug, Clone)]
pub struct CaptureQueue {
    jobs: flume::Sender<Job>,
    permits: Arc<Semaphore>,
}

impl CaptureQueue {
    pub fn new() -> (Self, flume::Receiver<Job>) {
        let (jobs, rx) = flume::bounded(QUEUE_DEPTH);
        let queue = Self {
            jobs,
            permits: Arc::new(Semaphore::new(1)),
        };
        (queue, rx)
    }

    fn permit(&self) -> Result<OwnedSemaphorePermit, CaptureError> {
        self.permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| CaptureError::Busy)
    }

    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }

    pub async fn capture(&self, request: CaptureRequest) -> Result<CaptureReport, CaptureError> {
        let permit = self.permit()?;
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send_async(Job::Capture {
                request,
                reply,
                permit,
            })
            .await
            .map_err(|_| CaptureError::WorkerUnavailable)?;
        rx.await.map_err(|_| CaptureError::WorkerUnavailable)?
    }

    pub async fn prepare(&self, request: CaptureRequest) -> Result<(), CaptureError> {
        let permit = self.permit()?;
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send_async(Job::Prepare {
                request,
                reply,
                permit,
            })
            .await
            .map_err(|_| CaptureError::WorkerUnavailable)?;
        rx.await.map_err(|_| CaptureError::WorkerUnavailable)?
    }
}

/// Clears `in_progress` however the staged sequence ends.
struct InProgress<'a>(&'a PeerCaptureState);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

pub struct CaptureWorker {
    sequencer: Sequencer,
    jobs: flume::Receiver<Job>,
    state: PeerCaptureState,
    starts: flume::Receiver<StagedStart>,
    /// Kept so `starts` stays open when no command server runs.
    starts_tx: flume::Sender<StagedStart>,
    staged_timeout: Duration,
}

impl CaptureWorker {
    pub fn new(
        sequencer: Sequencer,
        jobs: flume::Receiver<Job>,
        state: PeerCaptureState,
        staged_timeout: Duration,
    ) -> Self {
        let (starts_tx, starts) = flume::bounded(1);
        Self {
            sequencer,
            jobs,
            state,
            starts,
            starts_tx,
            staged_timeout,
        }
    }

    /// Sender for the UDP command server's accepted STARTs.
    pub fn starts(&self) -> flume::Sender<StagedStart> {
        self.starts_tx.clone()
    }

    /// Serve until every [`CaptureQueue`] is dropped.
    pub async fn run(self) {
        info!("Capture worker running");
        loop {
            let expiry = self.state.staged_remaining(self.staged_timeout);
            tokio::select! {
                job = self.jobs.recv_async() => match job {
                    Ok(job) => self.handle(job).await,
                    Err(_) => break,
                },
                Ok(start) = self.starts.recv_async() => self.run_start(start).await,
                _ = expire_after(expiry) => {
                    if let Some(request) = self.state.abandon_if_stale(self.staged_timeout) {
                        self.sequencer.abandon_staged(&request).await;
                    }
                }
            }
        }
        info!("Capture worker stopped");
    }

    async fn handle(&self, job: Job) {
        match job {
            Job::Capture {
                request,
                reply,
                permit,
            } => {
                let result = self.sequencer.run_initiator(request).await;
                drop(permit);
                let _ = reply.send(result);
            }
            Job::Prepare {
                request,
                reply,
                permit,
            } => {
                let result = self.sequencer.prepare_responder(request, &self.state).await;
                drop(permit);
                let _ = reply.send(result);
            }
        }
    }

    async fn run_start(&self, start: StagedStart) {
        let _in_progress = InProgress(&self.state);
        if let Err(e) = self.sequencer.run_staged(start, &self.state).await {
            warn!("Staged capture failed: {}", e);
        }
    }

    /// Run the worker on its own thread with a single-threaded runtime,
    /// optionally pinned to `core`.
    pub fn spawn(self, core: Option<usize>) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                if let Some(core) = core {
                    pin_to_core(core);
                }
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Capture runtime failed to start: {}", e);
                        return;
                    }
                };
                runtime.block_on(self.run());
            })
    }
}

async fn expire_after(remaining: Option<Duration>) {
    match remaining {
        Some(remaining) => tokio::time::sleep(remaining).await,
        None => pending().await,
    }
}

fn pin_to_core(core: usize) {
    let target = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|id| id.id == core);
    match target {
        Some(id) if core_affinity::set_for_current(id) => info!("Capture thread pinned to core {}", core),
        _ => warn!("Could not pin capture thread to core {}", core),
    }
}
