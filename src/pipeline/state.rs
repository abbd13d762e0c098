//! Responder-side capture flags shared by the HTTP prepare handler, the UDP
//! command server and the capture worker.
//!
//! `ready` and `in_progress` are never both set. The lock is held only for
//! field access.
//!
//! The accepted START's deadline lives here too. A retransmitted START (its
//! ACK was lost, so the initiator anchored on the retry) moves the deadline to
//! the retry's receipt until the capture side settles it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::clock::deadline_after;
use crate::error::CaptureError;
use crate::pipeline::request::CaptureRequest;

/// Point-in-time copy of the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateSnapshot {
    pub ready: bool,
    pub in_progress: bool,
}

/// Outcome of a `START` against the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartDecision {
    /// Staged capture taken; the caller owns it and must call
    /// [`PeerCaptureState::finish`] when the sequence returns.
    Accepted(CaptureRequest),
    /// Repeat of the START that is already running; its deadline now counts
    /// from this receipt.
    Duplicate,
    Rejected,
}

#[derive(Debug, Default)]
struct Inner {
    ready: bool,
    in_progress: bool,
    staged: Option<CaptureRequest>,
    staged_at: Option<Instant>,
    accepted: Option<AcceptedStart>,
}

/// The START that set `in_progress`.
#[derive(Debug, Clone, Copy)]
struct AcceptedStart {
    delay_us: u64,
    first_received: Instant,
    deadline: Instant,
    /// Capture has begun; the deadline can no longer move.
    settled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PeerCaptureState {
    inner: Arc<Mutex<Inner>>,
}

impl PeerCaptureState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.lock();
        StateSnapshot {
            ready: inner.ready,
            in_progress: inner.in_progress,
        }
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.lock();
        !inner.ready && !inner.in_progress
    }

    /// Arm `request` for the next START. Fails with `Busy` if something is
    /// already staged or running.
    pub fn stage(&self, request: CaptureRequest) -> Result<(), CaptureError> {
        let mut inner = self.lock();
        if inner.ready || inner.in_progress {
            return Err(CaptureError::Busy);
        }
        inner.staged = Some(request);
        inner.staged_at = Some(Instant::now());
        inner.ready = true;
        Ok(())
    }

    /// Atomically consume `ready` and set `in_progress`.
    ///
    /// A START while running with the same `delay_us`, received within
    /// `duplicate_window` of the accepted one and before capture settled, is a
    /// [`StartDecision::Duplicate`] and re-anchors the deadline.
    pub fn try_begin(
        &self,
        delay_us: u64,
        received_at: Instant,
        duplicate_window: Duration,
    ) -> StartDecision {
        let mut inner = self.lock();
        if inner.ready && !inner.in_progress {
            if let Some(request) = inner.staged.take() {
                inner.ready = false;
                inner.staged_at = None;
                inner.in_progress = true;
                inner.accepted = Some(AcceptedStart {
                    delay_us,
                    first_received: received_at,
                    deadline: deadline_after(received_at, delay_us as i64),
                    settled: false,
                });
                return StartDecision::Accepted(request);
            }
            inner.ready = false;
        }
        if !inner.in_progress {
            return StartDecision::Rejected;
        }
        match inner.accepted.as_mut() {
            Some(start)
                if !start.settled
                    && start.delay_us == delay_us
                    && received_at.saturating_duration_since(start.first_received)
                        <= duplicate_window =>
            {
                start.deadline = start
                    .deadline
                    .max(deadline_after(received_at, delay_us as i64));
                StartDecision::Duplicate
            }
            _ => StartDecision::Rejected,
        }
    }

    /// Deadline of the accepted START, if one is running.
    pub fn start_deadline(&self) -> Option<Instant> {
        self.lock().accepted.map(|start| start.deadline)
    }

    /// Called once the capture side has reached its deadline. Returns a later
    /// deadline if a repeated START moved it; otherwise pins the schedule so
    /// further repeats are refused, and returns `None`.
    pub fn settle_start(&self, now: Instant) -> Option<Instant> {
        let mut inner = self.lock();
        let start = inner.accepted.as_mut()?;
        if start.deadline > now {
            return Some(start.deadline);
        }
        start.settled = true;
        None
    }

    /// Clear `in_progress` once the sequence has returned, whatever its outcome.
    pub fn finish(&self) {
        let mut inner = self.lock();
        inner.in_progress = false;
        inner.accepted = None;
    }

    /// Drop a staged capture that has waited longer than `max_age` for its
    /// START. Returns the abandoned request so the caller can restore the camera.
    pub fn abandon_if_stale(&self, max_age: Duration) -> Option<CaptureRequest> {
        let mut inner = self.lock();
        let stale = inner.ready
            && !inner.in_progress
            && inner.staged_at.is_some_and(|at| at.elapsed() >= max_age);
        if !stale {
            return None;
        }
        inner.ready = false;
        inner.staged_at = None;
        inner.staged.take()
    }

    /// Time left before the staged capture goes stale, if one is staged.
    pub fn staged_remaining(&self, max_age: Duration) -> Option<Duration> {
        let inner = self.lock();
        if !inner.ready {
            return None;
        }
        inner
            .staged_at
            .map(|at| max_age.saturating_sub(at.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameSize, PixelFormat};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    const WINDOW: Duration = Duration::from_millis(1000);

    fn request() -> CaptureRequest {
        CaptureRequest {
            session: "s".into(),
            frame_count: 1,
            frame_size: FrameSize::Vga,
            pixel_format: PixelFormat::Jpeg,
            start_hint_us: None,
        }
    }

    #[test]
    fn start_consumes_ready() {
        let state = PeerCaptureState::new();
        assert_eq!(state.try_begin(10, Instant::now(), WINDOW), StartDecision::Rejected);

        state.stage(request()).unwrap();
        assert_eq!(
            state.snapshot(),
            StateSnapshot {
                ready: true,
                in_progress: false
            }
        );
        assert!(matches!(
            state.try_begin(10, Instant::now(), WINDOW),
            StartDecision::Accepted(_)
        ));
        assert_eq!(
            state.snapshot(),
            StateSnapshot {
                ready: false,
                in_progress: true
            }
        );
        state.finish();
        assert!(state.is_idle());
    }

    #[test]
    fn prepare_while_busy_is_refused() {
        let state = PeerCaptureState::new();
        state.stage(request()).unwrap();
        assert!(state.stage(request()).unwrap_err().is_busy());
        state.try_begin(0, Instant::now(), WINDOW);
        assert!(state.stage(request()).unwrap_err().is_busy());
    }

    #[test]
    fn repeated_start_is_duplicate_only_with_same_delay_in_window() {
        let state = PeerCaptureState::new();
        state.stage(request()).unwrap();
        let at = Instant::now();
        assert!(matches!(state.try_begin(500, at, WINDOW), StartDecision::Accepted(_)));
        assert_eq!(
            state.try_begin(500, at + Duration::from_millis(100), WINDOW),
            StartDecision::Duplicate
        );
        assert_eq!(
            state.try_begin(501, at + Duration::from_millis(100), WINDOW),
            StartDecision::Rejected
        );
        assert_eq!(
            state.try_begin(500, at + Duration::from_secs(2), WINDOW),
            StartDecision::Rejected
        );
        state.finish();
        assert_eq!(state.try_begin(500, at, WINDOW), StartDecision::Rejected);
    }

    #[test]
    fn repeated_start_moves_deadline_until_settled() {
        let state = PeerCaptureState::new();
        state.stage(request()).unwrap();
        let at = Instant::now();
        let delay = Duration::from_millis(500);
        assert!(matches!(
            state.try_begin(500_000, at, WINDOW),
            StartDecision::Accepted(_)
        ));
        assert_eq!(state.start_deadline(), Some(at + delay));

        // Retry 400ms later: both sides now count from the retry.
        let retry = at + Duration::from_millis(400);
        assert_eq!(state.try_begin(500_000, retry, WINDOW), StartDecision::Duplicate);
        assert_eq!(state.start_deadline(), Some(retry + delay));

        // The first deadline passing is not enough to settle.
        assert_eq!(state.settle_start(at + delay), Some(retry + delay));
        assert_eq!(state.settle_start(retry + delay), None);

        // Once capture began, a late repeat cannot be honoured.
        let late = retry + Duration::from_millis(100);
        assert_eq!(state.try_begin(500_000, late, WINDOW), StartDecision::Rejected);
        assert_eq!(state.start_deadline(), Some(retry + delay));

        state.finish();
        assert_eq!(state.start_deadline(), None);
        assert_eq!(state.settle_start(late), None);
    }

    #[test]
    fn stale_stage_is_abandoned() {
        let state = PeerCaptureState::new();
        state.stage(request()).unwrap();
        assert!(state.abandon_if_stale(Duration::from_secs(60)).is_none());
        assert!(state.abandon_if_stale(Duration::ZERO).is_some());
        assert!(state.is_idle());
        assert_eq!(state.try_begin(0, Instant::now(), WINDOW), StartDecision::Rejected);
    }

    #[test]
    fn ready_and_in_progress_never_coexist() {
        let state = PeerCaptureState::new();
        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();

        for i in 0..4 {
            let state = state.clone();
            let stop = stop.clone();
            workers.push(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    match i % 3 {
                        0 => {
                            let _ = state.stage(request());
                        }
                        1 => {
                            if let StartDecision::Accepted(_) =
                                state.try_begin(7, Instant::now(), WINDOW)
                            {
                                state.finish();
                            }
                        }
                        _ => {
                            let _ = state.abandon_if_stale(Duration::ZERO);
                        }
                    }
                }
            }));
        }

        for _ in 0..20_000 {
            let snap = state.snapshot();
            assert!(!(snap.ready && snap.in_progress));
        }
        stop.store(true, Ordering::Relaxed);
        for w in workers {
            w.join().unwrap();
        }
    }
}
