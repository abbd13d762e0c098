//! Monotonic device clock and the precision wait used at shutter time.

use std::time::{Duration, Instant};

/// Below this remaining time the wait spins instead of sleeping.
pub const SPIN_THRESHOLD: Duration = Duration::from_millis(2);

/// Free-running microsecond clock, counted from process start.
///
/// Each device has its own; the peers never compare raw values except through
/// the disparity estimate.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Microseconds since the clock was created.
    pub fn now_us(&self) -> i64 {
        self.micros_at(Instant::now())
    }

    pub fn now_ms(&self) -> i64 {
        self.now_us() / 1000
    }

    /// Clock reading of an instant captured earlier.
    pub fn micros_at(&self, instant: Instant) -> i64 {
        let elapsed = instant.saturating_duration_since(self.epoch);
        i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Instant `delay_us` after `anchor`. Negative delays clamp to the anchor.
pub fn deadline_after(anchor: Instant, delay_us: i64) -> Instant {
    anchor + Duration::from_micros(delay_us.max(0) as u64)
}

/// Wait until `deadline`.
///
/// Sleeps coarsely while more than [`SPIN_THRESHOLD`] remains, then spins for
/// the final stretch. Returns immediately if the deadline already passed.
pub async fn sleep_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        if remaining > SPIN_THRESHOLD {
            tokio::time::sleep(remaining - SPIN_THRESHOLD).await;
        } else {
            while Instant::now() < deadline {
                std::hint::spin_loop();
            }
            return;
        }
    }
}
