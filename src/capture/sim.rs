//! Simulated sensor for running without hardware and for tests.
//!
//! Frames are synthetic but sized like real ones. A [`SimProbe`] shared with
//! the camera exposes counters and fault injection.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use crate::capture::driver::CameraDriver;
use crate::capture::frame::{Frame, FrameMetadata, FrameSize, PixelFormat};
use crate::error::CameraError;

#[derive(Debug, Default)]
struct SimState {
    current: Option<(PixelFormat, FrameSize)>,
    /// Acquisitions since the last successful init, 1-based once incremented.
    acquisitions_since_init: u64,
    total_acquisitions: u64,
    outstanding: usize,
    /// Hand-over times of successful acquisitions, with their format.
    delivered: Vec<(PixelFormat, Instant)>,
    fail_acquisitions: HashSet<u64>,
    fail_init_formats: HashSet<PixelFormat>,
}

/// Observation and fault-injection handle for a [`SimulatedCamera`].
#[derive(Debug, Clone, Default)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
}

impl SimProbe {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the `n`-th acquisition (1-based) after the next init.
    pub fn fail_acquisition(&self, n: u64) {
        self.lock().fail_acquisitions.insert(n);
    }

    /// Make every init with `format` fail.
    pub fn fail_init(&self, format: PixelFormat) {
        self.lock().fail_init_formats.insert(format);
    }

    /// Frames acquired but not yet released.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    pub fn current(&self) -> Option<(PixelFormat, FrameSize)> {
        self.lock().current
    }

    /// When each frame in `format` was handed over, oldest first.
    pub fn delivered(&self, format: PixelFormat) -> Vec<Instant> {
        self.lock()
            .delivered
            .iter()
            .filter(|(f, _)| *f == format)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn total_acquisitions(&self) -> u64 {
        self.lock().total_acquisitions
    }
}

/// Synthetic camera producing frames at a fixed interval.
pub struct SimulatedCamera {
    probe: SimProbe,
    frame_interval: Duration,
    sequence: u64,
    last_frame: Option<Instant>,
}

impl SimulatedCamera {
    /// Create a camera already initialized to `format`/`size`.
    pub fn new(format: PixelFormat, size: FrameSize) -> Self {
        let probe = SimProbe::default();
        {
            let mut state = probe.lock();
            state.current = Some((format, size));
        }
        Self {
            probe,
            frame_interval: Duration::from_millis(33),
            sequence: 0,
            last_frame: None,
        }
    }

    /// Time between frames, like a sensor running at a fixed rate.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn probe(&self) -> SimProbe {
        self.probe.clone()
    }

    fn pace(&mut self) {
        if let Some(last) = self.last_frame {
            let next = last + self.frame_interval;
            let now = Instant::now();
            if next > now {
                std::thread::sleep(next - now);
            }
        }
        self.last_frame = Some(Instant::now());
    }

    fn synthesize(&self, format: PixelFormat, size: FrameSize) -> Bytes {
        let (width, height) = size.dimensions();
        let seq = self.sequence as u8;
        match format.bytes_per_pixel() {
            Some(bpp) => {
                let len = width as usize * height as usize * bpp;
                Bytes::from(vec![seq; len])
            }
            None => {
                // Minimal JPEG-shaped payload: SOI, filler, EOI.
                let body = (width as usize * height as usize) / 10;
                let mut buf = BytesMut::with_capacity(body + 4);
                buf.put_slice(&[0xFF, 0xD8]);
                buf.put_bytes(seq, body);
                buf.put_slice(&[0xFF, 0xD9]);
                buf.freeze()
            }
        }
    }
}

impl CameraDriver for SimulatedCamera {
    fn acquire_frame(&mut self) -> Result<Frame, CameraError> {
        let (format, size, fail) = {
            let mut state = self.probe.lock();
            let (format, size) = state.current.ok_or(CameraError::NotInitialized)?;
            state.acquisitions_since_init += 1;
            state.total_acquisitions += 1;
            let n = state.acquisitions_since_init;
            (format, size, state.fail_acquisitions.contains(&n))
        };

        self.pace();
        if fail {
            return Err(CameraError::Acquire("simulated sensor timeout".into()));
        }

        self.sequence += 1;
        let data = self.synthesize(format, size);
        let (width, height) = size.dimensions();
        let timestamp = Instant::now();
        {
            let mut state = self.probe.lock();
            state.outstanding += 1;
            state.delivered.push((format, timestamp));
        }

        Ok(Frame {
            data,
            meta: Arc::new(FrameMetadata {
                sequence: self.sequence,
                width,
                height,
                format,
            }),
            timestamp,
        })
    }

    fn release_frame(&mut self, frame: Frame) {
        drop(frame);
        let mut state = self.probe.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
    }

    fn reinit(&mut self, format: PixelFormat, size: FrameSize) -> Result<(), CameraError> {
        self.deinit();
        let mut state = self.probe.lock();
        if state.fail_init_formats.contains(&format) {
            return Err(CameraError::Init(format!("sensor rejected {:?}", format)));
        }
        state.current = Some((format, size));
        state.acquisitions_since_init = 0;
        Ok(())
    }

    fn deinit(&mut self) {
        self.probe.lock().current = None;
        self.last_frame = None;
    }

    fn current(&self) -> Option<(PixelFormat, FrameSize)> {
        self.probe.current()
    }
}
