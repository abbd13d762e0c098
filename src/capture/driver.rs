//! Narrow camera interface used by the capture pipeline and the live stream.

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::capture::frame::{Frame, FrameSize, PixelFormat};
use crate::error::CameraError;

/// Camera handle shared between the capture worker and the MJPEG stream.
///
/// Only the capture worker calls [`CameraDriver::reinit`] / [`CameraDriver::deinit`].
pub type SharedCamera = Arc<Mutex<Box<dyn CameraDriver>>>;

pub fn shared(driver: impl CameraDriver + 'static) -> SharedCamera {
    Arc::new(Mutex::new(Box::new(driver)))
}

/// Sensor driver.
///
/// Frames handed out by [`acquire_frame`](Self::acquire_frame) belong to the
/// driver's buffer pool and must come back through
/// [`release_frame`](Self::release_frame). Prefer [`FrameLease`], which does
/// that on every path.
pub trait CameraDriver: Send {
    /// Block until the next frame is available.
    fn acquire_frame(&mut self) -> Result<Frame, CameraError>;

    /// Return a frame's buffer to the driver.
    fn release_frame(&mut self, frame: Frame);

    /// Tear down and bring the sensor back up with a new format and size.
    fn reinit(&mut self, format: PixelFormat, size: FrameSize) -> Result<(), CameraError>;

    /// Tear down the sensor. Idempotent.
    fn deinit(&mut self);

    /// Active format and size, if initialized.
    fn current(&self) -> Option<(PixelFormat, FrameSize)>;
}

/// An acquired frame that is released back to its driver when dropped.
pub struct FrameLease<'a, D: CameraDriver + ?Sized> {
    driver: &'a mut D,
    frame: Option<Frame>,
}

impl<'a, D: CameraDriver + ?Sized> FrameLease<'a, D> {
    pub fn acquire(driver: &'a mut D) -> Result<Self, CameraError> {
        let frame = driver.acquire_frame()?;
        Ok(Self {
            driver,
            frame: Some(frame),
        })
    }
}

impl<D: CameraDriver + ?Sized> Deref for FrameLease<'_, D> {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // Only `Drop` takes the frame out.
        self.frame.as_ref().expect("frame lease already released")
    }
}

impl<D: CameraDriver + ?Sized> Drop for FrameLease<'_, D> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.driver.release_frame(frame);
        }
    }
}

/// Acquire and discard `count` frames so auto-exposure and white balance settle
/// after a format change. Returns how many frames were actually pulled.
pub fn drain_frames<D: CameraDriver + ?Sized>(driver: &mut D, count: usize) -> usize {
    let mut drained = 0;
    for i in 0..count {
        match FrameLease::acquire(&mut *driver) {
            Ok(_lease) => drained += 1,
            Err(e) => debug!("Drain frame {} failed: {}", i, e),
        }
    }
    drained
}
