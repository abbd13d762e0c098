//! V4L2 camera backend with memory-mapped streaming

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::driver::CameraDriver;
use crate::capture::frame::{Frame, FrameMetadata, FrameSize, PixelFormat};
use crate::error::CameraError;

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Jpeg => FourCC::new(b"MJPG"),
        PixelFormat::Yuv422 => FourCC::new(b"YUYV"),
        PixelFormat::Rgb565 => FourCC::new(b"RGBP"),
        PixelFormat::Grayscale => FourCC::new(b"GREY"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
    }
}

fn init_err(e: impl std::fmt::Display) -> CameraError {
    CameraError::Init(e.to_string())
}

struct Active {
    stream: MmapStream<'static>,
    _device: Box<Device>,
    format: PixelFormat,
    size: FrameSize,
}

/// V4L2 capture device
pub struct V4l2Camera {
    path: String,
    buffer_count: u32,
    active: Option<Active>,
    sequence: u64,
}

impl V4l2Camera {
    /// Open `path` and start streaming with `format`/`size`.
    pub fn open(
        path: impl Into<String>,
        buffer_count: u32,
        format: PixelFormat,
        size: FrameSize,
    ) -> Result<Self, CameraError> {
        let mut camera = Self {
            path: path.into(),
            buffer_count,
            active: None,
            sequence: 0,
        };
        camera.reinit(format, size)?;
        Ok(camera)
    }

    fn start(&self, format: PixelFormat, size: FrameSize) -> Result<Active, CameraError> {
        info!("Initializing V4L2 capture: {} {:?} {:?}", self.path, format, size);

        let device = Device::with_path(&self.path).map_err(init_err)?;

        // Query capabilities
        let caps = device.query_caps().map_err(init_err)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CameraError::Init("device doesn't support video capture".into()));
        }

        // Set format
        let (width, height) = size.dimensions();
        let mut fmt = device.format().map_err(init_err)?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = fourcc(format);
        let applied = device.set_format(&fmt).map_err(init_err)?;
        if applied.fourcc != fmt.fourcc {
            return Err(CameraError::UnsupportedFormat(format));
        }
        if applied.width != width || applied.height != height {
            warn!(
                "Driver adjusted resolution to {}x{} (requested {}x{})",
                applied.width, applied.height, width, height
            );
        }

        let device = Box::new(device);
        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, self.buffer_count)
            .map_err(init_err)?;
        info!("Capture stream started with {} buffers", self.buffer_count);

        Ok(Active {
            stream,
            _device: device,
            format,
            size,
        })
    }
}

impl CameraDriver for V4l2Camera {
    #[instrument(skip(self))]
    fn acquire_frame(&mut self) -> Result<Frame, CameraError> {
        let timestamp = Instant::now();
        let active = self.active.as_mut().ok_or(CameraError::NotInitialized)?;

        let (buf, meta) = active
            .stream
            .next()
            .map_err(|e| CameraError::Acquire(e.to_string()))?;

        // Compressed formats only fill part of the mapped buffer.
        let used = (meta.bytesused as usize).min(buf.len());
        let data = Bytes::copy_from_slice(&buf[..used]);

        self.sequence += 1;
        let (width, height) = active.size.dimensions();

        Ok(Frame {
            data,
            meta: Arc::new(FrameMetadata {
                sequence: self.sequence,
                width,
                height,
                format: active.format,
            }),
            timestamp,
        })
    }

    fn release_frame(&mut self, frame: Frame) {
        // The mapped buffer is requeued on the next dequeue; the copy is ours.
        drop(frame);
    }

    fn reinit(&mut self, format: PixelFormat, size: FrameSize) -> Result<(), CameraError> {
        self.deinit();
        self.active = Some(self.start(format, size)?);
        Ok(())
    }

    fn deinit(&mut self) {
        if self.active.take().is_some() {
            info!("V4L2 capture stopped: {}", self.path);
        }
    }

    fn current(&self) -> Option<(PixelFormat, FrameSize)> {
        self.active.as_ref().map(|a| (a.format, a.size))
    }
}
