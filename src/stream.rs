//! MJPEG live view and the switch the capture pipeline uses to silence it.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::capture::{FrameLease, PixelFormat, SharedCamera};

pub const BOUNDARY: &str = "123456789000000000000987654321";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace;boundary=123456789000000000000987654321";

/// Pause between parts.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatus {
    pub enabled: bool,
    /// A client is currently being served.
    pub active: bool,
}

/// Shared enable flag and single-client guard for the live view.
#[derive(Debug, Clone)]
pub struct StreamControl {
    status: watch::Sender<StreamStatus>,
}

impl Default for StreamControl {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamControl {
    pub fn new() -> Self {
        let (status, _) = watch::channel(StreamStatus::default());
        Self { status }
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.borrow()
    }

    pub fn enable(&self) {
        self.status.send_modify(|s| s.enabled = true);
        info!("Live stream enabled");
    }

    pub fn disable(&self) {
        self.status.send_modify(|s| s.enabled = false);
        info!("Live stream disabled");
    }

    /// Claim the stream for one client. `None` if disabled or already taken.
    pub fn try_begin(&self) -> Option<StreamSession> {
        let mut claimed = false;
        self.status.send_if_modified(|s| {
            if s.enabled && !s.active {
                s.active = true;
                claimed = true;
            }
            claimed
        });
        claimed.then(|| StreamSession {
            status: self.status.clone(),
            rx: self.status.subscribe(),
        })
    }

    /// Disable streaming and wait up to `timeout` for the active client loop
    /// to let go. Returns `false` if it was still running at the deadline.
    pub async fn stop_and_wait(&self, timeout: Duration) -> bool {
        self.status.send_modify(|s| s.enabled = false);
        let mut rx = self.status.subscribe();
        let stopped = tokio::time::timeout(timeout, rx.wait_for(|s| !s.active)).await;
        match stopped {
            Ok(Ok(_)) => true,
            _ => {
                warn!("Live stream still active after {:?}", timeout);
                false
            }
        }
    }
}

/// Held by the serving loop; releases the stream on drop.
#[derive(Debug)]
pub struct StreamSession {
    status: watch::Sender<StreamStatus>,
    rx: watch::Receiver<StreamStatus>,
}

impl StreamSession {
    pub fn is_enabled(&self) -> bool {
        self.rx.borrow().enabled
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.status.send_modify(|s| s.active = false);
        debug!("Live stream session ended");
    }
}

/// One multipart section carrying a JPEG.
pub fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

async fn next_jpeg(camera: &SharedCamera) -> Option<Bytes> {
    let mut camera = camera.clone().lock_owned().await;
    let grabbed = tokio::task::spawn_blocking(move || {
        let lease = FrameLease::acquire(&mut **camera)?;
        Ok::<_, crate::error::CameraError>((lease.meta.format, lease.data.clone()))
    })
    .await;

    match grabbed {
        Ok(Ok((PixelFormat::Jpeg, data))) => Some(data),
        Ok(Ok((format, _))) => {
            debug!("Skipping {} frame in live view", format);
            None
        }
        Ok(Err(e)) => {
            warn!("Live view capture failed: {}", e);
            None
        }
        Err(e) => {
            warn!("Live view capture task failed: {}", e);
            None
        }
    }
}

/// Body of a live view response. Ends once streaming is disabled; the
/// session is released when the stream is dropped.
pub fn mjpeg_stream(
    camera: SharedCamera,
    session: StreamSession,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    futures::stream::unfold(
        (camera, session, true),
        |(camera, session, first)| async move {
            if !first {
                tokio::time::sleep(FRAME_INTERVAL).await;
            }
            loop {
                if !session.is_enabled() {
                    return None;
                }
                if let Some(jpeg) = next_jpeg(&camera).await {
                    return Some((Ok(mjpeg_part(&jpeg)), (camera, session, false)));
                }
                tokio::time::sleep(FRAME_INTERVAL).await;
            }
        },
    )
}
