pub mod driver;
pub mod frame;
pub mod sim;
pub mod storage;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use driver::{CameraDriver, FrameLease, SharedCamera};
pub use frame::{Frame, FrameMetadata, FrameSize, PixelFormat};
pub use sim::{SimProbe, SimulatedCamera};
pub use storage::FrameStore;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Camera;
