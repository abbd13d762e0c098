pub mod request;
pub mod sequence;
pub mod state;
pub mod worker;

pub use request::{CaptureParams, CaptureRequest, RequestDefaults};
pub use sequence::{CaptureReport, PeerLink, Phase, Sequencer};
pub use state::PeerCaptureState;
pub use worker::{CaptureQueue, CaptureWorker};
