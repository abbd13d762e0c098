pub mod capture;
pub mod clock;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod stream;
pub mod sync;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::{FrameSize, PixelFormat};
use error::ConfigError;
use serde::{Deserialize, Serialize};

/// Which side of the pair this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Runs sequences on HTTP request and drives the peer.
    Initiator,
    /// Stages captures and starts them on the initiator's command.
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        })
    }
}

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub camera: CameraConfig,
    pub sequence: SequenceConfig,
    pub sync: SyncConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: u32,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub device_path: String,
    pub buffer_count: u32,
    /// Streaming configuration, restored after every sequence.
    pub frame_size: FrameSize,
    pub pixel_format: PixelFormat,
    /// Use the synthetic camera instead of V4L2.
    pub simulated: bool,
    pub sim_frame_interval_ms: u64,
    /// Pin the capture thread to this core.
    #[serde(default)]
    pub capture_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    pub capture_dir: PathBuf,
    /// Frames discarded after a reconfigure so exposure settles.
    pub drop_frames: usize,
    pub stream_stop_timeout_ms: u64,
    /// Responder gives up on a staged capture after this long without START.
    pub staged_timeout_ms: u64,
    /// Larger `frame_count` requests are clamped to this.
    pub max_frame_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub peer_host: String,
    pub udp_port: u16,
    pub ping_count: u32,
    pub query_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    pub ready_poll_ms: u64,
    pub start_retries: u32,
    pub start_retry_delay_ms: u64,
    pub safety_margin_ms: i64,
    /// Proceed solo when the peer cannot be reached.
    pub allow_peer_missing: bool,
    pub duplicate_start_window_ms: u64,
    pub prepare_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub peer_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                id: 0,
                role: Role::Initiator,
            },
            camera: CameraConfig {
                device_path: "/dev/video0".into(),
                buffer_count: 4,
                frame_size: FrameSize::Vga,
                pixel_format: PixelFormat::Jpeg,
                simulated: false,
                sim_frame_interval_ms: 33,
                capture_core: None,
            },
            sequence: SequenceConfig {
                capture_dir: PathBuf::from("captures"),
                drop_frames: 5,
                stream_stop_timeout_ms: 2000,
                staged_timeout_ms: 30_000,
                max_frame_count: 1000,
            },
            sync: SyncConfig {
                peer_host: "192.168.4.2".into(),
                udp_port: 5065,
                ping_count: 5,
                query_timeout_ms: 300,
                ready_timeout_ms: 5000,
                ready_poll_ms: 200,
                start_retries: 3,
                start_retry_delay_ms: 100,
                safety_margin_ms: 1000,
                allow_peer_missing: false,
                duplicate_start_window_ms: 1000,
                prepare_timeout_ms: 5000,
            },
            http: HttpConfig {
                bind: "0.0.0.0:8080".into(),
                peer_port: 8080,
            },
        }
    }
}

impl Config {
    /// Built-in defaults, then `path` (TOML, optional), then `SYNCAM__*`
    /// environment variables, e.g. `SYNCAM__SYNC__PEER_HOST`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        let config: Config = builder
            .add_source(::config::Environment::with_prefix("SYNCAM").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.ping_count == 0 {
            return Err(ConfigError::Invalid("sync.ping_count must be at least 1".into()));
        }
        if self.sequence.max_frame_count == 0 {
            return Err(ConfigError::Invalid("sequence.max_frame_count must be at least 1".into()));
        }
        if self.sync.start_retries == 0 {
            return Err(ConfigError::Invalid("sync.start_retries must be at least 1".into()));
        }
        if self.device.role == Role::Initiator && self.sync.peer_host.trim().is_empty() {
            return Err(ConfigError::Invalid("sync.peer_host is required for the initiator".into()));
        }
        Ok(())
    }
}

impl SyncConfig {
    /// `host:port` of the peer's command server.
    pub fn peer_udp_addr(&self) -> String {
        format!("{}:{}", self.peer_host, self.udp_port)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }

    pub fn start_retry_delay(&self) -> Duration {
        Duration::from_millis(self.start_retry_delay_ms)
    }

    pub fn duplicate_start_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_start_window_ms)
    }

    pub fn safety_margin_us(&self) -> i64 {
        self.safety_margin_ms.saturating_mul(1000)
    }
}

impl SequenceConfig {
    pub fn stream_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_stop_timeout_ms)
    }

    pub fn staged_timeout(&self) -> Duration {
        Duration::from_millis(self.staged_timeout_ms)
    }
}
