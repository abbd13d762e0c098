//! Synchronized dual-device capture node.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use syncam::capture::{driver, FrameStore, SharedCamera, SimulatedCamera};
use syncam::clock::Clock;
use syncam::http::{self, AppState, PeerClient};
use syncam::pipeline::request::RequestDefaults;
use syncam::pipeline::sequence::{PeerLink, Sequencer};
use syncam::pipeline::state::PeerCaptureState;
use syncam::pipeline::worker::{CaptureQueue, CaptureWorker};
use syncam::stream::StreamControl;
use syncam::sync::PeerCommandServer;
use syncam::{CameraConfig, Config, Role};

#[derive(Debug, Parser)]
#[command(version, about = "Synchronized dual-device capture node")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "SYNCAM_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured role
    #[arg(long, value_enum)]
    role: Option<Role>,

    /// Use the synthetic camera
    #[arg(long)]
    simulate: bool,

    /// Override the capture directory
    #[arg(long)]
    capture_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("syncam=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).wrap_err("loading configuration")?;
    if let Some(role) = args.role {
        config.device.role = role;
    }
    if args.simulate {
        config.camera.simulated = true;
    }
    if let Some(dir) = args.capture_dir {
        config.sequence.capture_dir = dir;
    }
    config.validate()?;

    info!(
        "syncam launching as {} (device {})",
        config.device.role, config.device.id
    );

    let clock = Clock::new();
    let camera = open_camera(&config.camera)?;
    let store = FrameStore::new(&config.sequence.capture_dir);
    store
        .ensure_dir()
        .wrap_err_with(|| format!("capture directory {}", store.dir().display()))?;

    let stream = StreamControl::new();
    let peer_state = PeerCaptureState::new();

    let mut sequencer = Sequencer::new(
        camera.clone(),
        stream.clone(),
        store,
        clock,
        &config,
        Handle::current(),
    );
    if config.device.role == Role::Initiator {
        let client = PeerClient::new(
            format!("http://{}:{}", config.sync.peer_host, config.http.peer_port),
            Duration::from_millis(config.sync.prepare_timeout_ms),
        )?;
        info!(
            "Peer at {} (udp {})",
            client.base_url(),
            config.sync.peer_udp_addr()
        );
        sequencer = sequencer.with_peer(PeerLink {
            udp_addr: config.sync.peer_udp_addr(),
            client: Some(client),
        });
    }
    let phase = sequencer.phases();

    let (queue, jobs) = CaptureQueue::new();
    let worker = CaptureWorker::new(
        sequencer,
        jobs,
        peer_state.clone(),
        config.sequence.staged_timeout(),
    );
    let starts = worker.starts();
    let _capture_thread = worker.spawn(config.camera.capture_core)?;

    if config.device.role == Role::Responder {
        let server = PeerCommandServer::bind(
            ("0.0.0.0", config.sync.udp_port),
            peer_state.clone(),
            clock,
            starts,
            config.sync.duplicate_start_window(),
        )
        .await
        .wrap_err("binding peer command socket")?;
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Peer command server stopped: {}", e);
            }
        });
    }

    let listener = TcpListener::bind(&config.http.bind)
        .await
        .wrap_err_with(|| format!("binding {}", config.http.bind))?;
    let state = AppState {
        role: config.device.role,
        device_id: config.device.id,
        queue,
        peer_state,
        stream,
        camera,
        phase,
        clock,
        defaults: RequestDefaults::from_config(&config),
    };
    http::serve(listener, state, shutdown_signal()).await?;

    info!("syncam shutting down");
    Ok(())
}

fn open_camera(config: &CameraConfig) -> Result<SharedCamera> {
    if config.simulated {
        info!("Using simulated camera");
        let camera = SimulatedCamera::new(config.pixel_format, config.frame_size)
            .with_frame_interval(Duration::from_millis(config.sim_frame_interval_ms));
        return Ok(driver::shared(camera));
    }
    open_hardware(config)
}

#[cfg(feature = "v4l2")]
fn open_hardware(config: &CameraConfig) -> Result<SharedCamera> {
    let camera = syncam::capture::V4l2Camera::open(
        config.device_path.clone(),
        config.buffer_count,
        config.pixel_format,
        config.frame_size,
    )?;
    Ok(driver::shared(camera))
}

#[cfg(not(feature = "v4l2"))]
fn open_hardware(config: &CameraConfig) -> Result<SharedCamera> {
    Err(color_eyre::eyre::eyre!(
        "built without the v4l2 feature, cannot open {}; use --simulate",
        config.device_path
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
