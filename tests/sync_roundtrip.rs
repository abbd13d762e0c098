//! Initiator and responder nodes talking over loopback with simulated cameras.

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, UdpSocket};
use tokio::runtime::Handle;

use syncam::capture::{driver, FrameSize, FrameStore, PixelFormat, SimProbe, SimulatedCamera};
use syncam::clock::Clock;
use syncam::http::{self, AppState, PeerClient};
use syncam::pipeline::{
    CaptureQueue, CaptureWorker, PeerCaptureState, PeerLink, RequestDefaults, Sequencer,
};
use syncam::stream::StreamControl;
use syncam::sync::PeerCommandServer;
use syncam::{Config, Role};

struct Node {
    http: SocketAddr,
    udp: Option<SocketAddr>,
    probe: SimProbe,
    state: PeerCaptureState,
}

fn config(role: Role) -> Config {
    let mut config = Config::default();
    config.device.role = role;
    config.camera.simulated = true;
    config.camera.sim_frame_interval_ms = 2;
    config.sequence.drop_frames = 2;
    config.sequence.stream_stop_timeout_ms = 100;
    config.sync.safety_margin_ms = 100;
    config.sync.ready_timeout_ms = 2000;
    config.sync.ready_poll_ms = 20;
    config
}

/// Nodes in one test share `clock`, so their clocks agree and the estimated
/// disparity is only measurement noise.
async fn spawn_node(
    config: Config,
    clock: Clock,
    dir: &Path,
    peer: Option<(SocketAddr, SocketAddr)>,
) -> Node {
    let camera = SimulatedCamera::new(config.camera.pixel_format, config.camera.frame_size)
        .with_frame_interval(Duration::from_millis(config.camera.sim_frame_interval_ms));
    let probe = camera.probe();
    let camera = driver::shared(camera);
    let stream = StreamControl::new();
    let state = PeerCaptureState::new();

    let mut sequencer = Sequencer::new(
        camera.clone(),
        stream.clone(),
        FrameStore::new(dir),
        clock,
        &config,
        Handle::current(),
    );
    if let Some((peer_http, peer_udp)) = peer {
        let client = PeerClient::new(format!("http://{}", peer_http), Duration::from_secs(2)).unwrap();
        sequencer = sequencer.with_peer(PeerLink {
            udp_addr: peer_udp.to_string(),
            client: Some(client),
        });
    }
    let phase = sequencer.phases();

    let (queue, jobs) = CaptureQueue::new();
    let worker = CaptureWorker::new(sequencer, jobs, state.clone(), config.sequence.staged_timeout());
    let starts = worker.starts();
    worker.spawn(None).unwrap();

    let udp = if config.device.role == Role::Responder {
        let server = PeerCommandServer::bind(
            "127.0.0.1:0",
            state.clone(),
            clock,
            starts,
            config.sync.duplicate_start_window(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        Some(addr)
    } else {
        None
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = listener.local_addr().unwrap();
    let app = AppState {
        role: config.device.role,
        device_id: config.device.id,
        queue,
        peer_state: state.clone(),
        stream,
        camera,
        phase,
        clock,
        defaults: RequestDefaults::from_config(&config),
    };
    tokio::spawn(http::serve(listener, app, std::future::pending()));

    Node {
        http: http_addr,
        udp,
        probe,
        state,
    }
}

fn frames_in(dir: &Path, session: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(&format!("{}-", session)))
        .collect();
    names.sort();
    names
}

/// Relays datagrams to `target`, swallowing the reply to the first START.
async fn lossy_relay(target: SocketAddr) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 128];
        let mut swallowed = false;
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            upstream.connect(target).await.unwrap();
            upstream.send(&buf[..len]).await.unwrap();
            let mut reply = [0u8; 128];
            let received =
                tokio::time::timeout(Duration::from_millis(500), upstream.recv(&mut reply)).await;
            let Ok(Ok(n)) = received else { continue };
            if !swallowed && buf[..len].starts_with(b"START") {
                swallowed = true;
                continue;
            }
            let _ = socket.send_to(&reply[..n], from).await;
        }
    });
    addr
}

/// Hand-over time of the first frame kept after the drain.
fn first_capture(probe: &SimProbe, format: PixelFormat, drop_frames: usize) -> Instant {
    probe.delivered(format)[drop_frames]
}

fn skew(a: Instant, b: Instant) -> Duration {
    a.max(b) - a.min(b)
}

async fn wait_for(mut done: impl FnMut() -> bool, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initiator_drives_responder_capture() {
    let responder_dir = tempfile::tempdir().unwrap();
    let initiator_dir = tempfile::tempdir().unwrap();
    let clock = Clock::new();

    let mut responder_config = config(Role::Responder);
    responder_config.camera.frame_size = FrameSize::Svga;
    let responder = spawn_node(responder_config, clock, responder_dir.path(), None).await;
    let initiator_config = config(Role::Initiator);
    let drop_frames = initiator_config.sequence.drop_frames;
    let initiator = spawn_node(
        initiator_config,
        clock,
        initiator_dir.path(),
        Some((responder.http, responder.udp.unwrap())),
    )
    .await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/api/capture", initiator.http))
        .form(&[
            ("session", "dual"),
            ("frame_count", "3"),
            ("framesize", "qvga"),
            ("pixel_format", "grayscale"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");

    let initiator_frames = frames_in(initiator_dir.path(), "dual");
    assert_eq!(initiator_frames.len(), 3, "{initiator_frames:?}");
    assert!(initiator_frames.iter().all(|n| n.ends_with(".gray")));

    // The responder captures on its own deadline; it may finish a little later.
    let responder_path = responder_dir.path().to_path_buf();
    assert!(
        wait_for(|| frames_in(&responder_path, "dual").len() == 3, Duration::from_secs(3)).await
    );
    assert!(wait_for(|| responder.state.is_idle(), Duration::from_secs(1)).await);

    let apart = skew(
        first_capture(&initiator.probe, PixelFormat::Grayscale, drop_frames),
        first_capture(&responder.probe, PixelFormat::Grayscale, drop_frames),
    );
    assert!(apart < Duration::from_millis(10), "first frames {apart:?} apart");

    // Both cameras are back on their own streaming configuration.
    assert_eq!(
        initiator.probe.current(),
        Some((PixelFormat::Jpeg, FrameSize::Vga))
    );
    assert!(
        wait_for(
            || responder.probe.current() == Some((PixelFormat::Jpeg, FrameSize::Svga)),
            Duration::from_secs(1)
        )
        .await
    );
    assert_eq!(initiator.probe.outstanding(), 0);
    assert_eq!(responder.probe.outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_start_ack_keeps_both_sides_together() {
    let responder_dir = tempfile::tempdir().unwrap();
    let initiator_dir = tempfile::tempdir().unwrap();
    let clock = Clock::new();

    let responder = spawn_node(config(Role::Responder), clock, responder_dir.path(), None).await;
    let relay = lossy_relay(responder.udp.unwrap()).await;

    let mut initiator_config = config(Role::Initiator);
    // Long enough for the repeated START to land before either deadline.
    initiator_config.sync.safety_margin_ms = 600;
    initiator_config.sync.query_timeout_ms = 100;
    initiator_config.sync.start_retry_delay_ms = 50;
    let drop_frames = initiator_config.sequence.drop_frames;
    let initiator = spawn_node(
        initiator_config,
        clock,
        initiator_dir.path(),
        Some((responder.http, relay)),
    )
    .await;

    let response = reqwest::get(format!(
        "http://{}/api/capture?session=retry&frame_count=2&pixel_format=grayscale",
        initiator.http
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(frames_in(initiator_dir.path(), "retry").len(), 2);

    let responder_path = responder_dir.path().to_path_buf();
    assert!(
        wait_for(|| frames_in(&responder_path, "retry").len() == 2, Duration::from_secs(3)).await
    );

    let apart = skew(
        first_capture(&initiator.probe, PixelFormat::Grayscale, drop_frames),
        first_capture(&responder.probe, PixelFormat::Grayscale, drop_frames),
    );
    assert!(apart < Duration::from_millis(10), "first frames {apart:?} apart");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_responder_fails_the_request() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(Role::Initiator);
    config.sync.ready_timeout_ms = 200;
    config.sync.query_timeout_ms = 50;

    // Nothing listens on either address.
    let silent_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let closed_http: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let initiator = spawn_node(
        config,
        Clock::new(),
        dir.path(),
        Some((closed_http, silent_udp.local_addr().unwrap())),
    )
    .await;

    let response = reqwest::get(format!("http://{}/api/capture?frame_count=2", initiator.http))
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    assert_eq!(response.text().await.unwrap(), "slave not ready");
    assert!(frames_in(dir.path(), "session").is_empty());
    assert_eq!(
        initiator.probe.current(),
        Some((PixelFormat::Jpeg, FrameSize::Vga))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn responder_status_and_live_view_guards() {
    let dir = tempfile::tempdir().unwrap();
    let node = spawn_node(config(Role::Responder), Clock::new(), dir.path(), None).await;
    let base = format!("http://{}", node.http);

    let status: serde_json::Value = reqwest::get(format!("{base}/api/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["role"], "responder");
    assert_eq!(status["capture_ready"], false);
    assert_eq!(status["stream_enabled"], false);
    assert_eq!(status["phase"], "idle");

    let refused = reqwest::get(format!("{base}/stream")).await.unwrap();
    assert_eq!(refused.status(), 409);

    // Staging over HTTP arms the UDP side. Query-only POST, no form body.
    let prepared = reqwest::Client::new()
        .post(format!("{base}/api/capture?session=solo&frame_count=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(prepared.status(), 200);
    assert!(node.state.snapshot().ready);
    let reply = syncam::sync::send_and_receive(
        &node.udp.unwrap().to_string(),
        "READY",
        Duration::from_millis(300),
    )
    .await
    .unwrap();
    assert_eq!(reply, "OK");

    // A second prepare while armed is busy.
    let busy = reqwest::get(format!("{base}/api/capture?session=again"))
        .await
        .unwrap();
    assert_eq!(busy.status(), 409);
    assert_eq!(busy.text().await.unwrap(), "capture busy");
}
