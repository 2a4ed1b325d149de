//! End-to-end tests over real sockets: registration, reconnects, the frame
//! request protocol and occupancy updates.

use async_trait::async_trait;
use bytes::Bytes;
use occupancy_brain::domain::types::{
    BoundingBox, Detection, DeviceId, Facing, Frame, ObjectId, Zone,
};
use occupancy_brain::domain::FloorPlan;
use occupancy_brain::infra::{Config, Metrics};
use occupancy_brain::io::detector::{DetectError, Detector};
use occupancy_brain::services::pipeline::FramePipeline;
use occupancy_brain::services::zones::ZoneClassifier;
use occupancy_brain::services::{Brain, TaskKind};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Returns the scripted boxes for call N, then nothing
struct ScriptedDetector {
    calls: AtomicUsize,
    script: Vec<Vec<Detection>>,
}

impl ScriptedDetector {
    fn new(script: Vec<Vec<Detection>>) -> Self {
        Self { calls: AtomicUsize::new(0), script }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.get(n).cloned().unwrap_or_default())
    }
}

fn person_at(x: f32) -> Detection {
    // 40px wide box centred on x
    Detection::new(BoundingBox::new(x - 20.0, 100.0, 40.0, 80.0), 0.9)
}

fn solid_jpeg(rgb: [u8; 3]) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(64, 48, image::Rgb(rgb));
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Jpeg).unwrap();
    buf.into_inner()
}

fn test_jpeg() -> Vec<u8> {
    solid_jpeg([40, 160, 90])
}

/// What happened, in the order it happened, across cameras and detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Request(char),
    DetectStart(char),
    DetectEnd(char),
}

type StepLog = Arc<Mutex<Vec<Step>>>;

/// Slow detector that tells the two test cameras apart by frame colour
/// (red for 'a', blue for 'b') and tracks how many calls overlap.
struct SlowDetector {
    log: StepLog,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl SlowDetector {
    fn new(log: StepLog, delay: Duration) -> Self {
        Self {
            log,
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Detector for SlowDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        let pixel = frame.image.get_pixel(0, 0);
        let camera = if pixel[0] > pixel[2] { 'a' } else { 'b' };

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.log.lock().push(Step::DetectStart(camera));

        tokio::time::sleep(self.delay).await;

        self.log.lock().push(Step::DetectEnd(camera));
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![])
    }
}

/// Like `fake_camera`, but records every request it receives
async fn logging_camera(mut stream: TcpStream, jpeg: Vec<u8>, name: char, log: StepLog) {
    let mut command = [0u8; 10];
    loop {
        if stream.read_exact(&mut command).await.is_err() {
            return;
        }
        log.lock().push(Step::Request(name));
        if stream.write_all(&jpeg).await.is_err() {
            return;
        }
    }
}

fn positions(log: &[Step], step: Step) -> Vec<usize> {
    log.iter().enumerate().filter(|(_, s)| **s == step).map(|(i, _)| i).collect()
}

fn test_config() -> Config {
    Config::default()
        .with_bind_address("127.0.0.1")
        .with_listener_port(0)
        .with_read_timeout_ms(1000)
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

async fn handshake(addr: SocketAddr, id: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(id.as_bytes()).await.unwrap();
    stream
}

/// Answer every "send image" with `jpeg`, splitting the end marker
/// across two writes. Runs until the brain closes the connection.
async fn fake_camera(mut stream: TcpStream, jpeg: Vec<u8>) {
    let mut command = [0u8; 10];
    loop {
        if stream.read_exact(&mut command).await.is_err() {
            return;
        }
        assert_eq!(&command, b"send image");
        let split = jpeg.len() - 1;
        if stream.write_all(&jpeg[..split]).await.is_err() {
            return;
        }
        let _ = stream.flush().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        if stream.write_all(&jpeg[split..]).await.is_err() {
            return;
        }
    }
}

#[tokio::test]
async fn test_reconnect_preserves_tracker_state() {
    let metrics = Arc::new(Metrics::new());
    let detector = Arc::new(ScriptedDetector::new(vec![vec![person_at(100.0)]]));
    let mut brain = Brain::new(test_config(), detector.clone(), metrics.clone());
    brain.start(TaskKind::Listener).await.unwrap();
    let addr = brain.local_addr(TaskKind::Listener).unwrap();
    let registry = brain.registry().clone();
    let id = DeviceId::from("mac1");

    let first = handshake(addr, "mac1").await;
    assert!(wait_for(|| registry.connected_count() == 1).await);

    // One frame with one person, processed the way the worker does it
    let pipeline = FramePipeline::new(
        detector.clone(),
        ZoneClassifier::new(640),
        0.6,
        0.3,
        metrics.clone(),
    );
    let outcome = pipeline.process(&registry, &id, Bytes::from(test_jpeg())).await.unwrap();
    assert_eq!(outcome.enters, 1);

    let before = registry.with_session(&id, |s| s.tracker().objects().to_vec()).unwrap();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].id, ObjectId(0));

    // Soft disconnect, then re-handshake under the same identifier
    let (_, channel) = registry.active_channels().pop().unwrap();
    assert!(registry.disconnect(&id, channel.generation()));
    drop(first);
    assert_eq!(registry.connected_count(), 0);

    let _second = handshake(addr, "mac1").await;
    assert!(wait_for(|| registry.connected_count() == 1).await);

    assert_eq!(registry.len(), 1);
    let after = registry.with_session(&id, |s| s.tracker().objects().to_vec()).unwrap();
    assert_eq!(after, before);
    assert_eq!(registry.with_session(&id, |s| s.pending_traffic()), Some(1));

    let summary = metrics.report(registry.connected_count(), registry.len());
    assert_eq!(summary.devices_registered, 1);
    assert_eq!(summary.devices_reconnected, 1);

    brain.shutdown().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_failed_handshake_creates_no_session() {
    let metrics = Arc::new(Metrics::new());
    let mut brain = Brain::new(test_config(), Arc::new(ScriptedDetector::new(vec![])), metrics.clone());
    brain.start(TaskKind::Listener).await.unwrap();
    let addr = brain.local_addr(TaskKind::Listener).unwrap();

    // Connect and hang up without an identity
    drop(TcpStream::connect(addr).await.unwrap());
    // Identity that is only whitespace
    let _blank = handshake(addr, " \r\n").await;

    assert!(wait_for(|| metrics.report(0, 0).handshake_failures == 2).await);
    assert!(brain.registry().is_empty());

    brain.shutdown().await;
    assert!(!brain.is_running(TaskKind::Listener));
}

#[tokio::test]
async fn test_streaming_worker_feeds_occupancy() {
    let metrics = Arc::new(Metrics::new());
    // Person seen on the left for two frames, then gone
    let detector = Arc::new(ScriptedDetector::new(vec![
        vec![person_at(100.0)],
        vec![person_at(104.0)],
    ]));
    let mut brain = Brain::new(test_config(), detector.clone(), metrics.clone());

    let mut plan = FloorPlan::with_first_room("Hall", Some(DeviceId::from("cam1")), Facing::N).unwrap();
    plan.add_room("Porch", "Right", "Hall", "Left").unwrap();
    brain.engine().install_plan(plan).unwrap();

    brain.start(TaskKind::Listener).await.unwrap();
    brain.start(TaskKind::Worker).await.unwrap();
    brain.start(TaskKind::Occupancy).await.unwrap();
    let addr = brain.local_addr(TaskKind::Listener).unwrap();

    let camera = handshake(addr, "cam1").await;
    let camera_task = tokio::spawn(fake_camera(camera, test_jpeg()));

    // Enter at Left moves someone from the Porch into the Hall; after the
    // tolerance runs out the exit at Left moves them back.
    let engine = brain.engine().clone();
    assert!(wait_for(|| engine.room_count("Porch") == Some(1) && detector.calls() >= 6).await);
    assert_eq!(engine.room_count("Hall"), Some(0));

    let summary = metrics.report(1, 1);
    assert_eq!(summary.enter_events, 1);
    assert_eq!(summary.exit_events, 1);
    assert_eq!(summary.decode_failures, 0);
    assert!(summary.frames_received >= 6);

    brain.shutdown().await;
    // Registry cleared: the camera sees its connection close
    tokio::time::timeout(Duration::from_secs(3), camera_task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dead_camera_is_soft_disconnected() {
    let metrics = Arc::new(Metrics::new());
    let mut brain = Brain::new(test_config(), Arc::new(ScriptedDetector::new(vec![])), metrics.clone());
    brain.start(TaskKind::Listener).await.unwrap();
    brain.start(TaskKind::Worker).await.unwrap();
    let addr = brain.local_addr(TaskKind::Listener).unwrap();
    let registry = brain.registry().clone();

    let camera = handshake(addr, "cam2").await;
    assert!(wait_for(|| registry.connected_count() == 1).await);
    // Closing the camera makes the next read return zero bytes
    drop(camera);

    assert!(wait_for(|| registry.connected_count() == 0).await);
    assert!(registry.contains(&DeviceId::from("cam2")));
    assert!(metrics.devices_disconnected() >= 1);

    brain.shutdown().await;
}

#[tokio::test]
async fn test_camera_cursor_clamps() {
    let mut brain = Brain::new(
        test_config(),
        Arc::new(ScriptedDetector::new(vec![])),
        Arc::new(Metrics::new()),
    );
    assert!(brain.selected_camera().is_none());

    brain.start(TaskKind::Listener).await.unwrap();
    let addr = brain.local_addr(TaskKind::Listener).unwrap();
    let registry = brain.registry().clone();

    let _a = handshake(addr, "cam-a").await;
    assert!(wait_for(|| registry.len() == 1).await);
    let _b = handshake(addr, "cam-b").await;
    assert!(wait_for(|| registry.len() == 2).await);

    assert_eq!(brain.selected_camera().unwrap().device_id, DeviceId::from("cam-a"));
    assert_eq!(brain.select_next_camera().unwrap().device_id, DeviceId::from("cam-b"));
    assert_eq!(brain.select_next_camera().unwrap().device_id, DeviceId::from("cam-b"));
    assert_eq!(brain.select_prev_camera().unwrap().device_id, DeviceId::from("cam-a"));
    assert_eq!(brain.select_prev_camera().unwrap().device_id, DeviceId::from("cam-a"));
    assert!(brain.selected_camera().unwrap().connected);

    brain.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_detection_overlaps_next_device_but_never_itself() {
    let log: StepLog = Arc::new(Mutex::new(Vec::new()));
    let detector = Arc::new(SlowDetector::new(log.clone(), Duration::from_millis(50)));
    let metrics = Arc::new(Metrics::new());
    let mut brain = Brain::new(test_config(), detector.clone(), metrics.clone());
    brain.start(TaskKind::Listener).await.unwrap();
    let addr = brain.local_addr(TaskKind::Listener).unwrap();
    let registry = brain.registry().clone();

    let cam_a = handshake(addr, "cam-a").await;
    assert!(wait_for(|| registry.len() == 1).await);
    let cam_b = handshake(addr, "cam-b").await;
    assert!(wait_for(|| registry.len() == 2).await);
    let task_a = tokio::spawn(logging_camera(cam_a, solid_jpeg([230, 20, 20]), 'a', log.clone()));
    let task_b = tokio::spawn(logging_camera(cam_b, solid_jpeg([20, 20, 230]), 'b', log.clone()));

    brain.start(TaskKind::Worker).await.unwrap();
    assert!(wait_for(|| detector.calls.load(Ordering::SeqCst) >= 8).await);
    brain.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(3), task_a).await;
    let _ = tokio::time::timeout(Duration::from_secs(3), task_b).await;

    // One detection at a time, process-wide
    assert_eq!(detector.peak.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.decode_failures(), 0);

    let log = log.lock().clone();
    for (me, other) in [('a', 'b'), ('b', 'a')] {
        let requests = positions(&log, Step::Request(me));
        let ends = positions(&log, Step::DetectEnd(me));
        let other_requests = positions(&log, Step::Request(other));
        assert!(ends.len() >= 3, "{me}: {log:?}");

        // Frame k of a device is detected before that device is asked again
        for (k, next_request) in requests.iter().skip(1).enumerate() {
            assert!(ends[k] < *next_request, "{me} frame {k} not joined: {log:?}");
        }

        // The other camera is asked for a frame while this one's is in detection
        let overlapped = ends.iter().enumerate().any(|(k, end)| {
            other_requests.iter().any(|r| *r > requests[k] && *r < *end)
        });
        assert!(overlapped, "{me} never overlapped with {other}: {log:?}");
    }
}

#[tokio::test]
async fn test_discovery_task_advertises_configured_address() {
    let config = test_config().with_discovery_port(0).with_advertise_address("192.168.4.2");
    let detector = Arc::new(ScriptedDetector::new(vec![]));
    let mut brain = Brain::new(config, detector, Arc::new(Metrics::new()));
    brain.start(TaskKind::Discovery).await.unwrap();
    let port = brain.local_addr(TaskKind::Discovery).unwrap().port();

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"brain address?", ("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 64];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"brain address:192.168.4.2");
    assert!(brain.is_running(TaskKind::Discovery));

    brain.shutdown().await;
    assert!(!brain.is_running(TaskKind::Discovery));
}

#[tokio::test]
async fn test_full_event_queue_drops_oldest() {
    let metrics = Arc::new(Metrics::new());
    // Two people appear at once: two enters against a queue of one
    let detector = Arc::new(ScriptedDetector::new(vec![vec![person_at(100.0), person_at(500.0)]]));
    let config = test_config().with_max_pending_events(1);
    let mut brain = Brain::new(config, detector.clone(), metrics.clone());
    brain.start(TaskKind::Listener).await.unwrap();
    let addr = brain.local_addr(TaskKind::Listener).unwrap();
    let registry = brain.registry().clone();

    let _camera = handshake(addr, "cam3").await;
    assert!(wait_for(|| registry.connected_count() == 1).await);

    let pipeline = FramePipeline::new(detector, ZoneClassifier::new(640), 0.6, 0.3, metrics.clone());
    let id = DeviceId::from("cam3");
    let outcome = pipeline.process(&registry, &id, Bytes::from(test_jpeg())).await.unwrap();
    assert_eq!(outcome.enters, 2);
    assert_eq!(outcome.dropped, 1);
    assert_eq!(metrics.events_dropped(), 1);

    // The later enter (right side) is the one kept
    let kept = registry.drain_traffic(&id);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].zone, Zone::Right);

    brain.shutdown().await;
}
