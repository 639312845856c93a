//! End-to-end scenarios against the software media core.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;

use ipcam_core::config::Config;
use ipcam_core::control::{ControlPlane, NoSignaling};
use ipcam_core::detect::registry::DetectorRegistry;
use ipcam_core::detect::yolo::{self, YoloDetector};
use ipcam_core::detect::npu::SimNpu;
use ipcam_core::detect::{Detector, DetectorKind};
use ipcam_core::hw::session::MpiSystem;
use ipcam_core::hw::sim::SimCore;
use ipcam_core::hw::VideoCore;
use ipcam_core::overlay::OverlayStyle;
use ipcam_core::pipeline::dispatcher::{ConsumerRegistration, EncodedPacket};
use ipcam_core::pipeline::manager::{PipelineManager, PipelineMode};
use ipcam_core::pipeline::serial::{OverlayBackend, SerialConfig, SerialPipeline};
use ipcam_core::sink::recorder::{AnnexBMuxer, Recorder};
use ipcam_core::hw::Codec;

fn write_model_files(dir: &Path) {
    std::fs::write(dir.join("yolov5.rknn"), b"yolov5-sim-model").unwrap();
    std::fs::write(dir.join("retinaface.rknn"), b"retinaface-sim-model").unwrap();
}

fn test_config(fps: u32, initial: &str, model_dir: &Path, record_dir: &Path) -> Config {
    Config::from_str(&format!(
        r#"
[video]
width = 320
height = 240
fps = {fps}

[encoder]
codec = "h264"
bitrate_kbps = 2048

[pipeline]
initial_mode = "{initial}"

[detect]
model_dir = "{model}"
yolo_input = [640, 640]
retinaface_input = [320, 320]

[record]
dir = "{record}"
"#,
        fps = fps,
        initial = initial,
        model = model_dir.display(),
        record = record_dir.display(),
    ))
    .unwrap()
}

struct Rig {
    core: Arc<SimCore>,
    _mpi: MpiSystem,
    manager: Arc<PipelineManager>,
}

fn rig(fps: u32, initial: &str, model_dir: &Path, record_dir: &Path) -> Rig {
    let core = Arc::new(SimCore::new(fps));
    let dyn_core: Arc<dyn VideoCore> = core.clone();
    let mpi = MpiSystem::new(dyn_core.clone()).unwrap();
    let cfg = test_config(fps, initial, model_dir, record_dir);
    let manager = Arc::new(PipelineManager::new(dyn_core, cfg));
    Rig {
        core,
        _mpi: mpi,
        manager,
    }
}

fn counting_consumer(
    name: &str,
    capacity: usize,
) -> (ConsumerRegistration, Arc<Mutex<Vec<EncodedPacket>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let reg = ConsumerRegistration::queued(
        name,
        capacity,
        Arc::new(move |pkt: &EncodedPacket| {
            sink.lock().push(pkt.clone());
            Ok(())
        }),
    );
    (reg, seen)
}

/// Scenario 1: cold boot in parallel mode, one recording consumer with
/// queue capacity 5, 3 seconds at 30 fps.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cold_boot_parallel_single_recorder() {
    let models = tempfile::tempdir().unwrap();
    let records = tempfile::tempdir().unwrap();
    write_model_files(models.path());
    let rig = rig(30, "parallel", models.path(), records.path());

    let target = records.path().join("a.h264");
    let recorder = Recorder::create_at(&target, Box::new(AnnexBMuxer::new(Codec::H264))).unwrap();
    rig.manager
        .register_consumer(recorder.consumer("recorder", 5))
        .await;
    rig.manager.start().await.unwrap();
    sleep(Duration::from_secs(3)).await;

    let status = rig.manager.status().await;
    rig.manager.stop().await;
    let path = recorder.close().unwrap();

    let packets = recorder.packets_written();
    assert!(
        (75..=110).contains(&packets),
        "expected roughly 90 packets, got {}",
        packets
    );
    // First written packet is a keyframe whose first NAL is the SPS.
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..5], &[0, 0, 0, 1, 0x67]);
    let rec_stats = status
        .consumers
        .iter()
        .find(|c| c.name == "recorder")
        .expect("recorder visible in status");
    assert_eq!(rec_stats.dropped, 0);
}

/// Scenario 2: cold swap parallel -> serial with a face detector; peers
/// survive and the new pipeline opens on a keyframe.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cold_swap_parallel_to_serial_with_detector() {
    let models = tempfile::tempdir().unwrap();
    let records = tempfile::tempdir().unwrap();
    write_model_files(models.path());
    let rig = rig(60, "parallel", models.path(), records.path());

    let (reg, seen) = counting_consumer("peer", 256);
    rig.manager.register_consumer(reg).await;
    rig.manager.start().await.unwrap();
    sleep(Duration::from_secs(1)).await;

    rig.manager.switch_mode(PipelineMode::Serial).await.unwrap();
    rig.manager
        .switch_detector(Some(DetectorKind::RetinaFace))
        .await
        .unwrap();
    sleep(Duration::from_secs(1)).await;
    let swaps = rig.manager.swap_count().await;
    rig.manager.stop().await;

    assert_eq!(swaps, 2, "two distinct pipeline lifecycles");
    let seen = seen.lock();
    // The encoder sequence restarts exactly once, at the swap boundary,
    // and the first packet of the new lifecycle is a keyframe. No packet
    // of the new pipeline precedes packets of the old one.
    let resets: Vec<usize> = seen
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[1].seq < w[0].seq)
        .map(|(i, _)| i + 1)
        .collect();
    assert_eq!(resets.len(), 1, "expected one lifecycle boundary");
    assert!(seen[resets[0]].is_keyframe, "first packet after swap must be a keyframe");
    assert!(resets[0] >= 10, "old pipeline must have produced packets");
    assert!(seen.len() - resets[0] >= 10, "new pipeline must have produced packets");
}

/// Scenario 3: a slow consumer cannot reduce the fetch loop's throughput;
/// it only sheds its own load.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn slow_consumer_isolation() {
    let models = tempfile::tempdir().unwrap();
    let records = tempfile::tempdir().unwrap();
    write_model_files(models.path());
    let rig = rig(30, "parallel", models.path(), records.path());

    let (fast_reg, fast_seen) = counting_consumer("fast", 32);
    let slow_calls = Arc::new(AtomicU64::new(0));
    let slow_calls2 = Arc::clone(&slow_calls);
    let slow_reg = ConsumerRegistration::queued(
        "slow",
        5,
        Arc::new(move |_pkt: &EncodedPacket| {
            slow_calls2.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        }),
    );
    rig.manager.register_consumer(fast_reg).await;
    rig.manager.register_consumer(slow_reg).await;
    rig.manager.start().await.unwrap();
    sleep(Duration::from_millis(10_400)).await;
    let status = rig.manager.status().await;
    rig.manager.stop().await;

    let fast = fast_seen.lock().len() as u64;
    assert!(fast >= 290, "fast consumer starved: {}", fast);
    assert!(slow_calls.load(Ordering::SeqCst) >= 10, "slow consumer still progresses");
    let slow = status.consumers.iter().find(|c| c.name == "slow").unwrap();
    assert!(slow.dropped >= 200, "slow consumer dropped {}", slow.dropped);
    let fast_stats = status.consumers.iter().find(|c| c.name == "fast").unwrap();
    assert_eq!(fast_stats.dropped, 0);
}

/// Scenario 4: a detector swap that changes the input size reconfigures
/// the scaler's detector channel exactly once, with the new geometry.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn detector_resize_reconfigures_chn1_once() {
    let models = tempfile::tempdir().unwrap();
    let records = tempfile::tempdir().unwrap();
    write_model_files(models.path());
    let rig = rig(60, "serial", models.path(), records.path());
    rig.manager.start().await.unwrap();

    rig.manager
        .switch_detector(Some(DetectorKind::Yolo))
        .await
        .unwrap();
    let before: Vec<(u32, u32, u32)> = rig
        .core
        .chn_enable_log()
        .into_iter()
        .filter(|(chn, _, _)| *chn == 1)
        .collect();
    assert_eq!(before, vec![(1, 640, 640)], "yolo keeps the initial geometry");

    rig.manager
        .switch_detector(Some(DetectorKind::RetinaFace))
        .await
        .unwrap();
    sleep(Duration::from_millis(300)).await;
    rig.manager.stop().await;

    let chn1: Vec<(u32, u32, u32)> = rig
        .core
        .chn_enable_log()
        .into_iter()
        .filter(|(chn, _, _)| *chn == 1)
        .collect();
    assert_eq!(
        chn1,
        vec![(1, 640, 640), (1, 320, 320)],
        "exactly one reconfiguration, straight to the new size"
    );
}

/// Scenario 5: malformed control datagrams answer with an error and change
/// nothing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_control_datagram_yields_error() {
    let models = tempfile::tempdir().unwrap();
    let records = tempfile::tempdir().unwrap();
    write_model_files(models.path());
    let rig = rig(30, "parallel", models.path(), records.path());

    let control = ControlPlane::bind(0, Arc::clone(&rig.manager), Arc::new(NoSignaling))
        .await
        .unwrap();
    let addr = control.local_addr().unwrap();
    tokio::spawn(control.run());

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"@@@not-json@@@", ("127.0.0.1", addr.port()))
        .await
        .unwrap();
    let mut buf = [0u8; 2048];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("control must reply")
        .unwrap();
    let reply: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
    assert_eq!(reply["type"], "error");

    let status = rig.manager.status().await;
    assert_eq!(status.mode, "parallel");
    assert_eq!(status.detector, None);
}

/// Scenario 6: stopping the serial pipeline mid-inference returns within a
/// bounded grace window, leaks nothing, and the hardware can be
/// re-initialized immediately.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_mid_inference_releases_everything() {
    let models = tempfile::tempdir().unwrap();
    write_model_files(models.path());
    let core = Arc::new(SimCore::new(120));
    let dyn_core: Arc<dyn VideoCore> = core.clone();
    let _mpi = MpiSystem::new(dyn_core.clone()).unwrap();

    let model_path = models.path().join("yolov5.rknn");
    let registry = Arc::new(DetectorRegistry::new(Box::new(move |_| {
        let (desc, fills) = yolo::sim_model(640, 640);
        YoloDetector::load(Box::new(SimNpu::new(desc, fills)), &model_path, 0.25, 0.45)
            .map(|d| Box::new(d) as Box<dyn Detector>)
    })));

    let serial_cfg = SerialConfig {
        width: 320,
        height: 240,
        frame_timeout: Duration::from_millis(100),
        skip_every_n: 0,
        detect_input: (640, 640),
        overlay: OverlayBackend::CpuBlit,
        overlay_style: OverlayStyle::default(),
        osd_regions: 8,
    };
    let enc = test_config(120, "serial", models.path(), models.path())
        .encoder_config(ipcam_core::hw::PixelFormat::Rgb888);

    for round in 0..2 {
        let mut pipeline = SerialPipeline::new(
            dyn_core.clone(),
            Arc::clone(&registry),
            enc.clone(),
            serial_cfg.clone(),
        )
        .unwrap();
        registry.swap(DetectorKind::Yolo).unwrap();
        let (reg, seen) = counting_consumer("sink", 64);
        pipeline.register_consumer(reg);
        pipeline.start();
        sleep(Duration::from_millis(800)).await;
        assert!(pipeline.frames_processed() > 5, "round {}: frames flowing", round);

        let stopped = tokio::time::timeout(Duration::from_secs(3), pipeline.stop()).await;
        assert!(stopped.is_ok(), "round {}: stop must return within the grace window", round);
        assert_eq!(pipeline.rgb_outstanding(), 0, "round {}: rgb pool drained", round);
        assert!(!seen.lock().is_empty(), "round {}: consumer saw packets", round);
        drop(pipeline);
        // Re-initialization succeeding immediately proves no session leaked.
    }
}

/// `switch_mode` to the current mode is a no-op: no extra pipeline
/// lifecycle is created.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn switch_mode_to_same_mode_is_noop() {
    let models = tempfile::tempdir().unwrap();
    let records = tempfile::tempdir().unwrap();
    write_model_files(models.path());
    let rig = rig(60, "parallel", models.path(), records.path());
    rig.manager.start().await.unwrap();
    let before = rig.manager.swap_count().await;
    rig.manager.switch_mode(PipelineMode::Parallel).await.unwrap();
    assert_eq!(rig.manager.swap_count().await, before);
    rig.manager.stop().await;
}

/// Record start/stop manages the recorder consumer dynamically and
/// finalizes the file atomically.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn record_start_stop_roundtrip() {
    let models = tempfile::tempdir().unwrap();
    let records = tempfile::tempdir().unwrap();
    write_model_files(models.path());
    let rig = rig(60, "parallel", models.path(), records.path());
    rig.manager.start().await.unwrap();

    rig.manager.record_start().await.unwrap();
    sleep(Duration::from_millis(600)).await;
    rig.manager.record_stop().await.unwrap();
    rig.manager.stop().await;

    let files: Vec<_> = std::fs::read_dir(records.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    assert_eq!(files.len(), 1, "one finished recording, no staging file: {:?}", files);
    assert_eq!(files[0].extension().and_then(|e| e.to_str()), Some("h264"));
    let bytes = std::fs::read(&files[0]).unwrap();
    assert!(!bytes.is_empty());
    assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
}

/// Detector switching outside serial mode is refused.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn detector_switch_requires_serial_mode() {
    let models = tempfile::tempdir().unwrap();
    let records = tempfile::tempdir().unwrap();
    write_model_files(models.path());
    let rig = rig(30, "parallel", models.path(), records.path());
    rig.manager.start().await.unwrap();
    let err = rig
        .manager
        .switch_detector(Some(DetectorKind::Yolo))
        .await
        .unwrap_err();
    assert!(matches!(err, ipcam_core::MediaError::InvalidState(_)));
    rig.manager.stop().await;
}

/// A missing model file surfaces `ModelLoad`; the cold-swap cell lands in
/// `Empty` and the pipeline keeps running without inference.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_model_load_reports_and_degrades_gracefully() {
    let models = tempfile::tempdir().unwrap();
    let records = tempfile::tempdir().unwrap();
    // Only the yolo model exists.
    std::fs::write(models.path().join("yolov5.rknn"), b"yolov5-sim-model").unwrap();
    let rig = rig(60, "serial", models.path(), records.path());
    rig.manager.start().await.unwrap();
    rig.manager
        .switch_detector(Some(DetectorKind::Yolo))
        .await
        .unwrap();
    let err = rig
        .manager
        .switch_detector(Some(DetectorKind::RetinaFace))
        .await
        .unwrap_err();
    assert!(matches!(err, ipcam_core::MediaError::ModelLoad(_)));
    let status = rig.manager.status().await;
    assert!(status.running, "pipeline keeps producing without inference");
    assert_eq!(status.detector, None);
    rig.manager.stop().await;
}
