//! Pipeline ownership and cold reconfiguration.
//!
//! The manager owns at most one pipeline at any observable moment. A mode
//! swap stops the active pipeline, drops every hardware session, builds
//! the target pipeline, replays the saved consumer registrations, and
//! starts it. Consumers registered while no pipeline exists are buffered
//! and attached on the next start.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::detect::npu::SimNpu;
use crate::detect::registry::{DetectorFactory, DetectorRegistry};
use crate::detect::retinaface::RetinaFaceDetector;
use crate::detect::yolo::YoloDetector;
use crate::detect::{retinaface, yolo, Detector, DetectorKind};
use crate::error::{MediaError, MediaResult};
use crate::hw::VideoCore;
use crate::sink::recorder::{AnnexBMuxer, Recorder};

use super::dispatcher::{ConsumerRegistration, ConsumerStats};
use super::parallel::ParallelPipeline;
use super::serial::SerialPipeline;

const RECORDER_CONSUMER: &str = "recorder";
const RECORDER_QUEUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Hardware-bound, no inference.
    Parallel,
    /// Software-timed frame loop with inference.
    Serial,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::Parallel => "parallel",
            PipelineMode::Serial => "serial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "parallel" => Some(PipelineMode::Parallel),
            "serial" => Some(PipelineMode::Serial),
            _ => None,
        }
    }
}

enum Active {
    Parallel(ParallelPipeline),
    Serial(SerialPipeline),
}

impl Active {
    fn register_consumer(&mut self, reg: ConsumerRegistration) {
        match self {
            Active::Parallel(p) => p.register_consumer(reg),
            Active::Serial(p) => p.register_consumer(reg),
        }
    }

    async fn remove_consumer(&mut self, name: &str) {
        match self {
            Active::Parallel(p) => p.remove_consumer(name).await,
            Active::Serial(p) => p.remove_consumer(name).await,
        }
    }

    fn start(&mut self) {
        match self {
            Active::Parallel(p) => p.start(),
            Active::Serial(p) => p.start(),
        }
    }

    async fn stop(&mut self) {
        match self {
            Active::Parallel(p) => p.stop().await,
            Active::Serial(p) => p.stop().await,
        }
    }

    fn consumer_stats(&self) -> Vec<ConsumerStats> {
        match self {
            Active::Parallel(p) => p.consumer_stats(),
            Active::Serial(p) => p.consumer_stats(),
        }
    }

    fn packets_fetched(&self) -> u64 {
        match self {
            Active::Parallel(p) => p.packets_fetched(),
            Active::Serial(p) => p.packets_fetched(),
        }
    }
}

struct Inner {
    mode: PipelineMode,
    active: Option<Active>,
    consumers: Vec<ConsumerRegistration>,
    degraded: Option<String>,
    swap_count: u64,
    recorder: Option<Arc<Recorder>>,
}

/// Status surface snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub mode: &'static str,
    pub detector: Option<&'static str>,
    pub running: bool,
    pub degraded: Option<String>,
    pub recording: bool,
    pub swap_count: u64,
    pub packets: u64,
    pub consumers: Vec<ConsumerStats>,
}

pub struct PipelineManager {
    core: Arc<dyn VideoCore>,
    cfg: Config,
    registry: Arc<DetectorRegistry>,
    inner: Mutex<Inner>,
}

impl PipelineManager {
    pub fn new(core: Arc<dyn VideoCore>, cfg: Config) -> Self {
        let registry = Arc::new(DetectorRegistry::new(detector_factory(&cfg)));
        Self {
            core,
            registry,
            inner: Mutex::new(Inner {
                mode: cfg.pipeline.initial_mode,
                active: None,
                consumers: Vec::new(),
                degraded: None,
                swap_count: 0,
                recorder: None,
            }),
            cfg,
        }
    }

    pub fn registry(&self) -> &Arc<DetectorRegistry> {
        &self.registry
    }

    /// Builds and starts the initial pipeline.
    pub async fn start(&self) -> MediaResult<()> {
        let mut g = self.inner.lock().await;
        if g.active.is_some() {
            return Ok(());
        }
        let mode = g.mode;
        self.bring_up(&mut g, mode)
    }

    /// Stops and drops the active pipeline; consumers stay registered.
    pub async fn stop(&self) {
        let mut g = self.inner.lock().await;
        if let Some(mut active) = g.active.take() {
            active.stop().await;
        }
        info!("pipeline manager stopped");
    }

    /// Cold mode swap. A no-op when the target is already running.
    pub async fn switch_mode(&self, target: PipelineMode) -> MediaResult<()> {
        let mut g = self.inner.lock().await;
        if target == g.mode && g.active.is_some() {
            return Ok(());
        }
        info!(from = g.mode.as_str(), to = target.as_str(), "mode switch");
        if let Some(mut active) = g.active.take() {
            active.stop().await;
            // All hardware sessions and pools are released here, before the
            // target pipeline may claim them.
            drop(active);
        }
        self.bring_up(&mut g, target)
    }

    /// Loads or unloads the detector. Loading requires serial mode; on an
    /// input-size change the registry's resize callback reprograms the
    /// scaler's detector channel.
    pub async fn switch_detector(&self, kind: Option<DetectorKind>) -> MediaResult<()> {
        let g = self.inner.lock().await;
        match kind {
            None => {
                self.registry.unload();
                Ok(())
            }
            Some(kind) => {
                if g.mode != PipelineMode::Serial || g.active.is_none() {
                    return Err(MediaError::InvalidState(
                        "detector switch requires a running serial pipeline".into(),
                    ));
                }
                self.registry.swap(kind)
            }
        }
    }

    /// Registers a consumer; it is saved across swaps, and attached to the
    /// live dispatcher when a pipeline is running.
    pub async fn register_consumer(&self, reg: ConsumerRegistration) {
        let mut g = self.inner.lock().await;
        if let Some(active) = g.active.as_mut() {
            active.register_consumer(reg.clone());
        }
        g.consumers.push(reg);
    }

    pub async fn record_start(&self) -> MediaResult<()> {
        let mut g = self.inner.lock().await;
        if g.recorder.is_some() {
            return Ok(());
        }
        let recorder = Recorder::create_in(
            &self.cfg.record.dir,
            Box::new(AnnexBMuxer::new(self.cfg.encoder.codec())),
        )
        .map_err(|e| MediaError::ResourceExhausted(format!("recorder: {}", e)))?;
        let reg = recorder.consumer(RECORDER_CONSUMER, RECORDER_QUEUE);
        if let Some(active) = g.active.as_mut() {
            active.register_consumer(reg.clone());
        }
        g.consumers.push(reg);
        g.recorder = Some(recorder);
        info!("recording started");
        Ok(())
    }

    pub async fn record_stop(&self) -> MediaResult<()> {
        let mut g = self.inner.lock().await;
        let recorder = match g.recorder.take() {
            Some(r) => r,
            None => return Ok(()),
        };
        g.consumers.retain(|c| c.name != RECORDER_CONSUMER);
        if let Some(active) = g.active.as_mut() {
            active.remove_consumer(RECORDER_CONSUMER).await;
        }
        match recorder.close() {
            Ok(path) => info!(path = %path.display(), "recording finished"),
            Err(e) => warn!(error = %e, "recording finalize failed"),
        }
        Ok(())
    }

    pub async fn status(&self) -> StatusSnapshot {
        let g = self.inner.lock().await;
        StatusSnapshot {
            mode: g.mode.as_str(),
            detector: self.registry.current().map(|k| k.as_str()),
            running: g.active.is_some(),
            degraded: g.degraded.clone(),
            recording: g.recorder.is_some(),
            swap_count: g.swap_count,
            packets: g.active.as_ref().map(|a| a.packets_fetched()).unwrap_or(0),
            consumers: g.active.as_ref().map(|a| a.consumer_stats()).unwrap_or_default(),
        }
    }

    pub async fn mode(&self) -> PipelineMode {
        self.inner.lock().await.mode
    }

    pub async fn swap_count(&self) -> u64 {
        self.inner.lock().await.swap_count
    }

    fn build(&self, mode: PipelineMode) -> MediaResult<Active> {
        match mode {
            PipelineMode::Parallel => Ok(Active::Parallel(ParallelPipeline::new(
                Arc::clone(&self.core),
                self.cfg.encoder_config(crate::hw::PixelFormat::Nv12),
            )?)),
            PipelineMode::Serial => Ok(Active::Serial(SerialPipeline::new(
                Arc::clone(&self.core),
                Arc::clone(&self.registry),
                self.cfg.encoder_config(crate::hw::PixelFormat::Rgb888),
                self.cfg.serial_config(),
            )?)),
        }
    }

    fn bring_up(&self, g: &mut Inner, mode: PipelineMode) -> MediaResult<()> {
        match self.build(mode) {
            Ok(mut pipeline) => {
                for reg in &g.consumers {
                    pipeline.register_consumer(reg.clone());
                }
                pipeline.start();
                g.active = Some(pipeline);
                g.mode = mode;
                g.degraded = None;
                g.swap_count += 1;
                info!(mode = mode.as_str(), "pipeline running");
                Ok(())
            }
            Err(e) => {
                // Degraded: no pipeline, consumers kept for the next
                // successful start.
                error!(mode = mode.as_str(), error = %e, "pipeline start failed");
                g.degraded = Some(e.to_string());
                Err(MediaError::StartFailed(e.to_string()))
            }
        }
    }
}

fn detector_factory(cfg: &Config) -> DetectorFactory {
    let detect = cfg.detect.clone();
    Box::new(move |kind| match kind {
        DetectorKind::Yolo => {
            let (desc, fills) = yolo::sim_model(detect.yolo_input[0], detect.yolo_input[1]);
            let npu = SimNpu::new(desc, fills);
            YoloDetector::load(
                Box::new(npu),
                &detect.model_dir.join("yolov5.rknn"),
                detect.score_thresh,
                detect.iou_thresh,
            )
            .map(|d| Box::new(d) as Box<dyn Detector>)
        }
        DetectorKind::RetinaFace => {
            let (desc, fills) =
                retinaface::sim_model(detect.retinaface_input[0], detect.retinaface_input[1]);
            let npu = SimNpu::new(desc, fills);
            RetinaFaceDetector::load(
                Box::new(npu),
                &detect.model_dir.join("retinaface.rknn"),
                detect.face_score_thresh,
                detect.face_iou_thresh,
            )
            .map(|d| Box::new(d) as Box<dyn Detector>)
        }
    })
}
