//! Software-timed inference pipeline.
//!
//! VI -> VPSS stays hardware-bound; VPSS -> VENC is unbound and a
//! dedicated frame worker moves frames by hand: acquire YUV, convert to
//! RGB, optionally letterbox + infer + decode + overlay, submit to the
//! encoder, release. The dispatcher fans the encoded output out exactly as
//! in parallel mode.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::detect::registry::DetectorRegistry;
use crate::detect::Detection;
use crate::error::{MediaError, MediaResult};
use crate::hw::session::{IspSession, VencSession, ViSession, ViVpssBind, VpssLayout, VpssSession};
use crate::hw::{EncoderConfig, VideoCore, VPSS_CHN0};
use crate::imgproc::{self, Letterbox};
use crate::overlay::{CpuBlitRenderer, OsdRenderer, OverlayStyle};

use super::dispatcher::{ConsumerRegistration, ConsumerStats, StreamDispatcher};

/// RGB pool depth; four blocks guarantee a non-blocking handoff between
/// the frame worker and the encoder.
const RGB_POOL_BLOCKS: usize = 4;
const RGB_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

/// Overlay back-end selected at pipeline construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayBackend {
    CpuBlit,
    HardwareOsd,
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub width: u32,
    pub height: u32,
    /// Bounded wait for one scaled frame.
    pub frame_timeout: Duration,
    /// Run inference on one out of every N frames; 0 or 1 means every
    /// frame. Skipped frames reuse the last decoded detections.
    pub skip_every_n: u32,
    /// Detector-input channel geometry when no detector is loaded yet.
    pub detect_input: (u32, u32),
    pub overlay: OverlayBackend,
    pub overlay_style: OverlayStyle,
    /// Hardware OSD region budget.
    pub osd_regions: usize,
}

pub struct SerialPipeline {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    dispatcher: StreamDispatcher,
    registry: Arc<DetectorRegistry>,
    frames: Arc<AtomicU64>,
    encoded: Arc<AtomicU64>,
    // Teardown order: encoder, RGB pool, capture unbind, scaler, capture,
    // ISP.
    venc: Arc<VencSession>,
    rgb_pool: BufferPool,
    _bind_vi: ViVpssBind,
    vpss: Arc<VpssSession>,
    _vi: ViSession,
    _isp: IspSession,
    cfg: SerialConfig,
    core: Arc<dyn VideoCore>,
}

impl SerialPipeline {
    pub fn new(
        core: Arc<dyn VideoCore>,
        registry: Arc<DetectorRegistry>,
        encoder: EncoderConfig,
        cfg: SerialConfig,
    ) -> MediaResult<Self> {
        let (width, height) = (cfg.width, cfg.height);
        // The detector channel follows a loaded model's input size, else
        // the configured default.
        let detect_input = registry.input_size().unwrap_or(cfg.detect_input);

        let isp = IspSession::new(Arc::clone(&core), 0)?;
        let vi = ViSession::new(Arc::clone(&core), 0, 0, width, height)?;
        let vpss = Arc::new(VpssSession::new(
            Arc::clone(&core),
            0,
            &VpssLayout {
                in_width: width,
                in_height: height,
                // User-readable full-resolution tap; nothing is bound to
                // the encoder in this mode.
                chn0: (width, height, 2),
                chn1: Some(detect_input),
            },
        )?);
        let bind_vi = ViVpssBind::new(Arc::clone(&core), &vi, &vpss)?;
        let venc = Arc::new(VencSession::new(Arc::clone(&core), 0, encoder)?);
        let rgb_pool = BufferPool::create("rgb", (width * height * 3) as usize, RGB_POOL_BLOCKS)?;

        registry.note_dims(detect_input.0, detect_input.1);
        let resize_target = Arc::clone(&vpss);
        registry.set_on_resize(Box::new(move |w, h| resize_target.reconfigure_chn1(w, h)));

        let dispatcher = StreamDispatcher::new(Arc::clone(&venc));
        info!(width, height, detect_w = detect_input.0, detect_h = detect_input.1,
            "serial pipeline constructed");
        Ok(Self {
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            dispatcher,
            registry,
            frames: Arc::new(AtomicU64::new(0)),
            encoded: Arc::new(AtomicU64::new(0)),
            venc,
            rgb_pool,
            _bind_vi: bind_vi,
            vpss,
            _vi: vi,
            _isp: isp,
            cfg,
            core,
        })
    }

    pub fn register_consumer(&mut self, reg: ConsumerRegistration) {
        self.dispatcher.add_consumer(reg);
    }

    pub async fn remove_consumer(&mut self, name: &str) {
        self.dispatcher.remove_consumer(name).await;
    }

    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        self.running.store(true, Ordering::Release);
        self.dispatcher.start();
        let ctx = FrameLoop {
            running: Arc::clone(&self.running),
            vpss: Arc::clone(&self.vpss),
            venc: Arc::clone(&self.venc),
            rgb_pool: self.rgb_pool.clone(),
            registry: Arc::clone(&self.registry),
            renderer: CpuBlitRenderer::new(self.cfg.overlay_style.clone()),
            osd: match self.cfg.overlay {
                OverlayBackend::HardwareOsd => Some(OsdRenderer::new(
                    Arc::clone(&self.core),
                    self.venc.chn(),
                    self.cfg.osd_regions,
                )),
                OverlayBackend::CpuBlit => None,
            },
            cfg: self.cfg.clone(),
            frames: Arc::clone(&self.frames),
            encoded: Arc::clone(&self.encoded),
        };
        self.worker = Some(tokio::task::spawn_blocking(move || ctx.run()));
        info!("serial pipeline started");
    }

    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.rgb_pool.close();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        self.venc.stop_recv();
        self.dispatcher.stop().await;
        self.registry.clear_on_resize();
        info!(
            frames = self.frames.load(Ordering::Acquire),
            encoded = self.encoded.load(Ordering::Acquire),
            "serial pipeline stopped"
        );
    }

    pub fn consumer_stats(&self) -> Vec<ConsumerStats> {
        self.dispatcher.stats()
    }

    pub fn packets_fetched(&self) -> u64 {
        self.dispatcher.packets_fetched()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn rgb_outstanding(&self) -> usize {
        self.rgb_pool.outstanding()
    }
}

impl Drop for SerialPipeline {
    fn drop(&mut self) {
        // The resize callback captures the scaler session; a dropped
        // pipeline must not keep it alive through the registry.
        self.registry.clear_on_resize();
    }
}

struct FrameLoop {
    running: Arc<AtomicBool>,
    vpss: Arc<VpssSession>,
    venc: Arc<VencSession>,
    rgb_pool: BufferPool,
    registry: Arc<DetectorRegistry>,
    renderer: CpuBlitRenderer,
    osd: Option<OsdRenderer>,
    cfg: SerialConfig,
    frames: Arc<AtomicU64>,
    encoded: Arc<AtomicU64>,
}

impl FrameLoop {
    fn run(self) {
        debug!("frame worker started");
        let rgb_bytes = (self.cfg.width * self.cfg.height * 3) as usize;
        let infer_period = self.cfg.skip_every_n.max(1) as u64;
        let mut tick = 0u64;
        let mut last_dets: Vec<Detection> = Vec::new();
        while self.running.load(Ordering::Acquire) {
            let frame = match self.vpss.acquire_frame(VPSS_CHN0, self.cfg.frame_timeout) {
                Ok(f) => f,
                Err(e) if e.is_transient() => continue,
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        warn!(error = %e, "frame acquire failed");
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    continue;
                }
            };
            let mut rgb = match self.rgb_pool.acquire_timeout(rgb_bytes, RGB_ACQUIRE_TIMEOUT) {
                Ok(h) => h,
                Err(MediaError::Cancelled) => {
                    self.vpss.release_frame(VPSS_CHN0, frame);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "rgb block unavailable, dropping frame");
                    self.vpss.release_frame(VPSS_CHN0, frame);
                    continue;
                }
            };
            if let Some(dst) = rgb.data_mut() {
                imgproc::nv12_to_rgb(
                    frame.handle.data(),
                    frame.width,
                    frame.height,
                    frame.stride,
                    dst,
                );
            }

            let infer_now = tick % infer_period == 0;
            tick += 1;
            if infer_now {
                match self.run_inference(rgb.data(), frame.width, frame.height) {
                    Some(dets) => last_dets = dets,
                    // No detector loaded: stale boxes must not linger.
                    None => last_dets.clear(),
                }
            }

            if !last_dets.is_empty() || self.osd.is_some() {
                match &self.osd {
                    Some(osd) => osd.update(&last_dets),
                    None => {
                        if let Some(dst) = rgb.data_mut() {
                            self.renderer.draw(dst, frame.width, frame.height, &last_dets);
                        }
                    }
                }
            }

            match self.venc.send_frame(&rgb, frame.pts_us) {
                Ok(()) => {
                    self.encoded.fetch_add(1, Ordering::AcqRel);
                }
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        warn!(error = %e, "encoder refused frame");
                    }
                }
            }
            // The encoder holds its own reference now; ours goes back to
            // the pool immediately.
            drop(rgb);
            self.vpss.release_frame(VPSS_CHN0, frame);
            self.frames.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(osd) = &self.osd {
            osd.clear();
        }
        debug!("frame worker exited");
    }

    /// Letterboxes the frame into the detector input, infers, decodes, and
    /// maps detections back to frame coordinates. `None` when no detector
    /// is active.
    fn run_inference(&self, rgb: &[u8], width: u32, height: u32) -> Option<Vec<Detection>> {
        self.registry.with_active(|det| {
            let (mw, mh) = det.input_size();
            let lb = Letterbox::compute(width, height, mw, mh);
            imgproc::letterbox_rgb(rgb, &lb, det.input_region());
            if let Err(e) = det.infer() {
                warn!(error = %e, "inference failed");
                return Vec::new();
            }
            det.decode().iter().map(|d| d.to_frame(&lb)).collect()
        })
    }
}
