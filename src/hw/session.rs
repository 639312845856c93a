//! Scoped hardware sessions.
//!
//! Each media domain is wrapped in a guard whose constructor performs the
//! vendor enable dance and whose `Drop` performs the exact reverse.
//! Pipelines declare session fields in reverse construction order so the
//! implicit field-drop order tears the chain down back-to-front.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::BufferHandle;
use crate::error::{MediaError, MediaResult};

use super::{EncoderConfig, HwResult, RawFrame, VideoCore, VPSS_CHN1};

/// Whole-SDK lifetime guard; one per process.
pub struct MpiSystem {
    core: Arc<dyn VideoCore>,
}

impl MpiSystem {
    pub fn new(core: Arc<dyn VideoCore>) -> MediaResult<Self> {
        core.sys_init()?;
        Ok(Self { core })
    }
}

impl Drop for MpiSystem {
    fn drop(&mut self) {
        self.core.sys_exit();
    }
}

/// ISP autoexposure runtime for one sensor.
pub struct IspSession {
    core: Arc<dyn VideoCore>,
    cam_id: u32,
}

impl IspSession {
    pub fn new(core: Arc<dyn VideoCore>, cam_id: u32) -> MediaResult<Self> {
        core.isp_init(cam_id)?;
        debug!(cam = cam_id, "isp session up");
        Ok(Self { core, cam_id })
    }
}

impl Drop for IspSession {
    fn drop(&mut self) {
        if let Err(e) = self.core.isp_stop(self.cam_id) {
            warn!(cam = self.cam_id, error = %e, "isp stop failed");
        }
    }
}

/// Video-input device + channel.
pub struct ViSession {
    core: Arc<dyn VideoCore>,
    dev: u32,
    chn: u32,
}

impl ViSession {
    pub fn new(core: Arc<dyn VideoCore>, dev: u32, chn: u32, width: u32, height: u32) -> MediaResult<Self> {
        core.vi_enable(dev, chn, width, height)?;
        debug!(dev, chn, width, height, "vi session up");
        Ok(Self { core, dev, chn })
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn chn(&self) -> u32 {
        self.chn
    }
}

impl Drop for ViSession {
    fn drop(&mut self) {
        if let Err(e) = self.core.vi_disable(self.dev, self.chn) {
            warn!(dev = self.dev, chn = self.chn, error = %e, "vi disable failed");
        }
    }
}

/// Layout of the scaler group's two output taps.
#[derive(Debug, Clone)]
pub struct VpssLayout {
    pub in_width: u32,
    pub in_height: u32,
    /// Full-resolution tap: `(width, height, depth)`. Depth 0 binds it to
    /// the encoder; depth > 0 makes it user-readable.
    pub chn0: (u32, u32, u32),
    /// Optional detector-input tap; always user-readable (depth 2).
    pub chn1: Option<(u32, u32)>,
}

const CHN1_DEPTH: u32 = 2;

/// Scaler group with up to two output channels.
pub struct VpssSession {
    core: Arc<dyn VideoCore>,
    grp: u32,
    chn1: Mutex<Option<(u32, u32)>>,
}

impl VpssSession {
    pub fn new(core: Arc<dyn VideoCore>, grp: u32, layout: &VpssLayout) -> MediaResult<Self> {
        core.vpss_create(grp, layout.in_width, layout.in_height)?;
        let (w0, h0, d0) = layout.chn0;
        if let Err(e) = core.vpss_enable_chn(grp, 0, w0, h0, d0) {
            let _ = core.vpss_destroy(grp);
            return Err(e.into());
        }
        if let Some((w1, h1)) = layout.chn1 {
            if let Err(e) = core.vpss_enable_chn(grp, VPSS_CHN1, w1, h1, CHN1_DEPTH) {
                let _ = core.vpss_disable_chn(grp, 0);
                let _ = core.vpss_destroy(grp);
                return Err(e.into());
            }
        }
        if let Err(e) = core.vpss_start(grp) {
            if layout.chn1.is_some() {
                let _ = core.vpss_disable_chn(grp, VPSS_CHN1);
            }
            let _ = core.vpss_disable_chn(grp, 0);
            let _ = core.vpss_destroy(grp);
            return Err(e.into());
        }
        debug!(grp, chn0 = ?layout.chn0, chn1 = ?layout.chn1, "vpss session up");
        Ok(Self {
            core,
            grp,
            chn1: Mutex::new(layout.chn1),
        })
    }

    pub fn grp(&self) -> u32 {
        self.grp
    }

    pub fn chn1_size(&self) -> Option<(u32, u32)> {
        *self.chn1.lock()
    }

    /// Disables, reconfigures and re-enables the detector-input channel.
    /// On failure the channel is left disabled and the failing step's error
    /// is reported.
    pub fn reconfigure_chn1(&self, width: u32, height: u32) -> MediaResult<()> {
        let mut chn1 = self.chn1.lock();
        if chn1.is_some() {
            if let Err(e) = self.core.vpss_disable_chn(self.grp, VPSS_CHN1) {
                *chn1 = None;
                return Err(MediaError::ResizeFailed(e.to_string()));
            }
            *chn1 = None;
        }
        match self.core.vpss_enable_chn(self.grp, VPSS_CHN1, width, height, CHN1_DEPTH) {
            Ok(()) => {
                *chn1 = Some((width, height));
                debug!(grp = self.grp, width, height, "vpss chn1 reconfigured");
                Ok(())
            }
            Err(e) => Err(MediaError::ResizeFailed(e.to_string())),
        }
    }

    pub fn acquire_frame(&self, chn: u32, timeout: Duration) -> HwResult<RawFrame> {
        self.core.vpss_acquire_frame(self.grp, chn, timeout)
    }

    pub fn release_frame(&self, chn: u32, frame: RawFrame) {
        if let Err(e) = self.core.vpss_release_frame(self.grp, chn, frame) {
            warn!(grp = self.grp, chn, error = %e, "vpss frame release failed");
        }
    }
}

impl Drop for VpssSession {
    fn drop(&mut self) {
        if let Err(e) = self.core.vpss_stop(self.grp) {
            warn!(grp = self.grp, error = %e, "vpss stop failed");
        }
        if self.chn1.lock().is_some() {
            if let Err(e) = self.core.vpss_disable_chn(self.grp, VPSS_CHN1) {
                warn!(grp = self.grp, error = %e, "vpss chn1 disable failed");
            }
        }
        if let Err(e) = self.core.vpss_disable_chn(self.grp, 0) {
            warn!(grp = self.grp, error = %e, "vpss chn0 disable failed");
        }
        if let Err(e) = self.core.vpss_destroy(self.grp) {
            warn!(grp = self.grp, error = %e, "vpss destroy failed");
        }
    }
}

/// Encoder channel.
pub struct VencSession {
    core: Arc<dyn VideoCore>,
    chn: u32,
    cfg: EncoderConfig,
}

impl VencSession {
    pub fn new(core: Arc<dyn VideoCore>, chn: u32, cfg: EncoderConfig) -> MediaResult<Self> {
        core.venc_create(chn, &cfg)?;
        if let Err(e) = core.venc_start_recv(chn) {
            let _ = core.venc_destroy(chn);
            return Err(e.into());
        }
        debug!(chn, codec = cfg.codec.as_str(), width = cfg.width, height = cfg.height,
            "venc session up");
        Ok(Self { core, chn, cfg })
    }

    pub fn chn(&self) -> u32 {
        self.chn
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.cfg
    }

    pub fn stop_recv(&self) {
        if let Err(e) = self.core.venc_stop_recv(self.chn) {
            warn!(chn = self.chn, error = %e, "venc stop_recv failed");
        }
    }

    pub fn send_frame(&self, frame: &BufferHandle, pts_us: u64) -> HwResult<()> {
        self.core
            .venc_send_frame(self.chn, frame, self.cfg.width, self.cfg.height, pts_us)
    }

    pub fn fetch_packet(&self, timeout: Duration) -> HwResult<super::HwPacket> {
        self.core.venc_fetch_packet(self.chn, timeout)
    }

    pub fn release_packet(&self, packet: super::HwPacket) {
        if let Err(e) = self.core.venc_release_packet(self.chn, packet) {
            warn!(chn = self.chn, error = %e, "venc packet release failed");
        }
    }
}

impl Drop for VencSession {
    fn drop(&mut self) {
        if let Err(e) = self.core.venc_stop_recv(self.chn) {
            debug!(chn = self.chn, error = %e, "venc stop_recv on drop");
        }
        if let Err(e) = self.core.venc_destroy(self.chn) {
            warn!(chn = self.chn, error = %e, "venc destroy failed");
        }
    }
}

/// VI -> VPSS binding; unbinds on drop.
pub struct ViVpssBind {
    core: Arc<dyn VideoCore>,
    dev: u32,
    chn: u32,
    grp: u32,
}

impl ViVpssBind {
    pub fn new(core: Arc<dyn VideoCore>, vi: &ViSession, vpss: &VpssSession) -> MediaResult<Self> {
        core.bind_vi_vpss(vi.dev(), vi.chn(), vpss.grp())?;
        Ok(Self {
            core,
            dev: vi.dev(),
            chn: vi.chn(),
            grp: vpss.grp(),
        })
    }
}

impl Drop for ViVpssBind {
    fn drop(&mut self) {
        if let Err(e) = self.core.unbind_vi_vpss(self.dev, self.chn, self.grp) {
            warn!(error = %e, "vi->vpss unbind failed");
        }
    }
}

/// VPSS -> VENC binding (parallel mode); unbinds on drop.
pub struct VpssVencBind {
    core: Arc<dyn VideoCore>,
    grp: u32,
    venc_chn: u32,
}

impl VpssVencBind {
    pub fn new(core: Arc<dyn VideoCore>, vpss: &VpssSession, venc: &VencSession) -> MediaResult<Self> {
        core.bind_vpss_venc(vpss.grp(), venc.chn())?;
        Ok(Self {
            core,
            grp: vpss.grp(),
            venc_chn: venc.chn(),
        })
    }
}

impl Drop for VpssVencBind {
    fn drop(&mut self) {
        if let Err(e) = self.core.unbind_vpss_venc(self.grp, self.venc_chn) {
            warn!(error = %e, "vpss->venc unbind failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimCore;
    use crate::hw::{Codec, PixelFormat};

    fn core() -> Arc<SimCore> {
        Arc::new(SimCore::new(30))
    }

    fn layout(chn1: Option<(u32, u32)>) -> VpssLayout {
        VpssLayout {
            in_width: 1920,
            in_height: 1080,
            chn0: (1920, 1080, 0),
            chn1,
        }
    }

    #[test]
    fn sessions_tear_down_cleanly_and_reinit() {
        let core = core();
        for _ in 0..2 {
            let sys = MpiSystem::new(core.clone()).unwrap();
            let isp = IspSession::new(core.clone(), 0).unwrap();
            let vi = ViSession::new(core.clone(), 0, 0, 1920, 1080).unwrap();
            let vpss = VpssSession::new(core.clone(), 0, &layout(Some((640, 640)))).unwrap();
            let bind = ViVpssBind::new(core.clone(), &vi, &vpss).unwrap();
            // Reverse of construction order.
            drop(bind);
            drop(vpss);
            drop(vi);
            drop(isp);
            drop(sys);
        }
    }

    #[test]
    fn reconfigure_chn1_swaps_dimensions() {
        let core = core();
        let _sys = MpiSystem::new(core.clone()).unwrap();
        let vpss = VpssSession::new(core.clone(), 0, &layout(Some((640, 640)))).unwrap();
        assert_eq!(vpss.chn1_size(), Some((640, 640)));
        vpss.reconfigure_chn1(320, 320).unwrap();
        assert_eq!(vpss.chn1_size(), Some((320, 320)));
        let log = core.chn_enable_log();
        assert_eq!(log, vec![(0, 1920, 1080), (1, 640, 640), (1, 320, 320)]);
    }

    #[test]
    fn venc_session_drop_releases_channel() {
        let core = core();
        let _sys = MpiSystem::new(core.clone()).unwrap();
        let cfg = EncoderConfig {
            codec: Codec::H264,
            width: 1280,
            height: 720,
            bitrate_kbps: 4096,
            gop: 60,
            input: PixelFormat::Nv12,
        };
        let venc = VencSession::new(core.clone(), 0, cfg.clone()).unwrap();
        drop(venc);
        // Channel is free again.
        let venc2 = VencSession::new(core.clone(), 0, cfg).unwrap();
        drop(venc2);
    }
}
