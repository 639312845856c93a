//! Software media core.
//!
//! Stands in for the SoC SDK the same way a test source stands in for the
//! camera element on a dev host: frames are synthesized YUV 4:2:0SP at the
//! configured rate, the "encoder" frames payloads as Annex-B NAL units with
//! a GOP-periodic IDR, and every lifecycle/ordering rule of the vendor API
//! is enforced so misuse fails loudly in tests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::buffer::{BufferHandle, BufferPool};
use crate::error::MediaError;

use super::{Codec, EncoderConfig, HwError, HwPacket, HwResult, OsdRegion, PixelFormat, RawFrame};

const ANNEXB: [u8; 4] = [0, 0, 0, 1];
const MAX_PENDING_FRAMES: usize = 8;
const PACKET_BLOCK_BYTES: usize = 64 * 1024;
const PACKET_BLOCKS: usize = 8;

struct ViState {
    dev: u32,
    chn: u32,
    width: u32,
    height: u32,
    bound_grp: Option<u32>,
}

struct ChnState {
    width: u32,
    height: u32,
    depth: u32,
    pool: BufferPool,
    next_seq: u64,
    next_frame_at: Instant,
}

struct VpssState {
    grp: u32,
    in_width: u32,
    in_height: u32,
    started: bool,
    chns: [Option<ChnState>; 2],
    bound_venc: Option<u32>,
}

struct PendingFrame {
    handle: BufferHandle,
    pts_us: u64,
}

struct VencState {
    chn: u32,
    cfg: EncoderConfig,
    recv_on: bool,
    pool: BufferPool,
    next_seq: u64,
    encoded_total: u64,
    next_packet_at: Instant,
    pending: VecDeque<PendingFrame>,
}

#[derive(Default)]
struct SimState {
    sys: bool,
    isp: Option<u32>,
    vi: Option<ViState>,
    vpss: Option<VpssState>,
    venc: Option<VencState>,
    osd: Vec<OsdRegion>,
}

/// Software implementation of [`super::VideoCore`].
pub struct SimCore {
    start: Instant,
    fps: u32,
    state: Mutex<SimState>,
    pending_cv: Condvar,
    chn_enable_log: Mutex<Vec<(u32, u32, u32)>>,
}

impl SimCore {
    pub fn new(fps: u32) -> Self {
        Self {
            start: Instant::now(),
            fps: fps.max(1),
            state: Mutex::new(SimState::default()),
            pending_cv: Condvar::new(),
            chn_enable_log: Mutex::new(Vec::new()),
        }
    }

    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.fps as u64)
    }

    /// Every `vpss_enable_chn` call as `(chn, width, height)`, in order.
    /// Used by tests to observe detector-input reconfigurations.
    pub fn chn_enable_log(&self) -> Vec<(u32, u32, u32)> {
        self.chn_enable_log.lock().clone()
    }

    /// Current OSD region programming, for tests.
    pub fn osd_snapshot(&self) -> Vec<OsdRegion> {
        self.state.lock().osd.clone()
    }

    fn fill_test_frame(data: &mut [u8], width: u32, height: u32, seq: u64) {
        let (w, h) = (width as usize, height as usize);
        let luma = &mut data[..w * h];
        for y in 0..h {
            for x in 0..w {
                luma[y * w + x] = ((x + y + seq as usize * 4) & 0xff) as u8;
            }
        }
        for b in &mut data[w * h..w * h + w * h / 2] {
            *b = 0x80;
        }
    }

    fn packet_body_len(&self, cfg: &EncoderConfig, keyframe: bool) -> usize {
        let per_frame = (cfg.bitrate_kbps as usize * 1000 / 8) / self.fps as usize;
        let len = per_frame.clamp(256, 4096);
        if keyframe {
            len * 2
        } else {
            len
        }
    }

    fn encode_payload(&self, cfg: &EncoderConfig, keyframe: bool, seq: u64) -> Vec<u8> {
        let body_len = self.packet_body_len(cfg, keyframe);
        let mut out = Vec::with_capacity(body_len + 64);
        let mut body = vec![0u8; body_len];
        body[..8].copy_from_slice(&seq.to_be_bytes());
        for (i, b) in body[8..].iter_mut().enumerate() {
            *b = ((i as u64 + seq * 31) & 0xff) as u8;
        }
        match cfg.codec {
            Codec::H264 => {
                if keyframe {
                    out.extend_from_slice(&ANNEXB);
                    out.extend_from_slice(&[0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9]);
                    out.extend_from_slice(&ANNEXB);
                    out.extend_from_slice(&[0x68, 0xce, 0x38, 0x80]);
                    out.extend_from_slice(&ANNEXB);
                    out.push(0x65);
                } else {
                    out.extend_from_slice(&ANNEXB);
                    out.push(0x41);
                }
                out.extend_from_slice(&body);
            }
            Codec::H265 => {
                if keyframe {
                    out.extend_from_slice(&ANNEXB);
                    out.extend_from_slice(&[0x40, 0x01, 0x0c]);
                    out.extend_from_slice(&ANNEXB);
                    out.extend_from_slice(&[0x42, 0x01, 0x01]);
                    out.extend_from_slice(&ANNEXB);
                    out.extend_from_slice(&[0x44, 0x01, 0xc1]);
                    out.extend_from_slice(&ANNEXB);
                    out.extend_from_slice(&[0x26, 0x01]);
                } else {
                    out.extend_from_slice(&ANNEXB);
                    out.extend_from_slice(&[0x02, 0x01]);
                }
                out.extend_from_slice(&body);
            }
            Codec::Mjpeg => {
                out.extend_from_slice(&[0xff, 0xd8]);
                out.extend_from_slice(&body);
                out.extend_from_slice(&[0xff, 0xd9]);
            }
        }
        out
    }

    fn deliver_packet(
        &self,
        pool: &BufferPool,
        payload: Vec<u8>,
        pts_us: u64,
        seq: u64,
    ) -> HwResult<HwPacket> {
        let mut handle = pool
            .acquire(payload.len(), false)
            .map_err(|e| match e {
                MediaError::WouldBlock => HwError::Exhausted,
                _ => HwError::InvalidArg(e.to_string()),
            })?;
        if let Some(dst) = handle.data_mut() {
            dst[..payload.len()].copy_from_slice(&payload);
        }
        Ok(HwPacket {
            handle,
            len: payload.len(),
            pts_us,
            seq,
        })
    }
}

impl super::VideoCore for SimCore {
    fn sys_init(&self) -> HwResult<()> {
        let mut st = self.state.lock();
        if st.sys {
            return Err(HwError::AlreadyEnabled("sys"));
        }
        st.sys = true;
        debug!("sim media core initialized");
        Ok(())
    }

    fn sys_exit(&self) {
        let mut st = self.state.lock();
        if st.vi.is_some() || st.vpss.is_some() || st.venc.is_some() {
            warn!("sys_exit with live sessions: vi={} vpss={} venc={}",
                st.vi.is_some(), st.vpss.is_some(), st.venc.is_some());
        }
        st.sys = false;
    }

    fn isp_init(&self, cam_id: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        if st.isp.is_some() {
            return Err(HwError::AlreadyEnabled("isp"));
        }
        st.isp = Some(cam_id);
        Ok(())
    }

    fn isp_stop(&self, cam_id: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        match st.isp {
            Some(id) if id == cam_id => {
                st.isp = None;
                Ok(())
            }
            _ => Err(HwError::NotEnabled("isp")),
        }
    }

    fn vi_enable(&self, dev: u32, chn: u32, width: u32, height: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        if !st.sys {
            return Err(HwError::NotReady("sys"));
        }
        if st.vi.is_some() {
            return Err(HwError::AlreadyEnabled("vi"));
        }
        st.vi = Some(ViState {
            dev,
            chn,
            width,
            height,
            bound_grp: None,
        });
        Ok(())
    }

    fn vi_disable(&self, dev: u32, chn: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        match &st.vi {
            Some(vi) if vi.dev == dev && vi.chn == chn => {
                if vi.bound_grp.is_some() {
                    return Err(HwError::BadBind("vi still bound to vpss"));
                }
                st.vi = None;
                Ok(())
            }
            _ => Err(HwError::NotEnabled("vi")),
        }
    }

    fn vpss_create(&self, grp: u32, in_width: u32, in_height: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        if !st.sys {
            return Err(HwError::NotReady("sys"));
        }
        if st.vpss.is_some() {
            return Err(HwError::AlreadyEnabled("vpss"));
        }
        st.vpss = Some(VpssState {
            grp,
            in_width,
            in_height,
            started: false,
            chns: [None, None],
            bound_venc: None,
        });
        Ok(())
    }

    fn vpss_destroy(&self, grp: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        match &st.vpss {
            Some(v) if v.grp == grp => {
                if v.started {
                    return Err(HwError::BadBind("vpss still started"));
                }
                if v.chns.iter().any(|c| c.is_some()) {
                    return Err(HwError::BadBind("vpss channels still enabled"));
                }
                st.vpss = None;
                Ok(())
            }
            _ => Err(HwError::NotEnabled("vpss")),
        }
    }

    fn vpss_enable_chn(
        &self,
        grp: u32,
        chn: u32,
        width: u32,
        height: u32,
        depth: u32,
    ) -> HwResult<()> {
        let interval = self.frame_interval();
        let mut st = self.state.lock();
        let vpss = st.vpss.as_mut().ok_or(HwError::NotEnabled("vpss"))?;
        if vpss.grp != grp || chn > 1 {
            return Err(HwError::InvalidArg(format!("vpss grp {} chn {}", grp, chn)));
        }
        if vpss.chns[chn as usize].is_some() {
            return Err(HwError::AlreadyEnabled("vpss chn"));
        }
        let frame_bytes = (width * height * 2) as usize;
        let pool = BufferPool::create(
            &format!("vpss{}-chn{}", grp, chn),
            frame_bytes,
            depth as usize + 2,
        )
        .map_err(|e| HwError::InvalidArg(e.to_string()))?;
        vpss.chns[chn as usize] = Some(ChnState {
            width,
            height,
            depth,
            pool,
            next_seq: 0,
            next_frame_at: Instant::now() + interval,
        });
        self.chn_enable_log.lock().push((chn, width, height));
        Ok(())
    }

    fn vpss_disable_chn(&self, grp: u32, chn: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        let vpss = st.vpss.as_mut().ok_or(HwError::NotEnabled("vpss"))?;
        if vpss.grp != grp || chn > 1 {
            return Err(HwError::InvalidArg(format!("vpss grp {} chn {}", grp, chn)));
        }
        match vpss.chns[chn as usize].take() {
            Some(c) => {
                c.pool.close();
                Ok(())
            }
            None => Err(HwError::NotEnabled("vpss chn")),
        }
    }

    fn vpss_start(&self, grp: u32) -> HwResult<()> {
        let interval = self.frame_interval();
        let mut st = self.state.lock();
        let vpss = st.vpss.as_mut().ok_or(HwError::NotEnabled("vpss"))?;
        if vpss.grp != grp {
            return Err(HwError::InvalidArg(format!("vpss grp {}", grp)));
        }
        vpss.started = true;
        let now = Instant::now();
        for chn in vpss.chns.iter_mut().flatten() {
            chn.next_frame_at = now + interval;
        }
        Ok(())
    }

    fn vpss_stop(&self, grp: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        let vpss = st.vpss.as_mut().ok_or(HwError::NotEnabled("vpss"))?;
        if vpss.grp != grp {
            return Err(HwError::InvalidArg(format!("vpss grp {}", grp)));
        }
        vpss.started = false;
        Ok(())
    }

    fn vpss_acquire_frame(&self, grp: u32, chn: u32, timeout: Duration) -> HwResult<RawFrame> {
        let deadline = Instant::now() + timeout;
        let interval = self.frame_interval();
        loop {
            let (pool, width, height, seq, due) = {
                let mut st = self.state.lock();
                let vpss = st.vpss.as_mut().ok_or(HwError::NotEnabled("vpss"))?;
                if vpss.grp != grp || chn > 1 {
                    return Err(HwError::InvalidArg(format!("vpss grp {} chn {}", grp, chn)));
                }
                if !vpss.started {
                    return Err(HwError::NotEnabled("vpss grp not started"));
                }
                let c = vpss.chns[chn as usize]
                    .as_mut()
                    .ok_or(HwError::NotEnabled("vpss chn"))?;
                if c.depth == 0 {
                    return Err(HwError::BadBind("channel is in bound mode (depth 0)"));
                }
                let now = Instant::now();
                if now >= c.next_frame_at {
                    let seq = c.next_seq;
                    c.next_seq += 1;
                    // Resync instead of bursting if the reader fell far behind.
                    c.next_frame_at = if now > c.next_frame_at + interval * 8 {
                        now + interval
                    } else {
                        c.next_frame_at + interval
                    };
                    (c.pool.clone(), c.width, c.height, seq, None)
                } else {
                    (c.pool.clone(), c.width, c.height, 0, Some(c.next_frame_at))
                }
            };
            match due {
                None => {
                    let bytes = (width * height * 3 / 2) as usize;
                    let mut handle = match pool.acquire(bytes, false) {
                        Ok(h) => h,
                        Err(MediaError::WouldBlock) => {
                            // All channel buffers held downstream; behave
                            // like the vendor and time out.
                            if Instant::now() >= deadline {
                                return Err(HwError::Timeout);
                            }
                            std::thread::sleep(Duration::from_millis(2));
                            continue;
                        }
                        Err(e) => return Err(HwError::InvalidArg(e.to_string())),
                    };
                    let pts_us = self.now_us();
                    if let Some(data) = handle.data_mut() {
                        Self::fill_test_frame(data, width, height, seq);
                    }
                    return Ok(RawFrame {
                        handle,
                        width,
                        height,
                        stride: width,
                        pts_us,
                        seq,
                    });
                }
                Some(due) => {
                    let now = Instant::now();
                    if deadline <= due {
                        if deadline > now {
                            std::thread::sleep(deadline - now);
                        }
                        return Err(HwError::Timeout);
                    }
                    std::thread::sleep(due.saturating_duration_since(now));
                }
            }
        }
    }

    fn vpss_release_frame(&self, grp: u32, chn: u32, frame: RawFrame) -> HwResult<()> {
        let st = self.state.lock();
        match &st.vpss {
            Some(v) if v.grp == grp && chn <= 1 => {
                drop(frame);
                Ok(())
            }
            _ => Err(HwError::NotEnabled("vpss")),
        }
    }

    fn bind_vi_vpss(&self, dev: u32, chn: u32, grp: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        if st.vpss.as_ref().map(|v| v.grp) != Some(grp) {
            return Err(HwError::BadBind("vpss group not created"));
        }
        let vi = st.vi.as_mut().ok_or(HwError::NotEnabled("vi"))?;
        if vi.dev != dev || vi.chn != chn {
            return Err(HwError::InvalidArg(format!("vi {}:{}", dev, chn)));
        }
        if vi.bound_grp.is_some() {
            return Err(HwError::BadBind("vi already bound"));
        }
        vi.bound_grp = Some(grp);
        Ok(())
    }

    fn unbind_vi_vpss(&self, dev: u32, chn: u32, grp: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        let vi = st.vi.as_mut().ok_or(HwError::NotEnabled("vi"))?;
        if vi.dev != dev || vi.chn != chn || vi.bound_grp != Some(grp) {
            return Err(HwError::BadBind("vi not bound to this group"));
        }
        vi.bound_grp = None;
        Ok(())
    }

    fn bind_vpss_venc(&self, grp: u32, venc_chn: u32) -> HwResult<()> {
        let interval = self.frame_interval();
        let mut st = self.state.lock();
        if st.venc.as_ref().map(|v| v.chn) != Some(venc_chn) {
            return Err(HwError::BadBind("venc channel not created"));
        }
        let vpss = st.vpss.as_mut().ok_or(HwError::NotEnabled("vpss"))?;
        if vpss.grp != grp {
            return Err(HwError::InvalidArg(format!("vpss grp {}", grp)));
        }
        if vpss.bound_venc.is_some() {
            return Err(HwError::BadBind("vpss already bound to venc"));
        }
        match &vpss.chns[0] {
            Some(c) if c.depth == 0 => {}
            Some(_) => return Err(HwError::BadBind("chn0 must be depth 0 for binding")),
            None => return Err(HwError::NotEnabled("vpss chn0")),
        }
        vpss.bound_venc = Some(venc_chn);
        if let Some(venc) = st.venc.as_mut() {
            venc.next_packet_at = Instant::now() + interval;
        }
        Ok(())
    }

    fn unbind_vpss_venc(&self, grp: u32, venc_chn: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        let vpss = st.vpss.as_mut().ok_or(HwError::NotEnabled("vpss"))?;
        if vpss.grp != grp || vpss.bound_venc != Some(venc_chn) {
            return Err(HwError::BadBind("vpss not bound to this venc"));
        }
        vpss.bound_venc = None;
        Ok(())
    }

    fn venc_create(&self, chn: u32, cfg: &EncoderConfig) -> HwResult<()> {
        let mut st = self.state.lock();
        if !st.sys {
            return Err(HwError::NotReady("sys"));
        }
        if st.venc.is_some() {
            return Err(HwError::AlreadyEnabled("venc"));
        }
        if cfg.width == 0 || cfg.height == 0 || cfg.gop == 0 {
            return Err(HwError::InvalidArg("encoder geometry".into()));
        }
        let pool = BufferPool::create(
            &format!("venc{}-stream", chn),
            PACKET_BLOCK_BYTES,
            PACKET_BLOCKS,
        )
        .map_err(|e| HwError::InvalidArg(e.to_string()))?;
        st.venc = Some(VencState {
            chn,
            cfg: cfg.clone(),
            recv_on: false,
            pool,
            next_seq: 0,
            encoded_total: 0,
            next_packet_at: Instant::now(),
            pending: VecDeque::new(),
        });
        Ok(())
    }

    fn venc_destroy(&self, chn: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        match &st.venc {
            Some(v) if v.chn == chn => {
                if st.vpss.as_ref().and_then(|g| g.bound_venc) == Some(chn) {
                    return Err(HwError::BadBind("venc still bound from vpss"));
                }
                st.venc = None;
                self.pending_cv.notify_all();
                Ok(())
            }
            _ => Err(HwError::NotEnabled("venc")),
        }
    }

    fn venc_start_recv(&self, chn: u32) -> HwResult<()> {
        let interval = self.frame_interval();
        let mut st = self.state.lock();
        let venc = st.venc.as_mut().ok_or(HwError::NotEnabled("venc"))?;
        if venc.chn != chn {
            return Err(HwError::InvalidArg(format!("venc chn {}", chn)));
        }
        venc.recv_on = true;
        venc.next_packet_at = Instant::now() + interval;
        Ok(())
    }

    fn venc_stop_recv(&self, chn: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        let venc = st.venc.as_mut().ok_or(HwError::NotEnabled("venc"))?;
        if venc.chn != chn {
            return Err(HwError::InvalidArg(format!("venc chn {}", chn)));
        }
        venc.recv_on = false;
        // Frames queued but not yet encoded are discarded; their retained
        // references release here.
        venc.pending.clear();
        self.pending_cv.notify_all();
        Ok(())
    }

    fn venc_send_frame(
        &self,
        chn: u32,
        frame: &BufferHandle,
        width: u32,
        height: u32,
        pts_us: u64,
    ) -> HwResult<()> {
        let mut st = self.state.lock();
        let venc = st.venc.as_mut().ok_or(HwError::NotEnabled("venc"))?;
        if venc.chn != chn {
            return Err(HwError::InvalidArg(format!("venc chn {}", chn)));
        }
        if !venc.recv_on {
            return Err(HwError::NotEnabled("venc recv"));
        }
        if width != venc.cfg.width || height != venc.cfg.height {
            return Err(HwError::InvalidArg(format!(
                "frame {}x{} vs encoder {}x{}",
                width, height, venc.cfg.width, venc.cfg.height
            )));
        }
        if venc.cfg.input == PixelFormat::Rgb888
            && frame.size_bytes() < (width * height * 3) as usize
        {
            return Err(HwError::InvalidArg("frame smaller than encoder input".into()));
        }
        if venc.pending.len() >= MAX_PENDING_FRAMES {
            return Err(HwError::Exhausted);
        }
        // The encoder keeps its own reference until the frame is consumed.
        venc.pending.push_back(PendingFrame {
            handle: frame.clone_ref(),
            pts_us,
        });
        self.pending_cv.notify_one();
        Ok(())
    }

    fn venc_fetch_packet(&self, chn: u32, timeout: Duration) -> HwResult<HwPacket> {
        let deadline = Instant::now() + timeout;
        loop {
            enum Action {
                Emit {
                    pool: BufferPool,
                    payload: Vec<u8>,
                    pts_us: u64,
                    seq: u64,
                },
                WaitUntil(Instant),
                WaitPending,
            }
            let action = {
                let mut st = self.state.lock();
                let bound = st.vpss.as_ref().and_then(|v| v.bound_venc) == Some(chn)
                    && st.vi.as_ref().and_then(|v| v.bound_grp).is_some()
                    && st.vpss.as_ref().map(|v| v.started).unwrap_or(false);
                let venc = st.venc.as_mut().ok_or(HwError::NotEnabled("venc"))?;
                if venc.chn != chn {
                    return Err(HwError::InvalidArg(format!("venc chn {}", chn)));
                }
                if !venc.recv_on {
                    return Err(HwError::BufEmpty);
                }
                if let Some(frame) = venc.pending.pop_front() {
                    let seq = venc.next_seq;
                    venc.next_seq += 1;
                    let keyframe = venc.encoded_total % venc.cfg.gop as u64 == 0;
                    venc.encoded_total += 1;
                    let payload = self.encode_payload(&venc.cfg, keyframe, seq);
                    drop(frame.handle);
                    Action::Emit {
                        pool: venc.pool.clone(),
                        payload,
                        pts_us: frame.pts_us,
                        seq,
                    }
                } else if bound {
                    let now = Instant::now();
                    if now >= venc.next_packet_at {
                        let due = venc.next_packet_at;
                        let seq = venc.next_seq;
                        venc.next_seq += 1;
                        let keyframe = venc.encoded_total % venc.cfg.gop as u64 == 0;
                        venc.encoded_total += 1;
                        let interval = self.frame_interval();
                        venc.next_packet_at = if now > due + interval * 8 {
                            now + interval
                        } else {
                            due + interval
                        };
                        let payload = self.encode_payload(&venc.cfg, keyframe, seq);
                        Action::Emit {
                            pool: venc.pool.clone(),
                            payload,
                            pts_us: self.now_us(),
                            seq,
                        }
                    } else {
                        Action::WaitUntil(venc.next_packet_at)
                    }
                } else {
                    Action::WaitPending
                }
            };
            match action {
                Action::Emit {
                    pool,
                    payload,
                    pts_us,
                    seq,
                } => return self.deliver_packet(&pool, payload, pts_us, seq),
                Action::WaitUntil(due) => {
                    let now = Instant::now();
                    if deadline <= due {
                        if deadline > now {
                            std::thread::sleep(deadline - now);
                        }
                        return Err(HwError::BufEmpty);
                    }
                    std::thread::sleep(due.saturating_duration_since(now));
                }
                Action::WaitPending => {
                    let mut st = self.state.lock();
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(HwError::BufEmpty);
                    }
                    let has_work = st
                        .venc
                        .as_ref()
                        .map(|v| !v.pending.is_empty() || !v.recv_on)
                        .unwrap_or(true);
                    if !has_work {
                        self.pending_cv.wait_for(&mut st, deadline - now);
                    }
                }
            }
        }
    }

    fn venc_release_packet(&self, chn: u32, packet: HwPacket) -> HwResult<()> {
        let st = self.state.lock();
        match &st.venc {
            Some(v) if v.chn == chn => {
                drop(packet);
                Ok(())
            }
            _ => {
                // Packets may legally outlive a torn-down channel during
                // shutdown; dropping still returns the block.
                drop(packet);
                Ok(())
            }
        }
    }

    fn osd_set_regions(&self, _chn: u32, regions: &[OsdRegion]) -> HwResult<()> {
        let mut st = self.state.lock();
        if !st.sys {
            return Err(HwError::NotReady("sys"));
        }
        st.osd = regions.to_vec();
        Ok(())
    }

    fn osd_clear(&self, _chn: u32) -> HwResult<()> {
        let mut st = self.state.lock();
        st.osd.clear();
        Ok(())
    }
}
