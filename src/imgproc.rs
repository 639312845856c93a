//! CPU image operations for the serial pipeline: YUV 4:2:0SP to RGB888
//! conversion and letterbox scaling into detector input tiles.

/// Resize-and-pad transform fitting a frame into a fixed model input while
/// preserving aspect ratio. Derived purely from source and destination
/// dimensions; immutable per inference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_left: u32,
    pub pad_top: u32,
    pub src: (u32, u32),
    pub dst: (u32, u32),
}

impl Letterbox {
    pub fn compute(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Self {
        let sx = dst_w as f32 / src_w as f32;
        let sy = dst_h as f32 / src_h as f32;
        let scale = sx.min(sy);
        let inner_w = (src_w as f32 * scale) as u32;
        let inner_h = (src_h as f32 * scale) as u32;
        Self {
            scale,
            pad_left: (dst_w - inner_w) / 2,
            pad_top: (dst_h - inner_h) / 2,
            src: (src_w, src_h),
            dst: (dst_w, dst_h),
        }
    }

    /// Maps a model-space point back to source-frame pixels.
    pub fn unmap_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_left as f32) / self.scale,
            (y - self.pad_top as f32) / self.scale,
        )
    }

    /// Maps a source-frame point into model space.
    pub fn map_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x * self.scale + self.pad_left as f32,
            y * self.scale + self.pad_top as f32,
        )
    }
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Converts YUV 4:2:0 semi-planar (NV12) to packed RGB888. `stride` is the
/// luma row stride in bytes; `rgb` must hold `width * height * 3` bytes.
/// Integer BT.601 full-range math.
pub fn nv12_to_rgb(yuv: &[u8], width: u32, height: u32, stride: u32, rgb: &mut [u8]) {
    let (w, h, s) = (width as usize, height as usize, stride as usize);
    debug_assert!(yuv.len() >= s * h + s * h / 2);
    debug_assert!(rgb.len() >= w * h * 3);
    let uv_base = s * h;
    for y in 0..h {
        let uv_row = uv_base + (y / 2) * s;
        for x in 0..w {
            let yy = yuv[y * s + x] as i32;
            let uv = uv_row + (x & !1);
            let u = yuv[uv] as i32 - 128;
            let v = yuv[uv + 1] as i32 - 128;
            let r = yy + ((91881 * v) >> 16);
            let g = yy - ((22554 * u + 46802 * v) >> 16);
            let b = yy + ((116130 * u) >> 16);
            let o = (y * w + x) * 3;
            rgb[o] = clamp_u8(r);
            rgb[o + 1] = clamp_u8(g);
            rgb[o + 2] = clamp_u8(b);
        }
    }
}

/// Nearest-neighbor RGB888 resize.
pub fn resize_rgb(src: &[u8], sw: u32, sh: u32, dst: &mut [u8], dw: u32, dh: u32) {
    let (sw, sh, dw, dh) = (sw as usize, sh as usize, dw as usize, dh as usize);
    debug_assert!(src.len() >= sw * sh * 3);
    debug_assert!(dst.len() >= dw * dh * 3);
    for dy in 0..dh {
        let sy = (dy * sh / dh).min(sh - 1);
        for dx in 0..dw {
            let sx = (dx * sw / dw).min(sw - 1);
            let so = (sy * sw + sx) * 3;
            let dof = (dy * dw + dx) * 3;
            dst[dof..dof + 3].copy_from_slice(&src[so..so + 3]);
        }
    }
}

/// Scales `src` into the inner rectangle of `dst` described by `lb` and
/// fills the padding with black.
pub fn letterbox_rgb(src: &[u8], lb: &Letterbox, dst: &mut [u8]) {
    let (sw, sh) = (lb.src.0 as usize, lb.src.1 as usize);
    let (dw, dh) = (lb.dst.0 as usize, lb.dst.1 as usize);
    debug_assert!(src.len() >= sw * sh * 3);
    debug_assert!(dst.len() >= dw * dh * 3);
    let inner_w = ((lb.src.0 as f32 * lb.scale) as usize).min(dw);
    let inner_h = ((lb.src.1 as f32 * lb.scale) as usize).min(dh);
    let (px, py) = (lb.pad_left as usize, lb.pad_top as usize);
    for b in dst[..dw * dh * 3].iter_mut() {
        *b = 0;
    }
    for iy in 0..inner_h {
        let sy = (iy * sh / inner_h).min(sh - 1);
        let dst_row = (py + iy) * dw;
        for ix in 0..inner_w {
            let sx = (ix * sw / inner_w).min(sw - 1);
            let so = (sy * sw + sx) * 3;
            let dof = (dst_row + px + ix) * 3;
            dst[dof..dof + 3].copy_from_slice(&src[so..so + 3]);
        }
    }
}
