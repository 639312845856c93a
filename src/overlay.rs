//! Detection overlay rendering.
//!
//! Two back-ends: a CPU blit into an RGB888 frame (serial pipeline) and
//! hardware OSD region programming (both pipelines). Rendering is
//! idempotent within a frame, and a frame with zero detections is left
//! byte-identical.

use std::sync::Arc;

use tracing::warn;

use crate::detect::Detection;
use crate::hw::{OsdRegion, VideoCore};

/// Stroke width and feature toggles for the CPU blit.
#[derive(Debug, Clone)]
pub struct OverlayStyle {
    pub stroke: u32,
    pub draw_labels: bool,
    pub draw_landmarks: bool,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            stroke: 3,
            draw_labels: true,
            draw_landmarks: true,
        }
    }
}

/// Class-dependent palette.
pub fn class_color(class_id: u32) -> [u8; 3] {
    const PALETTE: [[u8; 3]; 8] = [
        [0, 255, 0],
        [255, 64, 64],
        [64, 128, 255],
        [255, 200, 0],
        [0, 220, 220],
        [220, 0, 220],
        [255, 128, 0],
        [160, 255, 96],
    ];
    PALETTE[class_id as usize % PALETTE.len()]
}

const LANDMARK_COLOR: [u8; 3] = [255, 0, 0];
const GLYPH_W: usize = 5;
const GLYPH_H: usize = 7;

/// 5x7 column-major glyphs; bit 0 is the top row.
fn glyph(c: u8) -> [u8; 5] {
    match c.to_ascii_uppercase() {
        b'0' => [0x3e, 0x51, 0x49, 0x45, 0x3e],
        b'1' => [0x00, 0x42, 0x7f, 0x40, 0x00],
        b'2' => [0x42, 0x61, 0x51, 0x49, 0x46],
        b'3' => [0x21, 0x41, 0x45, 0x4b, 0x31],
        b'4' => [0x18, 0x14, 0x12, 0x7f, 0x10],
        b'5' => [0x27, 0x45, 0x45, 0x45, 0x39],
        b'6' => [0x3c, 0x4a, 0x49, 0x49, 0x30],
        b'7' => [0x01, 0x71, 0x09, 0x05, 0x03],
        b'8' => [0x36, 0x49, 0x49, 0x49, 0x36],
        b'9' => [0x06, 0x49, 0x49, 0x29, 0x1e],
        b'A' => [0x7e, 0x11, 0x11, 0x11, 0x7e],
        b'B' => [0x7f, 0x49, 0x49, 0x49, 0x36],
        b'C' => [0x3e, 0x41, 0x41, 0x41, 0x22],
        b'D' => [0x7f, 0x41, 0x41, 0x22, 0x1c],
        b'E' => [0x7f, 0x49, 0x49, 0x49, 0x41],
        b'F' => [0x7f, 0x09, 0x09, 0x09, 0x01],
        b'G' => [0x3e, 0x41, 0x49, 0x49, 0x7a],
        b'H' => [0x7f, 0x08, 0x08, 0x08, 0x7f],
        b'I' => [0x00, 0x41, 0x7f, 0x41, 0x00],
        b'J' => [0x20, 0x40, 0x41, 0x3f, 0x01],
        b'K' => [0x7f, 0x08, 0x14, 0x22, 0x41],
        b'L' => [0x7f, 0x40, 0x40, 0x40, 0x40],
        b'M' => [0x7f, 0x02, 0x0c, 0x02, 0x7f],
        b'N' => [0x7f, 0x04, 0x08, 0x10, 0x7f],
        b'O' => [0x3e, 0x41, 0x41, 0x41, 0x3e],
        b'P' => [0x7f, 0x09, 0x09, 0x09, 0x06],
        b'Q' => [0x3e, 0x41, 0x51, 0x21, 0x5e],
        b'R' => [0x7f, 0x09, 0x19, 0x29, 0x46],
        b'S' => [0x46, 0x49, 0x49, 0x49, 0x31],
        b'T' => [0x01, 0x01, 0x7f, 0x01, 0x01],
        b'U' => [0x3f, 0x40, 0x40, 0x40, 0x3f],
        b'V' => [0x1f, 0x20, 0x40, 0x20, 0x1f],
        b'W' => [0x3f, 0x40, 0x38, 0x40, 0x3f],
        b'X' => [0x63, 0x14, 0x08, 0x14, 0x63],
        b'Y' => [0x07, 0x08, 0x70, 0x08, 0x07],
        b'Z' => [0x61, 0x51, 0x49, 0x45, 0x43],
        b'%' => [0x23, 0x13, 0x08, 0x64, 0x62],
        b'.' => [0x00, 0x60, 0x60, 0x00, 0x00],
        b'-' => [0x08, 0x08, 0x08, 0x08, 0x08],
        b':' => [0x00, 0x36, 0x36, 0x00, 0x00],
        _ => [0x00; 5],
    }
}

fn put_pixel(rgb: &mut [u8], width: u32, height: u32, x: i32, y: i32, color: [u8; 3]) {
    if x < 0 || y < 0 || x >= width as i32 || y >= height as i32 {
        return;
    }
    let off = (y as usize * width as usize + x as usize) * 3;
    rgb[off..off + 3].copy_from_slice(&color);
}

fn draw_rect(rgb: &mut [u8], width: u32, height: u32, det: &Detection, stroke: u32, color: [u8; 3]) {
    let (x1, y1) = (det.bbox.x1 as i32, det.bbox.y1 as i32);
    let (x2, y2) = (det.bbox.x2 as i32, det.bbox.y2 as i32);
    for t in 0..stroke as i32 {
        for x in x1..=x2 {
            put_pixel(rgb, width, height, x, y1 + t, color);
            put_pixel(rgb, width, height, x, y2 - t, color);
        }
        for y in y1..=y2 {
            put_pixel(rgb, width, height, x1 + t, y, color);
            put_pixel(rgb, width, height, x2 - t, y, color);
        }
    }
}

fn draw_text(rgb: &mut [u8], width: u32, height: u32, x: i32, y: i32, text: &str, color: [u8; 3]) {
    let mut pen_x = x;
    for &c in text.as_bytes() {
        let g = glyph(c);
        for (col, bits) in g.iter().enumerate() {
            for row in 0..GLYPH_H {
                if bits & (1 << row) != 0 {
                    put_pixel(rgb, width, height, pen_x + col as i32, y + row as i32, color);
                }
            }
        }
        pen_x += GLYPH_W as i32 + 1;
    }
}

fn draw_dot(rgb: &mut [u8], width: u32, height: u32, x: i32, y: i32, color: [u8; 3]) {
    for dy in -1..=1 {
        for dx in -1..=1 {
            put_pixel(rgb, width, height, x + dx, y + dy, color);
        }
    }
}

/// CPU blit back-end. Expects detections already mapped into frame
/// coordinates.
pub struct CpuBlitRenderer {
    style: OverlayStyle,
}

impl CpuBlitRenderer {
    pub fn new(style: OverlayStyle) -> Self {
        Self { style }
    }

    pub fn draw(&self, rgb: &mut [u8], width: u32, height: u32, detections: &[Detection]) {
        for det in detections {
            let color = class_color(det.class_id);
            draw_rect(rgb, width, height, det, self.style.stroke, color);
            if self.style.draw_labels {
                let text = format!("{} {:.0}%", det.label, det.score * 100.0);
                let ty = det.bbox.y1 as i32 - (GLYPH_H as i32 + 2);
                draw_text(rgb, width, height, det.bbox.x1 as i32, ty.max(0), &text, color);
            }
            if self.style.draw_landmarks {
                for &(lx, ly) in &det.landmarks {
                    draw_dot(rgb, width, height, lx as i32, ly as i32, LANDMARK_COLOR);
                }
            }
        }
    }
}

fn pack_argb(color: [u8; 3]) -> u32 {
    0xff00_0000 | (color[0] as u32) << 16 | (color[1] as u32) << 8 | color[2] as u32
}

/// Hardware OSD back-end: reprograms a fixed set of overlay regions each
/// tick. When more boxes arrive than regions exist, the lowest-confidence
/// boxes are discarded.
pub struct OsdRenderer {
    core: Arc<dyn VideoCore>,
    chn: u32,
    max_regions: usize,
}

impl OsdRenderer {
    pub fn new(core: Arc<dyn VideoCore>, chn: u32, max_regions: usize) -> Self {
        Self {
            core,
            chn,
            max_regions,
        }
    }

    pub fn update(&self, detections: &[Detection]) {
        let mut ranked: Vec<&Detection> = detections.iter().collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(self.max_regions);
        let regions: Vec<OsdRegion> = ranked
            .iter()
            .map(|d| OsdRegion {
                x: d.bbox.x1.max(0.0) as u32,
                y: d.bbox.y1.max(0.0) as u32,
                w: d.bbox.width() as u32,
                h: d.bbox.height() as u32,
                argb: pack_argb(class_color(d.class_id)),
            })
            .collect();
        if let Err(e) = self.core.osd_set_regions(self.chn, &regions) {
            warn!(error = %e, "osd region update failed");
        }
    }

    pub fn clear(&self) {
        if let Err(e) = self.core.osd_clear(self.chn) {
            warn!(error = %e, "osd clear failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BBox;
    use crate::hw::sim::SimCore;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Detection {
        Detection {
            bbox: BBox { x1, y1, x2, y2 },
            score,
            class_id: 0,
            label: "person",
            landmarks: vec![],
        }
    }

    #[test]
    fn zero_detections_leave_frame_untouched() {
        let r = CpuBlitRenderer::new(OverlayStyle::default());
        let mut frame = vec![9u8; 64 * 64 * 3];
        let before = frame.clone();
        r.draw(&mut frame, 64, 64, &[]);
        assert_eq!(frame, before);
    }

    #[test]
    fn drawing_is_idempotent() {
        let r = CpuBlitRenderer::new(OverlayStyle::default());
        let dets = vec![det(8.0, 20.0, 40.0, 50.0, 0.87)];
        let mut once = vec![0u8; 64 * 64 * 3];
        r.draw(&mut once, 64, 64, &dets);
        let mut twice = once.clone();
        r.draw(&mut twice, 64, 64, &dets);
        assert_eq!(once, twice);
    }

    #[test]
    fn rect_paints_box_edges_in_class_color() {
        let r = CpuBlitRenderer::new(OverlayStyle {
            stroke: 1,
            draw_labels: false,
            draw_landmarks: false,
        });
        let mut frame = vec![0u8; 32 * 32 * 3];
        r.draw(&mut frame, 32, 32, &[det(4.0, 4.0, 10.0, 10.0, 0.5)]);
        let color = class_color(0);
        let off = (4 * 32 + 4) * 3;
        assert_eq!(&frame[off..off + 3], &color);
        // Interior untouched.
        let interior = (7 * 32 + 7) * 3;
        assert_eq!(&frame[interior..interior + 3], &[0, 0, 0]);
    }

    #[test]
    fn landmarks_paint_dots() {
        let r = CpuBlitRenderer::new(OverlayStyle {
            stroke: 1,
            draw_labels: false,
            draw_landmarks: true,
        });
        let mut frame = vec![0u8; 32 * 32 * 3];
        let mut d = det(1.0, 1.0, 30.0, 30.0, 0.9);
        d.landmarks = vec![(16.0, 16.0)];
        r.draw(&mut frame, 32, 32, &[d]);
        let off = (16 * 32 + 16) * 3;
        assert_eq!(&frame[off..off + 3], &LANDMARK_COLOR);
    }

    #[test]
    fn out_of_bounds_boxes_are_clipped_not_panicking() {
        let r = CpuBlitRenderer::new(OverlayStyle::default());
        let mut frame = vec![0u8; 16 * 16 * 3];
        r.draw(&mut frame, 16, 16, &[det(-10.0, -10.0, 100.0, 100.0, 0.9)]);
    }

    #[test]
    fn osd_discards_lowest_confidence_beyond_region_budget() {
        let core = Arc::new(SimCore::new(30));
        crate::hw::VideoCore::sys_init(core.as_ref()).unwrap();
        let osd = OsdRenderer::new(core.clone(), 0, 2);
        osd.update(&[
            det(0.0, 0.0, 10.0, 10.0, 0.2),
            det(10.0, 0.0, 20.0, 10.0, 0.9),
            det(20.0, 0.0, 30.0, 10.0, 0.5),
        ]);
        let regions = core.osd_snapshot();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].x, 10);
        assert_eq!(regions[1].x, 20);
        osd.clear();
        assert!(core.osd_snapshot().is_empty());
    }
}
