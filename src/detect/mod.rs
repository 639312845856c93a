//! Object and face detection on the NPU.
//!
//! Detectors share one capability surface ([`Detector`]): write the input
//! tile, run inference, decode model-specific outputs into [`Detection`]s.
//! Boxes live in model-input pixel coordinates; callers remap with the
//! [`crate::imgproc::Letterbox`] used to produce the input.

pub mod npu;
pub mod registry;
pub mod retinaface;
pub mod yolo;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::imgproc::Letterbox;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("model load failed: {0}")]
    Load(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("no model loaded")]
    NotLoaded,
}

/// Which concrete detector a model file drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    #[serde(rename = "yolov5")]
    Yolo,
    #[serde(rename = "retinaface")]
    RetinaFace,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Yolo => "yolov5",
            DetectorKind::RetinaFace => "retinaface",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "yolov5" | "yolo" => Some(DetectorKind::Yolo),
            "retinaface" => Some(DetectorKind::RetinaFace),
            _ => None,
        }
    }
}

/// Axis-aligned box, `x2/y2` exclusive-ish edges in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One decoded detection in model-input pixel coordinates.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BBox,
    /// Confidence in `[0, 1]`.
    pub score: f32,
    pub class_id: u32,
    pub label: &'static str,
    /// Ordered landmark points (five for faces), empty otherwise.
    pub landmarks: Vec<(f32, f32)>,
}

impl Detection {
    /// Applies the inverse letterbox transform, mapping the detection back
    /// to full-resolution frame coordinates.
    pub fn to_frame(&self, lb: &Letterbox) -> Detection {
        let (x1, y1) = lb.unmap_point(self.bbox.x1, self.bbox.y1);
        let (x2, y2) = lb.unmap_point(self.bbox.x2, self.bbox.y2);
        Detection {
            bbox: BBox { x1, y1, x2, y2 },
            landmarks: self
                .landmarks
                .iter()
                .map(|&(x, y)| lb.unmap_point(x, y))
                .collect(),
            ..self.clone()
        }
    }
}

/// Capability surface of a loaded model.
pub trait Detector: Send {
    fn kind(&self) -> DetectorKind;

    /// Model input dimensions; sizes letterboxing and the scaler's
    /// detector-input channel.
    fn input_size(&self) -> (u32, u32);

    /// Zero-copy input: callers write RGB888 tile bytes directly.
    fn input_region(&mut self) -> &mut [u8];

    /// Synchronous; returns after the NPU finishes.
    fn infer(&mut self) -> Result<(), DetectError>;

    /// Model-specific post-processing including score filtering and NMS.
    fn decode(&mut self) -> Vec<Detection>;
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Inverse of [`sigmoid`], clamped away from the asymptotes.
pub fn inv_sigmoid(p: f32) -> f32 {
    let p = p.clamp(1e-4, 1.0 - 1e-4);
    (p / (1.0 - p)).ln()
}

/// Affine dequantization `(q - zp) * scale`.
pub fn dequant(q: i8, zp: i32, scale: f32) -> f32 {
    (q as i32 - zp) as f32 * scale
}

/// Affine quantization, saturating.
pub fn quant(f: f32, zp: i32, scale: f32) -> i8 {
    ((f / scale).round() as i32 + zp).clamp(-128, 127) as i8
}

/// Greedy non-maximum suppression. With `class_aware` only detections of
/// the same class suppress each other.
pub fn nms(mut dets: Vec<Detection>, iou_thresh: f32, class_aware: bool) -> Vec<Detection> {
    dets.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let mut keep: Vec<Detection> = Vec::new();
    'cand: for det in dets {
        for kept in &keep {
            if (!class_aware || kept.class_id == det.class_id)
                && kept.bbox.iou(&det.bbox) > iou_thresh
            {
                continue 'cand;
            }
        }
        keep.push(det);
    }
    keep
}
