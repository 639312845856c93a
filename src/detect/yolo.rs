//! Grid-anchor multi-class detector (YOLOv5-family, 80 classes).
//!
//! Three output stages at strides 8/16/32 with three anchors each, NCHW
//! layout `[anchor * (5 + classes)][grid_h][grid_w]`. Outputs are
//! affine-quantized; decode dequantizes, applies the sigmoid transform to
//! box offsets and objectness, multiplies objectness and class probability
//! into the confidence, filters, and runs class-wise NMS.

use std::path::Path;

use once_cell::sync::Lazy;

use super::npu::{NpuModelDesc, NpuRuntime, TensorAttr};
use super::{dequant, inv_sigmoid, nms, quant, sigmoid, BBox, DetectError, Detection, Detector, DetectorKind};

pub const STRIDES: [u32; 3] = [8, 16, 32];
pub const NUM_ANCHORS: usize = 3;
pub const NUM_CLASSES: usize = 80;
const PROP_BOX: usize = 5 + NUM_CLASSES;

/// Per-stage anchors, `(w, h)` in input pixels.
pub const ANCHORS: [[(f32, f32); 3]; 3] = [
    [(10.0, 13.0), (16.0, 30.0), (33.0, 23.0)],
    [(30.0, 61.0), (62.0, 45.0), (59.0, 119.0)],
    [(116.0, 90.0), (156.0, 198.0), (373.0, 326.0)],
];

pub const DEFAULT_SCORE_THRESH: f32 = 0.25;
pub const DEFAULT_IOU_THRESH: f32 = 0.45;

static COCO_LABELS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
        "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
        "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
        "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
        "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
        "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
        "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
        "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
        "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink",
        "refrigerator", "book", "clock", "vase", "scissors", "teddy bear", "hair drier",
        "toothbrush",
    ]
});

pub fn class_label(class_id: u32) -> &'static str {
    COCO_LABELS
        .get(class_id as usize)
        .copied()
        .unwrap_or("object")
}

pub struct YoloDetector {
    runtime: Box<dyn NpuRuntime>,
    desc: NpuModelDesc,
    score_thresh: f32,
    iou_thresh: f32,
}

impl YoloDetector {
    pub fn load(
        mut runtime: Box<dyn NpuRuntime>,
        model_path: &Path,
        score_thresh: f32,
        iou_thresh: f32,
    ) -> Result<Self, DetectError> {
        let desc = runtime.load(model_path)?;
        if desc.channels != 3 {
            return Err(DetectError::Load(format!(
                "expected 3-channel input, model has {}",
                desc.channels
            )));
        }
        if desc.outputs.len() != STRIDES.len() {
            return Err(DetectError::Load(format!(
                "expected {} output stages, model has {}",
                STRIDES.len(),
                desc.outputs.len()
            )));
        }
        Ok(Self {
            runtime,
            desc,
            score_thresh,
            iou_thresh,
        })
    }
}

impl Detector for YoloDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Yolo
    }

    fn input_size(&self) -> (u32, u32) {
        (self.desc.input_w, self.desc.input_h)
    }

    fn input_region(&mut self) -> &mut [u8] {
        self.runtime.input_mut()
    }

    fn infer(&mut self) -> Result<(), DetectError> {
        self.runtime.run()
    }

    fn decode(&mut self) -> Vec<Detection> {
        let mut dets = Vec::new();
        for (stage, &stride) in STRIDES.iter().enumerate() {
            let gw = (self.desc.input_w / stride) as usize;
            let gh = (self.desc.input_h / stride) as usize;
            let grid_len = gw * gh;
            let out = self.runtime.output(stage);
            let attr = self.runtime.output_attr(stage).clone();
            if out.len() < NUM_ANCHORS * PROP_BOX * grid_len {
                continue;
            }
            let dq = |q: i8| dequant(q, attr.zp, attr.scale);
            for a in 0..NUM_ANCHORS {
                let base = a * PROP_BOX;
                for gy in 0..gh {
                    for gx in 0..gw {
                        let cell = gy * gw + gx;
                        let at = |c: usize| out[(base + c) * grid_len + cell];
                        let obj = sigmoid(dq(at(4)));
                        if obj < self.score_thresh {
                            continue;
                        }
                        let mut best_class = 0usize;
                        let mut best_q = i8::MIN;
                        for c in 0..NUM_CLASSES {
                            let q = at(5 + c);
                            if q > best_q {
                                best_q = q;
                                best_class = c;
                            }
                        }
                        let score = obj * sigmoid(dq(best_q));
                        if score < self.score_thresh {
                            continue;
                        }
                        let tx = sigmoid(dq(at(0)));
                        let ty = sigmoid(dq(at(1)));
                        let tw = sigmoid(dq(at(2)));
                        let th = sigmoid(dq(at(3)));
                        let cx = (tx * 2.0 - 0.5 + gx as f32) * stride as f32;
                        let cy = (ty * 2.0 - 0.5 + gy as f32) * stride as f32;
                        let (aw, ah) = ANCHORS[stage][a];
                        let w = (tw * 2.0) * (tw * 2.0) * aw;
                        let h = (th * 2.0) * (th * 2.0) * ah;
                        dets.push(Detection {
                            bbox: BBox {
                                x1: cx - w / 2.0,
                                y1: cy - h / 2.0,
                                x2: cx + w / 2.0,
                                y2: cy + h / 2.0,
                            },
                            score,
                            class_id: best_class as u32,
                            label: class_label(best_class as u32),
                            landmarks: Vec::new(),
                        });
                    }
                }
            }
        }
        nms(dets, self.iou_thresh, true)
    }
}

/// Tensor layout of the software model for a given input size, plus the
/// background fill for each output.
pub fn sim_model(input_w: u32, input_h: u32) -> (NpuModelDesc, Vec<i8>) {
    let outputs = STRIDES
        .iter()
        .map(|&s| {
            let gw = (input_w / s) as usize;
            let gh = (input_h / s) as usize;
            TensorAttr {
                zp: 0,
                scale: 1.0 / 16.0,
                len: NUM_ANCHORS * PROP_BOX * gw * gh,
            }
        })
        .collect();
    (
        NpuModelDesc {
            input_w,
            input_h,
            channels: 3,
            is_quantized: true,
            outputs,
        },
        vec![i8::MIN; STRIDES.len()],
    )
}

/// Writes detections into grid-anchor output tensors (the inverse of
/// `decode`). Used to seed the software NPU.
pub fn encode_detections(
    outputs: &mut [Vec<i8>],
    desc: &NpuModelDesc,
    dets: &[(BBox, f32, u32)],
) {
    for &(bbox, score, class_id) in dets {
        let cx = (bbox.x1 + bbox.x2) / 2.0;
        let cy = (bbox.y1 + bbox.y2) / 2.0;
        let w = bbox.width().max(1.0);
        let h = bbox.height().max(1.0);

        // Pick the anchor slot whose decode range covers this box best.
        let mut best: Option<(usize, usize, f32)> = None;
        for (stage, anchors) in ANCHORS.iter().enumerate() {
            for (a, &(aw, ah)) in anchors.iter().enumerate() {
                let tw = (w / aw).sqrt() / 2.0;
                let th = (h / ah).sqrt() / 2.0;
                if !(0.05..=0.95).contains(&tw) || !(0.05..=0.95).contains(&th) {
                    continue;
                }
                let fit = (tw - 0.5).abs() + (th - 0.5).abs();
                if best.map(|(_, _, f)| fit < f).unwrap_or(true) {
                    best = Some((stage, a, fit));
                }
            }
        }
        let (stage, a) = match best {
            Some((s, a, _)) => (s, a),
            None => continue,
        };
        let stride = STRIDES[stage] as f32;
        let gw = (desc.input_w / STRIDES[stage]) as usize;
        let gh = (desc.input_h / STRIDES[stage]) as usize;
        let grid_len = gw * gh;
        let gx = ((cx / stride) as usize).min(gw - 1);
        let gy = ((cy / stride) as usize).min(gh - 1);
        let fx = cx / stride - gx as f32;
        let fy = cy / stride - gy as f32;
        let (aw, ah) = ANCHORS[stage][a];

        let attr = &desc.outputs[stage];
        let q = |v: f32| quant(v, attr.zp, attr.scale);
        let cell = gy * gw + gx;
        let base = a * PROP_BOX;
        let out = &mut outputs[stage];
        let mut put = |c: usize, v: i8| out[(base + c) * grid_len + cell] = v;

        let conf = score.sqrt().clamp(0.05, 0.999);
        put(0, q(inv_sigmoid((fx + 0.5) / 2.0)));
        put(1, q(inv_sigmoid((fy + 0.5) / 2.0)));
        put(2, q(inv_sigmoid((w / aw).sqrt() / 2.0)));
        put(3, q(inv_sigmoid((h / ah).sqrt() / 2.0)));
        put(4, q(inv_sigmoid(conf)));
        put(5 + class_id as usize, q(inv_sigmoid(conf)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::npu::SimNpu;
    use std::io::Write;

    fn loaded_detector(input: u32, seed: Vec<(BBox, f32, u32)>) -> YoloDetector {
        let (desc, fills) = sim_model(input, input);
        let desc_for_writer = desc.clone();
        let mut npu = SimNpu::new(desc, fills);
        npu.set_output_writer(move |outs| {
            encode_detections(outs, &desc_for_writer, &seed);
        });
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"yolov5-sim").unwrap();
        let det = YoloDetector::load(
            Box::new(npu),
            f.path(),
            DEFAULT_SCORE_THRESH,
            DEFAULT_IOU_THRESH,
        )
        .unwrap();
        det
    }

    #[test]
    fn empty_output_decodes_to_no_detections() {
        let mut det = loaded_detector(640, vec![]);
        det.infer().unwrap();
        assert!(det.decode().is_empty());
    }

    #[test]
    fn encode_decode_recovers_box() {
        let want = BBox { x1: 100.0, y1: 120.0, x2: 180.0, y2: 260.0 };
        let mut det = loaded_detector(640, vec![(want, 0.9, 16)]);
        det.infer().unwrap();
        let got = det.decode();
        assert_eq!(got.len(), 1);
        let d = &got[0];
        assert_eq!(d.class_id, 16);
        assert_eq!(d.label, "dog");
        assert!(d.score > 0.5, "score {}", d.score);
        assert!(d.bbox.iou(&want) > 0.85, "iou {}", d.bbox.iou(&want));
    }

    #[test]
    fn overlapping_same_class_detections_are_suppressed() {
        let a = BBox { x1: 100.0, y1: 100.0, x2: 200.0, y2: 200.0 };
        let b = BBox { x1: 110.0, y1: 110.0, x2: 210.0, y2: 210.0 };
        let mut det = loaded_detector(640, vec![(a, 0.9, 0), (b, 0.7, 0)]);
        det.infer().unwrap();
        let got = det.decode();
        assert_eq!(got.len(), 1, "NMS must keep a single box, got {:?}", got);
    }

    #[test]
    fn input_size_follows_model() {
        let det = loaded_detector(320, vec![]);
        assert_eq!(det.input_size(), (320, 320));
    }

    #[test]
    fn low_confidence_is_filtered() {
        let faint = BBox { x1: 50.0, y1: 50.0, x2: 120.0, y2: 140.0 };
        let mut det = loaded_detector(640, vec![(faint, 0.01, 2)]);
        det.infer().unwrap();
        assert!(det.decode().is_empty());
    }
}
