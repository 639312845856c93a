//! Prior-based face detector with five-point landmarks (RetinaFace-family).
//!
//! Three outputs (box regression, background/face scores, landmark
//! offsets) decoded against a fixed prior-box array for the input size
//! (16,800 priors at 640x640). Box centers use variance 0.1, sizes
//! variance 0.2; landmarks use the center variance.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::npu::{NpuModelDesc, NpuRuntime, TensorAttr};
use super::{dequant, nms, quant, BBox, DetectError, Detection, Detector, DetectorKind};

pub const DEFAULT_SCORE_THRESH: f32 = 0.5;
pub const DEFAULT_IOU_THRESH: f32 = 0.2;
pub const MAX_FACES: usize = 128;

const VARIANCE_CENTER: f32 = 0.1;
const VARIANCE_SIZE: f32 = 0.2;
const PRIOR_STEPS: [u32; 3] = [8, 16, 32];
const PRIOR_MIN_SIZES: [[f32; 2]; 3] = [[16.0, 32.0], [64.0, 128.0], [256.0, 512.0]];

/// Prior boxes as `[cx, cy, w, h]` normalized to the input size, cached per
/// input geometry.
pub fn priors_for(input_w: u32, input_h: u32) -> Arc<Vec<[f32; 4]>> {
    static CACHE: Lazy<Mutex<HashMap<(u32, u32), Arc<Vec<[f32; 4]>>>>> =
        Lazy::new(|| Mutex::new(HashMap::new()));
    let mut cache = CACHE.lock();
    Arc::clone(cache.entry((input_w, input_h)).or_insert_with(|| {
        let mut priors = Vec::new();
        for (step, min_sizes) in PRIOR_STEPS.iter().zip(PRIOR_MIN_SIZES.iter()) {
            let fw = (input_w + step - 1) / step;
            let fh = (input_h + step - 1) / step;
            for i in 0..fh {
                for j in 0..fw {
                    for &min_size in min_sizes {
                        priors.push([
                            (j as f32 + 0.5) * *step as f32 / input_w as f32,
                            (i as f32 + 0.5) * *step as f32 / input_h as f32,
                            min_size / input_w as f32,
                            min_size / input_h as f32,
                        ]);
                    }
                }
            }
        }
        Arc::new(priors)
    }))
}

pub struct RetinaFaceDetector {
    runtime: Box<dyn NpuRuntime>,
    desc: NpuModelDesc,
    priors: Arc<Vec<[f32; 4]>>,
    score_thresh: f32,
    iou_thresh: f32,
}

impl RetinaFaceDetector {
    pub fn load(
        mut runtime: Box<dyn NpuRuntime>,
        model_path: &Path,
        score_thresh: f32,
        iou_thresh: f32,
    ) -> Result<Self, DetectError> {
        let desc = runtime.load(model_path)?;
        if desc.outputs.len() != 3 {
            return Err(DetectError::Load(format!(
                "expected loc/scores/landmarks outputs, model has {}",
                desc.outputs.len()
            )));
        }
        let priors = priors_for(desc.input_w, desc.input_h);
        if desc.outputs[0].len < priors.len() * 4 {
            return Err(DetectError::Load("location tensor too small for priors".into()));
        }
        Ok(Self {
            runtime,
            desc,
            priors,
            score_thresh,
            iou_thresh,
        })
    }
}

impl Detector for RetinaFaceDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::RetinaFace
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
        let (iw, ih) = (self.desc.input_w as f32, self.desc.input_h as f32);
        let loc = self.runtime.output(0);
        let scores = self.runtime.output(1);
        let landms = self.runtime.output(2);
        let loc_a = self.runtime.output_attr(0).clone();
        let score_a = self.runtime.output_attr(1).clone();
        let lm_a = self.runtime.output_attr(2).clone();

        let mut dets = Vec::new();
        for (i, prior) in self.priors.iter().enumerate() {
            let face_score = dequant(scores[i * 2 + 1], score_a.zp, score_a.scale);
            if face_score < self.score_thresh {
                continue;
            }
            let dql = |k: usize| dequant(loc[i * 4 + k], loc_a.zp, loc_a.scale);
            let cx = dql(0) * VARIANCE_CENTER * prior[2] + prior[0];
            let cy = dql(1) * VARIANCE_CENTER * prior[3] + prior[1];
            let w = (dql(2) * VARIANCE_SIZE).exp() * prior[2];
            let h = (dql(3) * VARIANCE_SIZE).exp() * prior[3];
            let bbox = BBox {
                x1: (cx - w * 0.5) * iw,
                y1: (cy - h * 0.5) * ih,
                x2: (cx + w * 0.5) * iw,
                y2: (cy + h * 0.5) * ih,
            };
            let landmarks = (0..5)
                .map(|p| {
                    let lx = dequant(landms[i * 10 + 2 * p], lm_a.zp, lm_a.scale);
                    let ly = dequant(landms[i * 10 + 2 * p + 1], lm_a.zp, lm_a.scale);
                    (
                        (lx * VARIANCE_CENTER * prior[2] + prior[0]) * iw,
                        (ly * VARIANCE_CENTER * prior[3] + prior[1]) * ih,
                    )
                })
                .collect();
            dets.push(Detection {
                bbox,
                score: face_score,
                class_id: 0,
                label: "face",
                landmarks,
            });
        }
        let mut kept = nms(dets, self.iou_thresh, false);
        kept.truncate(MAX_FACES);
        kept
    }
}

/// Tensor layout of the software model for a given input size, plus the
/// background fill for each output (all background: zero face score).
pub fn sim_model(input_w: u32, input_h: u32) -> (NpuModelDesc, Vec<i8>) {
    let n = priors_for(input_w, input_h).len();
    (
        NpuModelDesc {
            input_w,
            input_h,
            channels: 3,
            is_quantized: true,
            outputs: vec![
                TensorAttr { zp: 0, scale: 1.0 / 32.0, len: n * 4 },
                TensorAttr { zp: 0, scale: 1.0 / 128.0, len: n * 2 },
                TensorAttr { zp: 0, scale: 1.0 / 32.0, len: n * 10 },
            ],
        },
        vec![0, 0, 0],
    )
}

/// Writes faces into prior-decoded output tensors (the inverse of
/// `decode`). Used to seed the software NPU.
pub fn encode_faces(
    outputs: &mut [Vec<i8>],
    desc: &NpuModelDesc,
    faces: &[(BBox, f32, [(f32, f32); 5])],
) {
    let (iw, ih) = (desc.input_w as f32, desc.input_h as f32);
    let priors = priors_for(desc.input_w, desc.input_h);
    let loc_a = desc.outputs[0].clone();
    let score_a = desc.outputs[1].clone();
    let lm_a = desc.outputs[2].clone();
    for &(bbox, score, landmarks) in faces {
        let cx = (bbox.x1 + bbox.x2) / 2.0 / iw;
        let cy = (bbox.y1 + bbox.y2) / 2.0 / ih;
        let w = (bbox.width() / iw).max(1e-3);
        let h = (bbox.height() / ih).max(1e-3);

        // The prior that decodes this face with the smallest offsets.
        let mut best = 0usize;
        let mut best_cost = f32::MAX;
        for (i, p) in priors.iter().enumerate() {
            let cost = ((cx - p[0]) / p[2]).abs()
                + ((cy - p[1]) / p[3]).abs()
                + (w / p[2]).ln().abs()
                + (h / p[3]).ln().abs();
            if cost < best_cost {
                best_cost = cost;
                best = i;
            }
        }
        let p = priors[best];
        outputs[0][best * 4] = quant((cx - p[0]) / (VARIANCE_CENTER * p[2]), loc_a.zp, loc_a.scale);
        outputs[0][best * 4 + 1] =
            quant((cy - p[1]) / (VARIANCE_CENTER * p[3]), loc_a.zp, loc_a.scale);
        outputs[0][best * 4 + 2] = quant((w / p[2]).ln() / VARIANCE_SIZE, loc_a.zp, loc_a.scale);
        outputs[0][best * 4 + 3] = quant((h / p[3]).ln() / VARIANCE_SIZE, loc_a.zp, loc_a.scale);
        outputs[1][best * 2 + 1] = quant(score, score_a.zp, score_a.scale);
        for (pi, &(lx, ly)) in landmarks.iter().enumerate() {
            outputs[2][best * 10 + 2 * pi] =
                quant((lx / iw - p[0]) / (VARIANCE_CENTER * p[2]), lm_a.zp, lm_a.scale);
            outputs[2][best * 10 + 2 * pi + 1] =
                quant((ly / ih - p[1]) / (VARIANCE_CENTER * p[3]), lm_a.zp, lm_a.scale);
        }
    }
}
