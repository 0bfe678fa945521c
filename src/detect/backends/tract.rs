#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{FaceDetector, ThreatDetector};
use crate::detect::result::ThreatDetection;
use crate::frame::{FaceRect, Frame};

const DEFAULT_INPUT_SIZE: u32 = 640;
const IOU_THRESHOLD: f32 = 0.45;

/// Candidate box in source-frame pixels.
#[derive(Clone, Copy, Debug)]
struct Candidate {
    class: usize,
    score: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

/// YOLO-style ONNX detector run through tract.
///
/// Expects a single `[1, 3, S, S]` float input and a `[1, 4 + classes, N]`
/// (or transposed `[1, N, 4 + classes]`) output of centre-format boxes.
struct YoloModel {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    confidence_threshold: f32,
}

impl YoloModel {
    fn load(model_path: &Path, input_size: u32, confidence_threshold: f32) -> Result<Self> {
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        Ok(Self {
            model,
            input_size,
            confidence_threshold,
        })
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let side = self.input_size;
        let resized = image::imageops::resize(
            &image::RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
                .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?,
            side,
            side,
            image::imageops::FilterType::Triangle,
        );
        let side = side as usize;
        let pixels = resized.as_raw();
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            pixels[(y * side + x) * 3 + c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<Candidate>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let channels_first = shape[1] < shape[2];
        let (channels, anchors) = if channels_first {
            (shape[1], shape[2])
        } else {
            (shape[2], shape[1])
        };
        if channels < 5 {
            return Err(anyhow!("model output has {} channels, need >= 5", channels));
        }
        let at = |c: usize, i: usize| {
            if channels_first {
                view[[0, c, i]]
            } else {
                view[[0, i, c]]
            }
        };

        let sx = frame.width as f32 / self.input_size as f32;
        let sy = frame.height as f32 / self.input_size as f32;
        let mut candidates = Vec::new();
        for i in 0..anchors {
            let (class, score) = (4..channels)
                .map(|c| (c - 4, at(c, i)))
                .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
            if score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
            candidates.push(Candidate {
                class,
                score,
                x1: (cx - w / 2.0) * sx,
                y1: (cy - h / 2.0) * sy,
                x2: (cx + w / 2.0) * sx,
                y2: (cy + h / 2.0) * sy,
            });
        }
        Ok(non_max_suppression(candidates))
    }
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = ix * iy;
    let area = |c: &Candidate| (c.x2 - c.x1).max(0.0) * (c.y2 - c.y1).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

fn non_max_suppression(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::new();
    for cand in candidates {
        if kept
            .iter()
            .all(|k| k.class != cand.class || iou(k, &cand) < IOU_THRESHOLD)
        {
            kept.push(cand);
        }
    }
    kept
}

/// ONNX face detector (single-class YOLO face model).
pub struct TractFaceDetector {
    model: YoloModel,
}

impl TractFaceDetector {
    pub fn new<P: AsRef<Path>>(model_path: P, confidence_threshold: f32) -> Result<Self> {
        Ok(Self {
            model: YoloModel::load(model_path.as_ref(), DEFAULT_INPUT_SIZE, confidence_threshold)?,
        })
    }
}

impl FaceDetector for TractFaceDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<FaceRect>> {
        Ok(self
            .model
            .detect(frame)?
            .into_iter()
            .map(|c| {
                FaceRect::new(
                    c.x1 as i32,
                    c.y1 as i32,
                    (c.x2 - c.x1) as i32,
                    (c.y2 - c.y1) as i32,
                )
            })
            .collect())
    }
}

/// ONNX weapon detector. Class indices map onto `labels`.
pub struct TractThreatDetector {
    model: YoloModel,
    labels: Vec<String>,
}

impl TractThreatDetector {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        labels: Vec<String>,
        confidence_threshold: f32,
    ) -> Result<Self> {
        let model = YoloModel::load(model_path.as_ref(), DEFAULT_INPUT_SIZE, confidence_threshold)?;
        log::info!("threat model loaded. classes: {:?}", labels);
        Ok(Self { model, labels })
    }
}

impl ThreatDetector for TractThreatDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect_threats(&mut self, frame: &Frame) -> Result<Vec<ThreatDetection>> {
        let detections: Vec<ThreatDetection> = self
            .model
            .detect(frame)?
            .into_iter()
            .map(|c| ThreatDetection {
                label: self
                    .labels
                    .get(c.class)
                    .cloned()
                    .unwrap_or_else(|| c.class.to_string()),
                confidence: c.score,
                bbox: [c.x1 as i32, c.y1 as i32, c.x2 as i32, c.y2 as i32],
            })
            .collect();
        for det in &detections {
            log::debug!("threat detected: {} ({:.2})", det.label, det.confidence);
        }
        Ok(detections)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::from_rgb(vec![0u8; 64 * 64 * 3], 64, 64)?;
        self.model.detect(&blank).map(|_| ())
    }
}
