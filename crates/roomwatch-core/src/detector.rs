//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB frame into the 640×640 model input, decodes the three
//! anchor-free stride heads and suppresses overlapping boxes.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download from insightface and place it in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can locate faces in an RGB frame.
///
/// Boxes are in the coordinates of the image passed in, highest confidence first.
pub trait FaceDetect {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Placement of the resized frame inside the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    left: f32,
    top: f32,
}

impl Letterbox {
    fn to_frame(self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.left) / self.scale, (y - self.top) / self.scale)
    }
}

/// Output tensor positions for one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Raw tensors of one stride head.
struct HeadTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    heads: [HeadOutputs; 3],
}

impl FaceDetector {
    /// Load an SCRFD ONNX model (e.g. `det_10g.onnx`).
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let heads = head_layout(&output_names);
        tracing::debug!(?heads, "SCRFD output layout");

        Ok(Self { session, heads })
    }

    fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
        let (width, height) = image.dimensions();
        let side = SCRFD_INPUT_SIZE as f32;
        let scale = (side / width as f32).min(side / height as f32);

        let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let left = (SCRFD_INPUT_SIZE as u32 - new_w) / 2;
        let top = (SCRFD_INPUT_SIZE as u32 - new_h) / 2;

        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        // Zero is the normalized value of SCRFD_MEAN, so padding needs no fill.
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = ((x + left) as usize, (y + top) as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        let letterbox = Letterbox {
            scale,
            left: left as f32,
            top: top as f32,
        };
        (tensor, letterbox)
    }
}

impl FaceDetect for FaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = Self::preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (head, &stride) in self.heads.iter().zip(SCRFD_STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let tensors = HeadTensors {
                scores: extract(head.score, "scores")?,
                bboxes: extract(head.bbox, "bboxes")?,
                kps: extract(head.kps, "kps")?,
            };
            candidates.extend(decode_head(&tensors, stride, letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Map output tensors to stride heads.
///
/// Exports with named outputs ("score_8", "bbox_16", "kps_32", ...) are mapped
/// by name. Anything else uses the standard positional order:
/// [0-2] scores, [3-5] bboxes, [6-8] kps, each for strides 8/16/32.
fn head_layout(names: &[String]) -> [HeadOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<HeadOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(HeadOutputs {
                score: find("score", stride)?,
                bbox: find("bbox", stride)?,
                kps: find("kps", stride)?,
            })
        })
        .collect();

    match named.and_then(|heads| <[HeadOutputs; 3]>::try_from(heads).ok()) {
        Some(heads) => heads,
        None => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional layout");
            std::array::from_fn(|i| HeadOutputs {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Decode every anchor above `threshold` for one stride head into frame coordinates.
fn decode_head(
    tensors: &HeadTensors<'_>,
    stride: usize,
    letterbox: Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *tensors.scores.get(idx)?;
            if score <= threshold {
                return None;
            }

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let d = tensors.bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.to_frame((cx - d[0] * step, cy - d[1] * step));
            let (x2, y2) = letterbox.to_frame((cx + d[2] * step, cy + d[3] * step));

            let landmarks = tensors.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| {
                    letterbox.to_frame((cx + k[i * 2] * step, cy + k[i * 2 + 1] * step))
                })
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression. Output is sorted by descending confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-Union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = (a.right().min(b.right()) - a.x.max(b.x)).max(0.0);
    let inter_h = (a.bottom().min(b.bottom()) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: conf,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        // 50 shared over a 150 union
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping_and_sorts() {
        let detections = vec![
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let image = RgbImage::new(320, 240);
        let (tensor, letterbox) = FaceDetector::preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);
        assert!((letterbox.scale - 2.0).abs() < 1e-6);
        assert_eq!(letterbox.left, 0.0);
        assert_eq!(letterbox.top, 80.0);

        let (x, y) = letterbox.to_frame((100.0 * 2.0, 50.0 * 2.0 + 80.0));
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_normalizes_and_pads() {
        let image = RgbImage::from_pixel(640, 320, image::Rgb([255, 128, 0]));
        let (tensor, letterbox) = FaceDetector::preprocess(&image);
        assert_eq!(letterbox.top, 160.0);
        // padding rows stay at zero
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        // content rows carry each channel separately
        assert!((tensor[[0, 0, 320, 320]] - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-5);
        assert!((tensor[[0, 1, 320, 320]] - (128.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-5);
        assert!((tensor[[0, 2, 320, 320]] - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-5);
    }

    #[test]
    fn test_decode_head_single_anchor() {
        let stride = 32;
        let grid = SCRFD_INPUT_SIZE / stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];

        // anchor cell (x=2, y=1) → centre (64, 32) in model space
        let idx = (grid + 2) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let tensors = HeadTensors {
            scores: &scores,
            bboxes: &bboxes,
            kps: &kps,
        };
        let letterbox = Letterbox {
            scale: 2.0,
            left: 0.0,
            top: 0.0,
        };
        let boxes = decode_head(&tensors, stride, letterbox, 0.5);

        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        assert!((b.x - 16.0).abs() < 1e-4, "x = {}", b.x);
        assert!((b.y - 0.0).abs() < 1e-4, "y = {}", b.y);
        assert!((b.width - 32.0).abs() < 1e-4);
        assert!((b.height - 32.0).abs() < 1e-4);
        assert_eq!(b.landmarks.unwrap()[0], (32.0, 16.0));
    }

    #[test]
    fn test_head_layout_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let heads = head_layout(&names);
        assert_eq!(heads[0], HeadOutputs { score: 2, bbox: 0, kps: 1 });
        assert_eq!(heads[2], HeadOutputs { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_head_layout_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        let heads = head_layout(&names);
        assert_eq!(heads[1], HeadOutputs { score: 1, bbox: 4, kps: 7 });
    }
}
