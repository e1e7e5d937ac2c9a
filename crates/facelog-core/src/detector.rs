//! Face detection.
//!
//! [`FaceDetect`] is the seam the trainer and identifier are written against.
//! [`ScrfdDetector`] implements it with the SCRFD (Sample and Computation
//! Redistribution for Efficient Face Detection) model: 3-stride anchor-free
//! decoding followed by NMS that counts how many raw candidates each surviving
//! box absorbed.

use crate::frame::GrayFrame;
use crate::types::{DetectParams, FaceRegion};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// File name of the SCRFD model inside a model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a grayscale frame.
pub trait FaceDetect: Send {
    /// Return every face region found, clipped to the frame, sorted by
    /// descending detector confidence.
    fn detect(
        &mut self,
        frame: &GrayFrame,
        params: &DetectParams,
    ) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Raw detection in original-frame coordinates, before clipping.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

/// A candidate that survived NMS, with the number of suppressed candidates
/// it absorbed.
#[derive(Debug, Clone, Copy)]
struct Grouped {
    candidate: Candidate,
    neighbors: u32,
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    input_height: usize,
    input_width: usize,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            stride_indices,
        })
    }

    /// Preprocess a grayscale frame into a NCHW float tensor with letterbox padding.
    fn preprocess(&self, frame: &GrayFrame) -> (Array4<f32>, LetterboxInfo) {
        let width = frame.width as usize;
        let height = frame.height as usize;

        let scale_w = self.input_width as f32 / width as f32;
        let scale_h = self.input_height as f32 / height as f32;
        let scale = scale_w.min(scale_h);

        let new_w = ((width as f32 * scale).round() as usize).clamp(1, self.input_width);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, self.input_height);
        let pad_x = (self.input_width - new_w) as f32 / 2.0;
        let pad_y = (self.input_height - new_h) as f32 / 2.0;

        let resized = resize_bilinear(&frame.data, width, height, new_w, new_h);

        // Pad with SCRFD_MEAN so padding normalizes to 0.0
        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;

        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_height, self.input_width));
        for y in 0..self.input_height {
            for x in 0..self.input_width {
                let inside = y >= pad_y_start
                    && y < pad_y_start + new_h
                    && x >= pad_x_start
                    && x < pad_x_start + new_w;
                let pixel = if inside {
                    resized[(y - pad_y_start) * new_w + (x - pad_x_start)] as f32
                } else {
                    SCRFD_MEAN
                };

                let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl FaceDetect for ScrfdDetector {
    fn detect(
        &mut self,
        frame: &GrayFrame,
        params: &DetectParams,
    ) -> Result<Vec<FaceRegion>, DetectorError> {
        if frame.width == 0 || frame.height == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = self.preprocess(frame);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                stride,
                self.input_width,
                self.input_height,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let grouped = nms(candidates, SCRFD_NMS_THRESHOLD);
        Ok(finalize(grouped, frame.width, frame.height, params))
    }
}

/// Bilinear resize of a grayscale buffer.
fn resize_bilinear(src: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let inv_scale_x = width as f32 / new_w as f32;
    let inv_scale_y = height as f32 / new_h as f32;
    let mut resized = vec![0u8; new_w * new_h];

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * width + x0] as f32;
            let tr = src[y0 * width + x1] as f32;
            let bl = src[y1 * width + x0] as f32;
            let br = src[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    resized
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports name their tensors either "score_8", "bbox_16", ... or with
/// generic numbers. Without recognizable names, fall back to the standard
/// positional ordering `[0-2] = scores`, `[3-5] = bboxes`.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0usize, 0usize); 3];
    let mut all_found = true;
    for (slot, &stride) in named.iter_mut().zip(SCRFD_STRIDES.iter()) {
        match (find("score", stride), find("bbox", stride)) {
            (Some(score), Some(bbox)) => *slot = (score, bbox),
            _ => {
                all_found = false;
                break;
            }
        }
    }

    if all_found {
        named
    } else {
        tracing::info!(
            ?names,
            "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
        );
        [(0, 3), (1, 4), (2, 5)]
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_width: usize,
    input_height: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Candidate> {
    let grid_h = input_height / stride;
    let grid_w = input_width / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut candidates = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid_w) as f32 * step;
        let anchor_cy = (anchor_idx / grid_w) as f32 * step;

        // bbox offsets are distances from the anchor to each edge, in strides
        let x1 = anchor_cx - bboxes[bbox_off] * step;
        let y1 = anchor_cy - bboxes[bbox_off + 1] * step;
        let x2 = anchor_cx + bboxes[bbox_off + 2] * step;
        let y2 = anchor_cy + bboxes[bbox_off + 3] * step;

        candidates.push(Candidate {
            x1: (x1 - letterbox.pad_x) / letterbox.scale,
            y1: (y1 - letterbox.pad_y) / letterbox.scale,
            x2: (x2 - letterbox.pad_x) / letterbox.scale,
            y2: (y2 - letterbox.pad_y) / letterbox.scale,
            score,
        });
    }

    candidates
}

/// Non-Maximum Suppression. Each kept candidate records how many lower-scored
/// candidates it suppressed.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Grouped> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        let mut neighbors = 0;
        for j in (i + 1)..candidates.len() {
            if !suppressed[j] && iou(&candidates[i], &candidates[j]) > iou_threshold {
                suppressed[j] = true;
                neighbors += 1;
            }
        }
        keep.push(Grouped {
            candidate: candidates[i],
            neighbors,
        });
    }

    keep
}

/// Apply `params`, clip to the frame and convert to integer regions.
fn finalize(grouped: Vec<Grouped>, width: u32, height: u32, params: &DetectParams) -> Vec<FaceRegion> {
    let max_x = width as f32;
    let max_y = height as f32;

    grouped
        .into_iter()
        .filter(|g| g.neighbors >= params.min_neighbors)
        .filter_map(|g| {
            let c = g.candidate;
            let x1 = c.x1.clamp(0.0, max_x).floor();
            let y1 = c.y1.clamp(0.0, max_y).floor();
            let x2 = c.x2.clamp(0.0, max_x).ceil();
            let y2 = c.y2.clamp(0.0, max_y).ceil();
            let region = FaceRegion {
                x: x1 as u32,
                y: y1 as u32,
                width: (x2 - x1) as u32,
                height: (y2 - y1) as u32,
                confidence: c.score,
            };
            let big_enough = region.width >= params.min_size && region.height >= params.min_size;
            (big_enough && region.within(width, height)).then_some(region)
        })
        .collect()
}

/// Compute Intersection-over-Union between two candidates.
fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(x: f32, y: f32, w: f32, h: f32, score: f32) -> Candidate {
        Candidate { x1: x, y1: y, x2: x + w, y2: y + h, score }
    }

    #[test]
    fn test_iou_identical() {
        let a = cand(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = cand(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = cand(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = cand(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = cand(5.0, 0.0, 10.0, 10.0, 1.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_counts_neighbors() {
        let candidates = vec![
            cand(0.0, 0.0, 100.0, 100.0, 0.9),
            cand(5.0, 5.0, 100.0, 100.0, 0.8),
            cand(2.0, 2.0, 100.0, 100.0, 0.7),
            cand(200.0, 200.0, 50.0, 50.0, 0.6),
        ];
        let result = nms(candidates, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].candidate.score - 0.9).abs() < 1e-6);
        assert_eq!(result[0].neighbors, 2);
        assert_eq!(result[1].neighbors, 0);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_finalize_filters_by_neighbors_and_size() {
        let grouped = vec![
            Grouped { candidate: cand(10.0, 10.0, 50.0, 50.0, 0.9), neighbors: 3 },
            Grouped { candidate: cand(100.0, 10.0, 50.0, 50.0, 0.8), neighbors: 0 },
            Grouped { candidate: cand(10.0, 100.0, 10.0, 10.0, 0.7), neighbors: 5 },
        ];
        let params = DetectParams { min_neighbors: 1, min_size: 30 };
        let regions = finalize(grouped, 200, 200, &params);
        assert_eq!(regions.len(), 1);
        assert_eq!((regions[0].x, regions[0].y), (10, 10));
    }

    #[test]
    fn test_finalize_clips_to_frame() {
        let grouped = vec![Grouped {
            candidate: cand(-20.0, -10.0, 100.0, 100.0, 0.9),
            neighbors: 4,
        }];
        let params = DetectParams { min_neighbors: 0, min_size: 1 };
        let regions = finalize(grouped, 64, 64, &params);
        assert_eq!(regions.len(), 1);
        let r = regions[0];
        assert_eq!((r.x, r.y, r.width, r.height), (0, 0, 64, 64));
        assert!(r.within(64, 64));
    }

    #[test]
    fn test_decode_stride_removes_letterbox_padding() {
        // A 320x240 frame letterboxed into 640x640: scale 2, 80px bands top and bottom.
        let stride = 32;
        let grid = 640 / stride;
        let mut scores = vec![0.0f32; grid * grid * SCRFD_ANCHORS_PER_CELL];
        // Grid cell (col 1, row 4): anchor at (32, 128).
        let idx = (4 * grid + 1) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        let mut bboxes = vec![0.0f32; scores.len() * 4];
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);

        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 80.0 };
        let dets = decode_stride(&scores, &bboxes, stride, 640, 640, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!((d.x1 - 8.0).abs() < 1e-4, "x1 = {}", d.x1);
        assert!((d.x2 - 24.0).abs() < 1e-4, "x2 = {}", d.x2);
        assert!((d.y1 - 16.0).abs() < 1e-4, "y1 = {}", d.y1);
        assert!((d.y2 - 32.0).abs() < 1e-4, "y2 = {}", d.y2);

        let shifted = LetterboxInfo { scale: 2.0, pad_x: 16.0, pad_y: 80.0 };
        let dets = decode_stride(&scores, &bboxes, stride, 640, 640, &shifted, 0.5);
        assert!((dets[0].x1 - 0.0).abs() < 1e-4);
        assert!((dets[0].x2 - 16.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_maps_through_letterbox() {
        // One confident anchor at grid cell (1, 1) of stride 32.
        let stride = 32;
        let grid = 640 / stride;
        let mut scores = vec![0.0f32; grid * grid * SCRFD_ANCHORS_PER_CELL];
        let idx = (grid + 1) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.95;
        let mut bboxes = vec![0.0f32; scores.len() * 4];
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);

        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 0.0 };
        let dets = decode_stride(&scores, &bboxes, stride, 640, 640, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        // anchor (32, 32) ± 16 in letterbox space, halved back to frame space
        assert!((dets[0].x1 - 8.0).abs() < 1e-4);
        assert!((dets[0].x2 - 24.0).abs() < 1e-4);
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(discover_output_indices(&names), [(1, 0), (3, 2), (5, 4)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_bilinear_resize_uniform() {
        let frame = vec![128u8; 100 * 100];
        let resized = resize_bilinear(&frame, 100, 100, 200, 150);
        assert_eq!(resized.len(), 200 * 150);
        assert!(resized.iter().all(|&p| p == 128), "uniform resize should stay uniform");
    }

    #[test]
    fn test_load_missing_model() {
        let result = ScrfdDetector::load(Path::new("/nonexistent/det_10g.onnx"));
        assert!(matches!(result, Err(DetectorError::ModelNotFound(_))));
    }
}
