//! Local Binary Patterns Histograms (LBPH) face recognizer.
//!
//! Each face crop is turned into a basic 3×3 LBP code image, split into a
//! `grid_x × grid_y` grid, and summarized as one 256-bin histogram per cell
//! (normalized by the cell's pixel count). Prediction is nearest-neighbour
//! over all training samples using the alternative chi-square distance.

use crate::frame::GrayFrame;
use crate::types::Identity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

const LBP_BINS: usize = 256;
const DEFAULT_GRID: u32 = 8;

/// Neighbour offsets (dx, dy), clockwise from the top-left. Bit 7 is the
/// top-left neighbour.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

#[derive(Error, Debug)]
pub enum LbphError {
    #[error("no training samples")]
    NoSamples,
    #[error("face crop {width}x{height} too small for a {grid_x}x{grid_y} grid")]
    CropTooSmall {
        width: u32,
        height: u32,
        grid_x: u32,
        grid_y: u32,
    },
    #[error("histogram length {actual} does not match model ({expected})")]
    ShapeMismatch { expected: usize, actual: usize },
}

/// Grid layout used when extracting histograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            grid_x: DEFAULT_GRID,
            grid_y: DEFAULT_GRID,
        }
    }
}

impl LbphParams {
    fn histogram_len(&self) -> usize {
        (self.grid_x * self.grid_y) as usize * LBP_BINS
    }

    /// Whether a crop is large enough to give every grid cell at least one
    /// LBP code (LBP drops a one-pixel border).
    pub fn accepts(&self, face: &GrayFrame) -> bool {
        self.grid_x > 0
            && self.grid_y > 0
            && face.width.saturating_sub(2) >= self.grid_x
            && face.height.saturating_sub(2) >= self.grid_y
    }

    /// Compute the concatenated spatial histogram of a face crop.
    pub fn histogram(&self, face: &GrayFrame) -> Result<Vec<f32>, LbphError> {
        if !self.accepts(face) {
            return Err(LbphError::CropTooSmall {
                width: face.width,
                height: face.height,
                grid_x: self.grid_x,
                grid_y: self.grid_y,
            });
        }

        let lbp_w = face.width - 2;
        let lbp_h = face.height - 2;
        let codes = lbp_codes(face);
        let cell_w = lbp_w / self.grid_x;
        let cell_h = lbp_h / self.grid_y;
        let cell_pixels = (cell_w * cell_h) as f32;

        let mut hist = vec![0.0f32; self.histogram_len()];
        for gy in 0..self.grid_y {
            for gx in 0..self.grid_x {
                let cell = ((gy * self.grid_x + gx) as usize) * LBP_BINS;
                for y in gy * cell_h..(gy + 1) * cell_h {
                    let row = (y * lbp_w) as usize;
                    for x in gx * cell_w..(gx + 1) * cell_w {
                        hist[cell + codes[row + x as usize] as usize] += 1.0;
                    }
                }
                for bin in &mut hist[cell..cell + LBP_BINS] {
                    *bin /= cell_pixels;
                }
            }
        }

        Ok(hist)
    }
}

/// Basic 8-neighbour, radius-1 LBP. Output is `(w-2) × (h-2)`.
fn lbp_codes(face: &GrayFrame) -> Vec<u8> {
    let w = face.width as i32;
    let h = face.height as i32;
    let mut codes = Vec::with_capacity(((w - 2) * (h - 2)).max(0) as usize);

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let centre = face.pixel(x as u32, y as u32);
            let mut code = 0u8;
            for (bit, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
                if face.pixel((x + dx) as u32, (y + dy) as u32) >= centre {
                    code |= 1 << (7 - bit);
                }
            }
            codes.push(code);
        }
    }

    codes
}

/// Alternative chi-square distance: Σ 2(a−b)² / (a+b).
pub fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&a, &b)| {
            let sum = a as f64 + b as f64;
            if sum > 0.0 {
                let diff = a as f64 - b as f64;
                2.0 * diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}

/// One labelled training histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub identity: Identity,
    pub histogram: Vec<f32>,
}

/// A trained LBPH model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    pub params: LbphParams,
    samples: Vec<Sample>,
}

/// Nearest training sample for a query face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub identity: Identity,
    pub distance: f64,
}

impl LbphModel {
    /// Fit a model over labelled face crops.
    pub fn train<'a, I>(params: LbphParams, faces: I) -> Result<Self, LbphError>
    where
        I: IntoIterator<Item = (Identity, &'a GrayFrame)>,
    {
        let samples = faces
            .into_iter()
            .map(|(identity, face)| {
                Ok(Sample {
                    identity,
                    histogram: params.histogram(face)?,
                })
            })
            .collect::<Result<Vec<_>, LbphError>>()?;

        if samples.is_empty() {
            return Err(LbphError::NoSamples);
        }

        Ok(Self { params, samples })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Distinct identities the model was trained on, ascending.
    pub fn identities(&self) -> Vec<Identity> {
        self.samples
            .iter()
            .map(|s| s.identity)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn identity_count(&self) -> usize {
        self.identities().len()
    }

    /// Check that every stored histogram has the shape `params` implies.
    pub fn validate(&self) -> Result<(), LbphError> {
        if self.samples.is_empty() {
            return Err(LbphError::NoSamples);
        }
        let expected = self.params.histogram_len();
        match self.samples.iter().find(|s| s.histogram.len() != expected) {
            Some(bad) => Err(LbphError::ShapeMismatch {
                expected,
                actual: bad.histogram.len(),
            }),
            None => Ok(()),
        }
    }

    /// Find the closest training sample to `face`.
    pub fn predict(&self, face: &GrayFrame) -> Result<Prediction, LbphError> {
        let query = self.params.histogram(face)?;

        let mut best: Option<Prediction> = None;
        for sample in &self.samples {
            let distance = chi_square(&sample.histogram, &query);
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Prediction {
                    identity: sample.identity,
                    distance,
                });
            }
        }

        best.ok_or(LbphError::NoSamples)
    }
}
