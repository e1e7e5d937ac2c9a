//! Batch training over the capture tree.

use crate::artifact::{Artifact, ArtifactError, ArtifactStore};
use crate::detector::{DetectorError, FaceDetect};
use crate::frame::{FrameError, GrayFrame};
use crate::lbph::{LbphError, LbphModel, LbphParams};
use crate::types::{DetectParams, Identity};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Detection settings used when harvesting training samples.
pub const TRAIN_DETECT_PARAMS: DetectParams = DetectParams {
    min_neighbors: 2,
    min_size: 30,
};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no images found under {0}")]
    NoImagesFound(PathBuf),
    #[error("no faces detected in {images} images")]
    NoFacesDetected { images: usize },
    #[error("capture tree I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("model fit failed: {0}")]
    Fit(#[from] LbphError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Summary of one training run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainingReport {
    /// Distinct identities in the fitted model.
    pub total_ids: usize,
    pub images: usize,
    /// Images that failed to decode or yielded no usable face.
    pub skipped_images: usize,
    pub samples: usize,
}

/// Fits an LBPH model from every capture under a root directory.
pub struct Trainer {
    detector: Box<dyn FaceDetect>,
    detect_params: DetectParams,
    lbph_params: LbphParams,
}

impl Trainer {
    pub fn new(detector: Box<dyn FaceDetect>) -> Self {
        Self {
            detector,
            detect_params: TRAIN_DETECT_PARAMS,
            lbph_params: LbphParams::default(),
        }
    }

    pub fn with_lbph_params(mut self, params: LbphParams) -> Self {
        self.lbph_params = params;
        self
    }

    /// Scan `capture_root`, fit a model and return it with a report.
    ///
    /// Per-image failures are logged and skipped; the run only fails when
    /// nothing usable is found.
    pub fn train(&mut self, capture_root: &Path) -> Result<(LbphModel, TrainingReport), TrainError> {
        let images = collect_images(capture_root)?;
        if images.is_empty() {
            return Err(TrainError::NoImagesFound(capture_root.to_path_buf()));
        }
        tracing::info!(root = %capture_root.display(), images = images.len(), "training started");

        let mut faces: Vec<(Identity, GrayFrame)> = Vec::new();
        let mut skipped_images = 0;
        for (identity, path) in &images {
            match self.harvest(*identity, path) {
                Ok(found) if found.is_empty() => {
                    tracing::warn!(path = %path.display(), "no faces detected");
                    skipped_images += 1;
                }
                Ok(found) => {
                    tracing::debug!(path = %path.display(), %identity, faces = found.len(), "faces harvested");
                    faces.extend(found.into_iter().map(|f| (*identity, f)));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping image");
                    skipped_images += 1;
                }
            }
        }

        if faces.is_empty() {
            return Err(TrainError::NoFacesDetected {
                images: images.len(),
            });
        }

        let model = LbphModel::train(self.lbph_params, faces.iter().map(|(id, f)| (*id, f)))?;
        let report = TrainingReport {
            total_ids: model.identity_count(),
            images: images.len(),
            skipped_images,
            samples: faces.len(),
        };
        tracing::info!(
            total_ids = report.total_ids,
            samples = report.samples,
            skipped = report.skipped_images,
            "training complete"
        );
        Ok((model, report))
    }

    /// Train and publish the result to `store`.
    pub fn train_and_publish(
        &mut self,
        capture_root: &Path,
        store: &ArtifactStore,
    ) -> Result<(Arc<Artifact>, TrainingReport), TrainError> {
        let (model, report) = self.train(capture_root)?;
        let artifact = store.publish(model)?;
        Ok((artifact, report))
    }

    /// Detect faces in one image and crop the in-bounds ones.
    fn harvest(&mut self, identity: Identity, path: &Path) -> Result<Vec<GrayFrame>, HarvestError> {
        let frame = GrayFrame::open(path)?;
        let regions = self.detector.detect(&frame, &self.detect_params)?;

        let mut crops = Vec::with_capacity(regions.len());
        for region in regions {
            if !region.within(frame.width, frame.height) {
                tracing::debug!(path = %path.display(), ?region, %identity, "face out of bounds");
                continue;
            }
            let crop = frame.crop(&region)?;
            // A crop too small for the grid would fail the whole fit.
            if !self.lbph_params.accepts(&crop) {
                tracing::debug!(path = %path.display(), ?region, "face too small for LBPH grid");
                continue;
            }
            crops.push(crop);
        }
        Ok(crops)
    }
}

#[derive(Error, Debug)]
enum HarvestError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
}

/// List `(identity, image path)` pairs under `root`, sorted for determinism.
fn collect_images(root: &Path) -> Result<Vec<(Identity, PathBuf)>, TrainError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut images = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let dir_name = entry.file_name();
        let Some(identity) = dir_name.to_str().and_then(|n| n.parse::<Identity>().ok()) else {
            tracing::warn!(dir = %entry.path().display(), "skipping directory with non-integer identity");
            continue;
        };

        match identity_images(&entry.path()) {
            Ok(paths) => images.extend(paths.into_iter().map(|p| (identity, p))),
            Err(e) => {
                tracing::warn!(dir = %entry.path().display(), error = %e, "skipping unreadable identity directory");
            }
        }
    }

    images.sort();
    Ok(images)
}

/// Image files directly inside one identity directory.
fn identity_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for file in fs::read_dir(dir)? {
        let path = match file {
            Ok(file) => file.path(),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if is_image && path.is_file() {
            paths.push(path);
        }
    }
    Ok(paths)
}
