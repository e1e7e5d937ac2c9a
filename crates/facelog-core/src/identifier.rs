//! Online identification against the current recognition artifact.

use crate::artifact::ArtifactStore;
use crate::detector::{DetectorError, FaceDetect};
use crate::frame::{FrameError, GrayFrame};
use crate::lbph::LbphError;
use crate::types::{Confidence, DetectParams, FaceRegion, Identification};
use std::cmp::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Detection settings used for query images.
pub const IDENTIFY_DETECT_PARAMS: DetectParams = DetectParams {
    min_neighbors: 2,
    min_size: 30,
};

/// Matches must score strictly above this to be reported as known.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 50.0;

#[derive(Error, Debug)]
pub enum IdentifyError {
    #[error("no recognition model has been trained")]
    ModelUnavailable,
    #[error("invalid image: {0}")]
    InvalidImage(#[from] FrameError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] LbphError),
}

/// Scores query images against whatever artifact the store currently holds.
pub struct Identifier {
    detector: Mutex<Box<dyn FaceDetect>>,
    artifacts: Arc<ArtifactStore>,
    detect_params: DetectParams,
    threshold: f32,
}

impl Identifier {
    pub fn new(detector: Box<dyn FaceDetect>, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            detector: Mutex::new(detector),
            artifacts,
            detect_params: IDENTIFY_DETECT_PARAMS,
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Identify the largest face in an encoded image.
    pub fn identify(&self, image_bytes: &[u8]) -> Result<Identification, IdentifyError> {
        // Take the snapshot up front: a publish mid-request must not change
        // which model scores this image.
        let artifact = self.artifacts.snapshot().ok_or(IdentifyError::ModelUnavailable)?;

        let frame = GrayFrame::decode(image_bytes)?;
        let regions = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detect(&frame, &self.detect_params)?;

        let region = select_face(&regions, frame.width, frame.height).ok_or(IdentifyError::NoFaceDetected)?;
        let crop = frame.crop(&region)?;
        let prediction = artifact.model.predict(&crop)?;
        let confidence = Confidence::from_distance(prediction.distance);

        let identity = (confidence.value() > self.threshold).then_some(prediction.identity);
        tracing::info!(
            candidate = %prediction.identity,
            distance = prediction.distance,
            confidence = confidence.value(),
            known = identity.is_some(),
            "identification scored"
        );

        Ok(Identification {
            identity,
            confidence,
            region,
        })
    }
}

/// Pick the face to score: the largest in-bounds region, ties broken by
/// detector confidence.
pub fn select_face(regions: &[FaceRegion], width: u32, height: u32) -> Option<FaceRegion> {
    regions
        .iter()
        .filter(|r| r.within(width, height))
        .max_by(|a, b| {
            a.area().cmp(&b.area()).then_with(|| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(Ordering::Equal)
            })
        })
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbph::{LbphModel, LbphParams};
    use crate::testing::{blank_image, face_image, png_bytes as png, BrightBoxDetector};
    use crate::trainer::Trainer;
    use crate::types::Identity;
    use image::GrayImage;
    use tempfile::TempDir;

    fn region(x: u32, y: u32, w: u32, h: u32, confidence: f32) -> FaceRegion {
        FaceRegion { x, y, width: w, height: h, confidence }
    }

    /// Store holding a model trained on identity 1's captures only.
    fn trained_on_one(dir: &TempDir) -> Arc<ArtifactStore> {
        let captures = dir.path().join("captured_images");
        for (i, shift) in [0u8, 12, 24].iter().enumerate() {
            let d = captures.join("1");
            std::fs::create_dir_all(&d).unwrap();
            face_image(1, *shift).save(d.join(format!("1.{}.png", i + 1))).unwrap();
        }
        let store = Arc::new(ArtifactStore::open(dir.path().join("trainer/model.json")).unwrap());
        Trainer::new(Box::new(BrightBoxDetector))
            .train_and_publish(&captures, &store)
            .unwrap();
        store
    }

    fn identifier(store: Arc<ArtifactStore>) -> Identifier {
        Identifier::new(Box::new(BrightBoxDetector), store)
    }

    #[test]
    fn test_model_unavailable_before_training() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::open(dir.path().join("model.json")).unwrap());
        let result = identifier(store).identify(&png(face_image(1, 0)));
        assert!(matches!(result, Err(IdentifyError::ModelUnavailable)));
    }

    #[test]
    fn test_no_face_detected() {
        let dir = TempDir::new().unwrap();
        let result = identifier(trained_on_one(&dir)).identify(&png(blank_image()));
        assert!(matches!(result, Err(IdentifyError::NoFaceDetected)));
    }

    #[test]
    fn test_invalid_image() {
        let dir = TempDir::new().unwrap();
        let result = identifier(trained_on_one(&dir)).identify(b"GIF89a nope");
        assert!(matches!(result, Err(IdentifyError::InvalidImage(_))));
    }

    #[test]
    fn test_known_face_identified() {
        let dir = TempDir::new().unwrap();
        // A fresh, differently lit capture of the same face.
        let result = identifier(trained_on_one(&dir))
            .identify(&png(face_image(1, 30)))
            .unwrap();
        assert_eq!(result.identity, Some(Identity::new(1)));
        assert!(result.confidence.value() > 50.0);
        assert_eq!((result.region.x, result.region.y), (16, 16));
    }

    #[test]
    fn test_unrelated_face_unknown() {
        let dir = TempDir::new().unwrap();
        let flat = GrayImage::from_fn(96, 96, |x, y| {
            let inside = (16..80).contains(&x) && (16..80).contains(&y);
            image::Luma([if inside { 128 } else { 0 }])
        });
        let result = identifier(trained_on_one(&dir)).identify(&png(flat)).unwrap();
        assert!(!result.is_known());
        assert!(result.confidence.value() <= 50.0);
        assert!(result.confidence.value() >= 0.0);
    }

    #[test]
    fn test_threshold_is_strict() {
        let dir = TempDir::new().unwrap();
        let strict = identifier(trained_on_one(&dir)).with_threshold(100.0);
        let result = strict.identify(&png(face_image(1, 0))).unwrap();
        // Perfect match scores exactly 100, which is not above 100.
        assert_eq!(result.confidence.value(), 100.0);
        assert!(!result.is_known());
    }

    #[test]
    fn test_sees_newly_published_artifact() {
        let dir = TempDir::new().unwrap();
        let store = trained_on_one(&dir);
        let id = identifier(store.clone());

        let face = GrayImage::from_fn(64, 64, |x, y| image::Luma([((x * 31 + y * 17) % 200) as u8 + 20]));
        let crop = GrayFrame::from_luma(face.clone());
        store
            .publish(LbphModel::train(LbphParams::default(), [(Identity::new(42), &crop)]).unwrap())
            .unwrap();

        let result = id.identify(&png(face)).unwrap();
        assert_eq!(result.identity, Some(Identity::new(42)));
    }

    #[test]
    fn test_select_face_prefers_largest() {
        let regions = [
            region(0, 0, 40, 40, 0.99),
            region(50, 50, 60, 60, 0.60),
            region(10, 10, 30, 30, 0.95),
        ];
        let picked = select_face(&regions, 200, 200).unwrap();
        assert_eq!((picked.x, picked.width), (50, 60));
    }

    #[test]
    fn test_select_face_tie_uses_confidence() {
        let regions = [region(0, 0, 40, 40, 0.7), region(100, 0, 40, 40, 0.9)];
        assert_eq!(select_face(&regions, 200, 200).unwrap().x, 100);
    }

    #[test]
    fn test_select_face_skips_out_of_bounds() {
        let regions = [region(150, 150, 100, 100, 0.9), region(0, 0, 40, 40, 0.5)];
        assert_eq!(select_face(&regions, 200, 200).unwrap().x, 0);
        assert!(select_face(&[], 200, 200).is_none());
    }
}
