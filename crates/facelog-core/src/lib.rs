//! facelog-core: face enrollment, LBPH training and identification.
//!
//! SCRFD (ONNX Runtime) finds faces, an LBPH recognizer models them, and an
//! atomically swapped artifact file carries the trained model from the
//! trainer to the identifier.

pub mod artifact;
pub mod capture;
pub mod classifier;
pub mod detector;
pub mod frame;
pub mod identifier;
pub mod lbph;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod trainer;
pub mod types;

pub use artifact::{Artifact, ArtifactStore};
pub use capture::{CaptureLog, CaptureRef, CaptureStore, TracingCaptureLog};
pub use classifier::{Classification, ClassifyExpression, ExpressionClassifier, LabelSet};
pub use detector::{FaceDetect, ScrfdDetector};
pub use frame::GrayFrame;
pub use identifier::Identifier;
pub use lbph::{LbphModel, LbphParams};
pub use trainer::{Trainer, TrainingReport};
pub use types::{Confidence, DetectParams, FaceRegion, Identification, Identity};

use std::path::PathBuf;

/// System-wide location of the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/facelog/models")
}

/// Per-user data directory: `$XDG_DATA_HOME/facelog`, falling back to
/// `~/.local/share/facelog`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facelog")
}
