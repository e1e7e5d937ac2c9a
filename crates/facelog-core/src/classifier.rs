//! Expression classifier via ONNX Runtime.
//!
//! Runs a small CNN (exported to ONNX) over a 48×48 RGB frame and maps the
//! argmax onto an injected label set, optionally remapping fine-grained
//! labels onto coarser categories such as "focus" / "drowsy".

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const EXPRESSION_INPUT_SIZE: usize = 48;
const EXPRESSION_SCALE: f32 = 255.0;

/// File name of the expression model inside a model directory.
pub const EXPRESSION_MODEL_FILE: &str = "expression.onnx";

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model produced {outputs} scores but {labels} labels are configured")]
    LabelMismatch { outputs: usize, labels: usize },
    #[error("invalid image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Ordered class labels plus an optional label → category table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<String>,
    remap: HashMap<String, String>,
}

impl LabelSet {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            remap: HashMap::new(),
        }
    }

    pub fn with_remap<I, A, B>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        self.remap
            .extend(pairs.into_iter().map(|(a, b)| (a.into(), b.into())));
        self
    }

    /// Eye and yawn states, grouped into focus / drowsy.
    pub fn eye_yawn() -> Self {
        Self::new(["Closed", "Open", "no_yawn", "yawn"]).with_remap([
            ("Closed", "drowsy"),
            ("yawn", "drowsy"),
            ("Open", "focus"),
            ("no_yawn", "focus"),
        ])
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Category for `label`; labels without an entry map to themselves.
    pub fn category<'a>(&'a self, label: &'a str) -> &'a str {
        self.remap.get(label).map_or(label, String::as_str)
    }

    /// Pick the highest-scoring label.
    pub fn decide(&self, scores: &[f32]) -> Result<Classification, ClassifierError> {
        if scores.len() != self.labels.len() || scores.is_empty() {
            return Err(ClassifierError::LabelMismatch {
                outputs: scores.len(),
                labels: self.labels.len(),
            });
        }

        let (best, score) = scores
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, s)| if s > acc.1 { (i, s) } else { acc });

        let label = &self.labels[best];
        Ok(Classification {
            label: label.clone(),
            category: self.category(label).to_string(),
            score,
        })
    }
}

/// Result of classifying one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub label: String,
    pub category: String,
    pub score: f32,
}

/// Anything that can label a frame with an expression.
pub trait ClassifyExpression: Send {
    fn classify(&mut self, image: &DynamicImage) -> Result<Classification, ClassifierError>;

    /// Decode and classify an encoded image.
    fn classify_bytes(&mut self, image_bytes: &[u8]) -> Result<Classification, ClassifierError> {
        let image = image::load_from_memory(image_bytes)?;
        self.classify(&image)
    }
}

/// CNN-based expression classifier.
pub struct ExpressionClassifier {
    session: Session,
    labels: LabelSet,
}

impl ExpressionClassifier {
    /// Load the expression ONNX model from the given path.
    pub fn load(model_path: &Path, labels: LabelSet) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            labels = ?labels.labels(),
            "loaded expression model"
        );

        Ok(Self { session, labels })
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Resize to 48×48 RGB and scale to [0, 1] in NHWC layout.
    fn preprocess(image: &DynamicImage) -> Array4<f32> {
        let size = EXPRESSION_INPUT_SIZE;
        let rgb = image
            .resize_exact(size as u32, size as u32, FilterType::Triangle)
            .to_rgb8();

        let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / EXPRESSION_SCALE;
            }
        }
        tensor
    }
}

impl ClassifyExpression for ExpressionClassifier {
    fn classify(&mut self, image: &DynamicImage) -> Result<Classification, ClassifierError> {
        let input = Self::preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("scores: {e}")))?;

        self.labels.decide(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_preprocess_output_shape() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(120, 90));
        let tensor = ExpressionClassifier::preprocess(&image);
        assert_eq!(tensor.shape(), &[1, EXPRESSION_INPUT_SIZE, EXPRESSION_INPUT_SIZE, 3]);
    }

    #[test]
    fn test_preprocess_scales_to_unit_range() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(48, 48, Rgb([255, 0, 51])));
        let tensor = ExpressionClassifier::preprocess(&image);
        assert!((tensor[[0, 10, 20, 0]] - 1.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 10, 20, 1]], 0.0);
        assert!((tensor[[0, 10, 20, 2]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_decide_argmax_and_remap() {
        let labels = LabelSet::eye_yawn();
        let result = labels.decide(&[0.1, 0.2, 0.05, 0.65]).unwrap();
        assert_eq!(result.label, "yawn");
        assert_eq!(result.category, "drowsy");
        assert!((result.score - 0.65).abs() < 1e-6);

        let result = labels.decide(&[0.1, 0.7, 0.1, 0.1]).unwrap();
        assert_eq!((result.label.as_str(), result.category.as_str()), ("Open", "focus"));
    }

    #[test]
    fn test_unmapped_label_is_its_own_category() {
        let labels = LabelSet::new(["happy", "sad"]).with_remap([("sad", "disengaged")]);
        assert_eq!(labels.category("happy"), "happy");
        assert_eq!(labels.decide(&[0.9, 0.1]).unwrap().category, "happy");
        assert_eq!(labels.decide(&[0.1, 0.9]).unwrap().category, "disengaged");
    }

    #[test]
    fn test_decide_rejects_width_mismatch() {
        let labels = LabelSet::eye_yawn();
        assert!(matches!(
            labels.decide(&[0.5, 0.5]),
            Err(ClassifierError::LabelMismatch { outputs: 2, labels: 4 })
        ));
        assert!(LabelSet::new(Vec::<String>::new()).decide(&[]).is_err());
    }

    struct FixedScores(Vec<f32>, LabelSet);

    impl ClassifyExpression for FixedScores {
        fn classify(&mut self, _image: &DynamicImage) -> Result<Classification, ClassifierError> {
            self.1.decide(&self.0)
        }
    }

    #[test]
    fn test_classify_bytes_decodes_first() {
        let mut fake = FixedScores(vec![0.9, 0.0, 0.05, 0.05], LabelSet::eye_yawn());
        assert!(matches!(
            fake.classify_bytes(b"not an image"),
            Err(ClassifierError::InvalidImage(_))
        ));

        let mut png = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(8, 8))
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();
        let result = fake.classify_bytes(png.get_ref()).unwrap();
        assert_eq!(result.category, "drowsy");
    }

    #[test]
    fn test_load_missing_model() {
        let result = ExpressionClassifier::load(Path::new("/nonexistent/expression.onnx"), LabelSet::eye_yawn());
        assert!(matches!(result, Err(ClassifierError::ModelNotFound(_))));
    }
}
