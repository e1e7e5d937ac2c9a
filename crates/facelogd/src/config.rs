use facelog_core::classifier::EXPRESSION_MODEL_FILE;
use facelog_core::detector::SCRFD_MODEL_FILE;
use facelog_core::LabelSet;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Address the HTTP server listens on (default: 127.0.0.1:5000).
    pub bind: SocketAddr,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Root of the per-identity capture tree.
    pub capture_dir: PathBuf,
    /// Trained recognition artifact.
    pub artifact_path: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum captures stored per identity.
    pub capture_quota: usize,
    /// Confidence a match must exceed to be reported as known.
    pub confidence_threshold: f32,
    /// Expression labels in model output order, plus their categories.
    pub expression_labels: LabelSet,
}

impl Config {
    /// Load configuration from `FACELOG_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACELOG_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facelog_core::default_model_dir());

        let data_dir = std::env::var("FACELOG_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facelog_core::default_data_dir());

        let bind = std::env::var("FACELOG_BIND")
            .ok()
            .and_then(|v| match v.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    tracing::warn!(value = %v, "invalid FACELOG_BIND; using default");
                    None
                }
            })
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 5000)));

        Self {
            bind,
            model_dir,
            capture_dir: env_path("FACELOG_CAPTURE_DIR", data_dir.join("captured_images")),
            artifact_path: env_path("FACELOG_ARTIFACT_PATH", data_dir.join("trainer/model.json")),
            db_path: env_path("FACELOG_DB_PATH", data_dir.join("facelog.db")),
            capture_quota: env_usize(
                "FACELOG_CAPTURE_QUOTA",
                facelog_core::capture::MAX_CAPTURES_PER_IDENTITY,
            ),
            confidence_threshold: env_f32(
                "FACELOG_CONFIDENCE_THRESHOLD",
                facelog_core::identifier::DEFAULT_CONFIDENCE_THRESHOLD,
            ),
            expression_labels: label_set(
                std::env::var("FACELOG_EXPRESSION_LABELS").ok().as_deref(),
                std::env::var("FACELOG_EXPRESSION_REMAP").ok().as_deref(),
            ),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_MODEL_FILE)
    }

    /// Path to the expression classification model.
    pub fn expression_model_path(&self) -> PathBuf {
        self.model_dir.join(EXPRESSION_MODEL_FILE)
    }
}

/// Build the expression label set. Without explicit labels the eye/yawn set
/// is used; an explicit remap replaces the default one.
fn label_set(labels: Option<&str>, remap: Option<&str>) -> LabelSet {
    let base = match labels {
        Some(list) if !list.trim().is_empty() => {
            LabelSet::new(list.split(',').map(str::trim).filter(|l| !l.is_empty()))
        }
        _ => match remap {
            Some(_) => LabelSet::new(LabelSet::eye_yawn().labels().to_vec()),
            None => return LabelSet::eye_yawn(),
        },
    };

    match remap {
        Some(pairs) => base.with_remap(parse_remap(pairs)),
        None => base,
    }
}

/// Parse `from=to,from=to`. Malformed entries are skipped with a warning.
fn parse_remap(pairs: &str) -> Vec<(String, String)> {
    pairs
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|pair| match pair.split_once('=') {
            Some((from, to)) if !from.trim().is_empty() && !to.trim().is_empty() => {
                Some((from.trim().to_string(), to.trim().to_string()))
            }
            _ => {
                tracing::warn!(entry = pair, "ignoring malformed FACELOG_EXPRESSION_REMAP entry");
                None
            }
        })
        .collect()
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
