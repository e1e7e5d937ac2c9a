use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facelog_core::{
    ArtifactStore, CaptureStore, Identifier, Identity, ScrfdDetector, TracingCaptureLog, Trainer,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facelog", about = "facelog offline enrollment, training and identification")]
struct Cli {
    /// Data directory holding captured_images/ and trainer/
    #[arg(long, global = true, env = "FACELOG_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory containing ONNX model files
    #[arg(long, global = true, env = "FACELOG_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a face image for an identity
    Enroll {
        /// Numeric identity to enroll under
        #[arg(short, long)]
        identity: Identity,
        /// Image file to store
        image: PathBuf,
    },
    /// Train the recognizer from every stored capture
    Train,
    /// Identify the largest face in an image
    Identify {
        /// Image file to identify
        image: PathBuf,
        /// Confidence a match must exceed to count as known
        #[arg(long, default_value_t = facelog_core::identifier::DEFAULT_CONFIDENCE_THRESHOLD)]
        threshold: f32,
    },
    /// List stored captures for an identity
    Captures {
        identity: Identity,
    },
}

struct Paths {
    capture_dir: PathBuf,
    artifact_path: PathBuf,
    detector_model: PathBuf,
}

impl Paths {
    fn new(cli: &Cli) -> Self {
        let data_dir = cli
            .data_dir
            .clone()
            .unwrap_or_else(facelog_core::default_data_dir);
        let model_dir = cli
            .model_dir
            .clone()
            .unwrap_or_else(facelog_core::default_model_dir);
        Self {
            capture_dir: data_dir.join("captured_images"),
            artifact_path: data_dir.join("trainer/model.json"),
            detector_model: model_dir.join(facelog_core::detector::SCRFD_MODEL_FILE),
        }
    }

    fn detector(&self) -> Result<ScrfdDetector> {
        ScrfdDetector::load(&self.detector_model).with_context(|| {
            format!(
                "failed to load SCRFD detector from {}",
                self.detector_model.display()
            )
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let paths = Paths::new(&cli);
    tracing::debug!(
        captures = %paths.capture_dir.display(),
        artifact = %paths.artifact_path.display(),
        "resolved data paths"
    );

    match &cli.command {
        Commands::Enroll { identity, image } => enroll(&paths, *identity, image)?,
        Commands::Train => train(&paths)?,
        Commands::Identify { image, threshold } => identify(&paths, image, *threshold)?,
        Commands::Captures { identity } => list_captures(&paths, *identity)?,
    }

    Ok(())
}

fn enroll(paths: &Paths, identity: Identity, image: &Path) -> Result<()> {
    let bytes = std::fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;
    let store = CaptureStore::new(&paths.capture_dir);
    let stored = store.enroll(identity, &bytes, &TracingCaptureLog)?;
    println!(
        "Stored capture {} for identity {} at {}",
        stored.index,
        stored.identity,
        stored.path.display()
    );
    Ok(())
}

fn train(paths: &Paths) -> Result<()> {
    let store = ArtifactStore::open(&paths.artifact_path)?;
    let mut trainer = Trainer::new(Box::new(paths.detector()?));
    let (artifact, report) = trainer.train_and_publish(&paths.capture_dir, &store)?;
    println!(
        "Training completed: {} identities, {} samples from {} images ({} skipped)",
        report.total_ids, report.samples, report.images, report.skipped_images
    );
    println!("Model written to {} at {}", store.path().display(), artifact.trained_at);
    Ok(())
}

fn identify(paths: &Paths, image: &Path, threshold: f32) -> Result<()> {
    let bytes = std::fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;
    let store = Arc::new(ArtifactStore::open(&paths.artifact_path)?);
    let identifier = Identifier::new(Box::new(paths.detector()?), store).with_threshold(threshold);
    let result = identifier.identify(&bytes)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn list_captures(paths: &Paths, identity: Identity) -> Result<()> {
    let captures = CaptureStore::new(&paths.capture_dir).captures(identity)?;
    if captures.is_empty() {
        println!("No captures for identity {identity}");
        return Ok(());
    }
    for capture in &captures {
        println!("{:>3}  {}", capture.index, capture.path.display());
    }
    Ok(())
}
