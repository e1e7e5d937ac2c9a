use anyhow::{Context, Result};
use facelog_core::{
    ArtifactStore, CaptureStore, ClassifyExpression, ExpressionClassifier, Identifier,
    ScrfdDetector, Trainer,
};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod engine;
mod http;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facelogd starting");

    let config = config::Config::from_env();

    let artifacts = Arc::new(
        ArtifactStore::open(&config.artifact_path).context("failed to open recognition artifact")?,
    );
    if artifacts.snapshot().is_none() {
        tracing::info!(
            path = %config.artifact_path.display(),
            "no recognition artifact yet; identification disabled until training"
        );
    }

    // One detector session for online identification, one owned by the
    // training engine thread.
    let scrfd_path = config.scrfd_model_path();
    let identify_detector =
        ScrfdDetector::load(&scrfd_path).context("failed to load SCRFD detector")?;
    let train_detector =
        ScrfdDetector::load(&scrfd_path).context("failed to load SCRFD detector")?;
    tracing::info!(path = %scrfd_path.display(), "SCRFD detector loaded");

    let classifier = match ExpressionClassifier::load(
        &config.expression_model_path(),
        config.expression_labels.clone(),
    ) {
        Ok(c) => Some(Mutex::new(Box::new(c) as Box<dyn ClassifyExpression>)),
        Err(e) => {
            tracing::warn!(error = %e, "expression classifier unavailable; /predict disabled");
            None
        }
    };

    let db = db::Database::init(&config.db_path).context("failed to open database")?;

    let engine = engine::spawn_engine(
        Trainer::new(Box::new(train_detector)),
        config.capture_dir.clone(),
        artifacts.clone(),
    )?;

    let state = Arc::new(http::AppState {
        captures: CaptureStore::with_quota(&config.capture_dir, config.capture_quota),
        identifier: Identifier::new(Box::new(identify_detector), artifacts.clone())
            .with_threshold(config.confidence_threshold),
        artifacts,
        classifier,
        db,
        engine,
    });

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(
        addr = %config.bind,
        captures = %config.capture_dir.display(),
        quota = config.capture_quota,
        threshold = config.confidence_threshold,
        "facelogd ready"
    );

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("facelogd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
