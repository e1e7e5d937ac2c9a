//! HTTP interface of the facelog daemon.
//!
//! | route | handler |
//! |---|---|
//! | `POST /capture` | store one labelled face image |
//! | `POST /start-training` | queue (or, with `?wait=true`, run) a training job |
//! | `GET /training` | state of the latest training job |
//! | `POST /identify-user` | identify the largest face in a multipart `frame` |
//! | `POST /predict` | classify the expression in a multipart `frame` |
//! | `GET /captures/:identity` | list stored captures |
//! | `GET /health` | daemon status |

use crate::db::Database;
use crate::engine::{EngineError, EngineHandle, TrainStart};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use facelog_core::capture::CaptureError;
use facelog_core::classifier::ClassifierError;
use facelog_core::identifier::IdentifyError;
use facelog_core::trainer::TrainError;
use facelog_core::{ArtifactStore, CaptureStore, ClassifyExpression, Identifier, Identity};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Shared state handed to every handler.
pub struct AppState {
    pub captures: CaptureStore,
    pub identifier: Identifier,
    pub artifacts: Arc<ArtifactStore>,
    pub classifier: Option<Mutex<Box<dyn ClassifyExpression>>>,
    pub db: Database,
    pub engine: EngineHandle,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Identify(#[from] IdentifyError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error("expression classifier is not loaded")]
    ClassifierUnavailable,
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        use StatusCode as S;
        match self {
            Self::InvalidInput(_)
            | Self::Capture(CaptureError::InvalidImage(_))
            | Self::Identify(IdentifyError::InvalidImage(_))
            | Self::Classifier(ClassifierError::InvalidImage(_)) => (S::BAD_REQUEST, "invalid_input"),
            Self::Capture(CaptureError::QuotaExceeded { .. }) => (S::BAD_REQUEST, "quota_exceeded"),
            Self::Identify(IdentifyError::NoFaceDetected) => (S::BAD_REQUEST, "no_face_detected"),
            Self::Identify(IdentifyError::ModelUnavailable) => (S::SERVICE_UNAVAILABLE, "model_unavailable"),
            Self::ClassifierUnavailable => (S::SERVICE_UNAVAILABLE, "classifier_unavailable"),
            Self::Engine(EngineError::AlreadyRunning(_)) => (S::CONFLICT, "training_in_progress"),
            Self::Engine(EngineError::Train(TrainError::NoImagesFound(_))) => {
                (S::UNPROCESSABLE_ENTITY, "no_images_found")
            }
            Self::Engine(EngineError::Train(TrainError::NoFacesDetected { .. })) => {
                (S::UNPROCESSABLE_ENTITY, "no_faces_detected")
            }
            Self::Capture(CaptureError::Storage(_) | CaptureError::Log(_))
            | Self::Engine(EngineError::Train(TrainError::Io(_) | TrainError::Artifact(_)))
            | Self::Database(_) => (S::INTERNAL_SERVER_ERROR, "storage_error"),
            Self::Identify(_) | Self::Engine(_) | Self::Classifier(_) | Self::Join(_) => {
                (S::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            tracing::error!(error = %self, kind, "request failed");
        } else {
            tracing::warn!(error = %self, kind, "request rejected");
        }
        (
            status,
            Json(json!({ "error": kind, "message": self.to_string() })),
        )
            .into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/capture", post(capture))
        .route("/start-training", post(start_training))
        .route("/training", get(training_status))
        .route("/identify-user", post(identify_user))
        .route("/predict", post(predict))
        .route("/captures/:identity", get(list_captures))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CaptureRequest {
    #[serde(rename = "userId")]
    user_id: Option<Identity>,
    image: Option<String>,
}

async fn capture(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CaptureRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::InvalidInput(e.body_text()))?;
    let identity = req
        .user_id
        .ok_or_else(|| ApiError::InvalidInput("missing userId".into()))?;
    let image = req
        .image
        .as_deref()
        .ok_or_else(|| ApiError::InvalidInput("missing image".into()))?;
    let bytes = decode_image_payload(image)?;

    let stored = tokio::task::spawn_blocking(move || {
        state.captures.enroll(identity, &bytes, &state.db)
    })
    .await??;

    Ok(Json(json!({
        "message": "Image captured and saved successfully",
        "identity": stored.identity,
        "index": stored.index,
        "path": stored.path,
    })))
}

/// Accept a `data:<mime>;base64,<payload>` URL or bare base64.
fn decode_image_payload(image: &str) -> Result<Vec<u8>, ApiError> {
    let encoded = match image.split_once(',') {
        Some((header, data)) if header.starts_with("data:") => data,
        _ => image,
    };
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| ApiError::InvalidInput(format!("image is not valid base64: {e}")))
}

#[derive(Debug, Default, Deserialize)]
struct TrainQuery {
    #[serde(default)]
    wait: bool,
}

async fn start_training(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TrainQuery>,
) -> Result<Response, ApiError> {
    match state.engine.start(query.wait).await? {
        TrainStart::Started(job_id) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": job_id, "state": "running" })),
        )
            .into_response()),
        TrainStart::Completed(job_id, report) => Ok(Json(json!({
            "message": "Training completed successfully",
            "job_id": job_id,
            "total_ids": report.total_ids,
            "images": report.images,
            "skipped_images": report.skipped_images,
            "samples": report.samples,
        }))
        .into_response()),
    }
}

async fn training_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.engine.status()))
}

/// Fields of a `frame` upload.
#[derive(Default)]
struct FrameForm {
    frame: Option<Vec<u8>>,
    user_id: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> Result<FrameForm, ApiError> {
    let bad = |e: axum::extract::multipart::MultipartError| ApiError::InvalidInput(e.to_string());
    let mut form = FrameForm::default();
    while let Some(field) = multipart.next_field().await.map_err(bad)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("frame") => form.frame = Some(field.bytes().await.map_err(bad)?.to_vec()),
            Some("userId") => form.user_id = Some(field.text().await.map_err(bad)?),
            _ => {}
        }
    }
    Ok(form)
}

fn require_frame(form: &mut FrameForm) -> Result<Vec<u8>, ApiError> {
    form.frame
        .take()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| ApiError::InvalidInput("No image part in the request".into()))
}

async fn identify_user(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let frame = require_frame(&mut read_form(multipart).await?)?;
    let result = tokio::task::spawn_blocking(move || state.identifier.identify(&frame)).await??;

    let user_id = match result.identity {
        Some(identity) => json!(identity),
        None => json!("unknown"),
    };
    Ok(Json(json!({
        "user_id": user_id,
        "confidence": result.confidence,
        "region": result.region,
    })))
}

async fn predict(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut form = read_form(multipart).await?;
    let frame = require_frame(&mut form)?;
    let label = match form.user_id.as_deref().map(str::trim) {
        None | Some("") => "unknown".to_string(),
        Some(raw) => raw
            .parse::<Identity>()
            .map_err(|e| ApiError::InvalidInput(e.to_string()))?
            .to_string(),
    };
    if state.classifier.is_none() {
        return Err(ApiError::ClassifierUnavailable);
    }

    let classification = tokio::task::spawn_blocking(move || {
        let classifier = state
            .classifier
            .as_ref()
            .ok_or(ApiError::ClassifierUnavailable)?;
        let result = classifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .classify_bytes(&frame)?;
        state
            .db
            .record_detection(&label, &result.label, &result.category)?;
        tracing::info!(%label, expression = %result.label, category = %result.category, "expression recorded");
        Ok::<_, ApiError>(result)
    })
    .await??;

    Ok(Json(json!({
        "expression_predicted_class": classification.label,
        "category": classification.category,
    })))
}

async fn list_captures(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let identity: Identity = raw
        .parse()
        .map_err(|e: facelog_core::types::InvalidIdentity| ApiError::InvalidInput(e.to_string()))?;
    let captures = tokio::task::spawn_blocking(move || state.captures.captures(identity)).await??;

    Ok(Json(json!({
        "identity": identity,
        "count": captures.len(),
        "captures": captures,
    })))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let artifact = state.artifacts.snapshot();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "model_trained": artifact.is_some(),
        "trained_at": artifact.as_ref().map(|a| a.trained_at),
        "identity_count": artifact.as_ref().map_or(0, |a| a.model.identity_count()),
        "classifier_loaded": state.classifier.is_some(),
        "training": state.engine.status(),
    }))
}
