use crate::{
    detection::DetectionResponse,
    inference_service::DetectError,
    model_service::{ModelError, ModelService},
    server::SharedState,
    state::State,
};
use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::instrument;

const FILE_FIELD: &str = "file";

#[derive(Error, Debug)]
pub enum DetectImageError {
    #[error("Malformed upload: {0}")]
    Upload(#[from] MultipartError),
    #[error("Upload has no `file` field")]
    MissingFile,
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error("Detection task failed: {0}")]
    Join(#[from] JoinError),
}

impl DetectImageError {
    fn kind(&self) -> &'static str {
        match self {
            DetectImageError::Upload(_) => "invalid_upload",
            DetectImageError::MissingFile => "missing_file",
            DetectImageError::Detect(DetectError::InvalidImage(_)) => "invalid_image",
            DetectImageError::Detect(DetectError::Inference(_)) => "inference_failed",
            DetectImageError::Join(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            DetectImageError::Upload(err) => err.status(),
            DetectImageError::MissingFile => StatusCode::BAD_REQUEST,
            DetectImageError::Detect(DetectError::InvalidImage(_)) => StatusCode::BAD_REQUEST,
            DetectImageError::Detect(DetectError::Inference(ModelError::Input(_))) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            DetectImageError::Detect(DetectError::Inference(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            DetectImageError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for DetectImageError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Detection failed: {}", self);
        } else {
            tracing::warn!("Rejected detection request: {}", self);
        }

        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Returns the `file` field, or the first field carrying a file name when no
/// field is called `file`.
async fn read_upload(mut multipart: Multipart) -> Result<Bytes, DetectImageError> {
    let mut fallback = None;

    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(FILE_FIELD) {
            return Ok(field.bytes().await?);
        }
        if fallback.is_none() && field.file_name().is_some() {
            fallback = Some(field.bytes().await?);
        }
    }

    fallback.ok_or(DetectImageError::MissingFile)
}

#[instrument(skip(state, multipart))]
pub async fn detect<M: ModelService, S: State>(
    AxumState(state): AxumState<SharedState<M, S>>,
    multipart: Multipart,
) -> Result<Json<DetectionResponse>, DetectImageError> {
    let started = Instant::now();

    let result = run_detection(&state, multipart, started).await;
    let model = state.inference_service.model_name();
    match &result {
        Ok(response) => {
            state.metrics.record_request("ok");
            state
                .metrics
                .record_detections(response.detections.len(), model);
            state
                .metrics
                .record_detection_duration(started.elapsed().as_millis() as u64, model);
            tracing::info!(
                detections = response.detections.len(),
                fps = response.throughput_estimate,
                "Detection completed"
            );
        }
        Err(err) => state.metrics.record_request(err.kind()),
    }

    result.map(Json)
}

async fn run_detection<M: ModelService, S: State>(
    state: &SharedState<M, S>,
    multipart: Multipart,
    started: Instant,
) -> Result<DetectionResponse, DetectImageError> {
    let image_data = read_upload(multipart).await?;
    tracing::debug!("Received upload of {} bytes", image_data.len());

    let inference_service = state.inference_service.clone();
    let response =
        tokio::task::spawn_blocking(move || inference_service.detect(&image_data, started))
            .await??;

    Ok(response)
}
