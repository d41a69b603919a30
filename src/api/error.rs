use crate::services::pipeline::PipelineError;
use crate::services::processor::GraphError;
use crate::services::upload::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// Only request-level reassembly failures land here; per-file ones are data.
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Processing graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Upload(e) => AppError::Upload(e),
            PipelineError::Graph(e) => AppError::Graph(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Upload(e) if e.is_protocol() => (StatusCode::BAD_REQUEST, e.to_string()),
            AppError::Upload(e) => {
                tracing::error!("Upload error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::Graph(e) => {
                tracing::error!("Processing graph misconfigured: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::Anyhow(e) => {
                tracing::error!("Anyhow error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
