use crate::AppState;
use crate::api::error::AppError;
use crate::entities::document_files;
use crate::services::pipeline::PipelineOutcome;
use crate::services::processor::FileResult;
use crate::services::upload::{BodyReader, TransferHeaders};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

#[derive(Debug, Deserialize, IntoParams)]
pub struct SidQuery {
    /// Upload session id, see `GET /documents/{doc_id}/files/sid`
    pub sid: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ChunkStatus {
    pub sid: String,
    /// Bytes received so far
    pub size: u64,
}

/// Returned while a ranged upload still misses bytes.
#[derive(Serialize, ToSchema)]
pub struct IncompleteResponse {
    pub file: ChunkStatus,
    pub status: String,
}

#[derive(Serialize, ToSchema)]
pub struct FilesResponse {
    pub files: Vec<FileResult>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct SidResponse {
    pub sid: String,
}

#[derive(Serialize, ToSchema)]
pub struct DocumentFileResponse {
    pub id: String,
    pub document_id: i64,
    pub name: String,
    pub url: Option<String>,
    #[schema(value_type = Object)]
    pub meta: serde_json::Value,
    #[schema(value_type = Object)]
    pub versions: serde_json::Value,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl From<document_files::Model> for DocumentFileResponse {
    fn from(m: document_files::Model) -> Self {
        Self {
            id: m.id,
            document_id: m.document_id,
            name: m.name,
            url: m.url,
            meta: m.meta,
            versions: m.versions,
            created_at: m.created_at.with_timezone(&Utc),
            updated_at: m.updated_at.with_timezone(&Utc),
        }
    }
}

#[utoipa::path(
    post,
    path = "/documents/{doc_id}/files",
    params(
        ("doc_id" = i64, Path, description = "Document id"),
        SidQuery
    ),
    request_body(content = Vec<u8>, description = "Raw file body (with Content-Disposition) or multipart/form-data with `files[]` parts; optionally a Content-Range chunk", content_type = "application/octet-stream"),
    responses(
        (status = 201, description = "Files received and processed", body = FilesResponse),
        (status = 200, description = "Chunk stored, more ranges expected", body = IncompleteResponse),
        (status = 400, description = "Malformed transfer headers or missing sid"),
        (status = 413, description = "File too large")
    ),
    tag = "files"
)]
pub async fn add_document_file(
    State(state): State<AppState>,
    Path(doc_id): Path<i64>,
    Query(query): Query<SidQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let transfer = TransferHeaders::from_http(&headers, query.sid);

    let body_with_io_error = body.into_data_stream().map_err(std::io::Error::other);
    let reader: BodyReader = Box::new(StreamReader::new(body_with_io_error));

    match state.pipeline.handle(&transfer, reader).await? {
        PipelineOutcome::Incomplete { file, processed } => {
            persist(&state, doc_id, &processed).await?;
            let resp = IncompleteResponse {
                file: ChunkStatus {
                    sid: file.sid,
                    size: file.size,
                },
                status: "ok".to_string(),
            };
            Ok((StatusCode::OK, Json(resp)).into_response())
        }
        PipelineOutcome::Processed(files) => {
            persist(&state, doc_id, &files).await?;
            Ok((StatusCode::CREATED, Json(FilesResponse { files })).into_response())
        }
    }
}

/// Stores every result whose original was received without error.
async fn persist(state: &AppState, doc_id: i64, results: &[FileResult]) -> Result<(), AppError> {
    for result in results.iter().filter(|r| r.file.error.is_none()) {
        state.store.save(doc_id, result).await?;
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/documents/{doc_id}/files",
    params(
        ("doc_id" = i64, Path, description = "Document id")
    ),
    responses(
        (status = 200, description = "Stored files of the document", body = Vec<DocumentFileResponse>)
    ),
    tag = "files"
)]
pub async fn get_document_files(
    State(state): State<AppState>,
    Path(doc_id): Path<i64>,
) -> Result<Json<Vec<DocumentFileResponse>>, AppError> {
    let files = state.store.list(doc_id).await?;
    Ok(Json(files.into_iter().map(Into::into).collect()))
}

#[utoipa::path(
    get,
    path = "/documents/{doc_id}/files/sid",
    params(
        ("doc_id" = i64, Path, description = "Document id")
    ),
    responses(
        (status = 200, description = "A fresh upload session id", body = SidResponse)
    ),
    tag = "files"
)]
pub async fn get_files_sid(Path(_doc_id): Path<i64>) -> impl IntoResponse {
    Json(SidResponse {
        sid: Uuid::new_v4().to_string(),
    })
}
