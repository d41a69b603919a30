use crate::AppState;
use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;
use std::path::PathBuf;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    /// "ok", or "degraded" when a dependency is unavailable
    pub status: String,
    pub database: String,
    /// Whether new uploads can be written under the file store root
    pub storage: String,
    pub version: String,
}

/// Creates and drops a temp file under both roots an upload writes to.
async fn storage_writable(roots: Vec<PathBuf>) -> bool {
    tokio::task::spawn_blocking(move || {
        roots.iter().all(|root| {
            std::fs::create_dir_all(root).is_ok()
                && tempfile::Builder::new()
                    .prefix(".health")
                    .tempfile_in(root)
                    .is_ok()
        })
    })
    .await
    .unwrap_or(false)
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Database and file store status", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database_ok = state.db.ping().await.is_ok();
    let storage_ok = storage_writable(vec![state.config.fs_root.clone(), state.config.temp_dir()]).await;

    if !storage_ok {
        tracing::warn!("File store {} is not writable", state.config.fs_root.display());
    }

    Json(HealthResponse {
        status: if database_ok && storage_ok { "ok" } else { "degraded" }.to_string(),
        database: if database_ok { "connected" } else { "disconnected" }.to_string(),
        storage: if storage_ok { "writable" } else { "unavailable" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
