pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod services;
pub mod utils;

use crate::config::PipelineConfig;
use crate::services::document_store::DocumentFileStore;
use crate::services::pipeline::UploadPipeline;
use axum::{Router, routing::get};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::health::health_check,
        api::handlers::files::add_document_file,
        api::handlers::files::get_document_files,
        api::handlers::files::get_files_sid,
    ),
    components(
        schemas(
            api::handlers::health::HealthResponse,
            api::handlers::files::ChunkStatus,
            api::handlers::files::IncompleteResponse,
            api::handlers::files::FilesResponse,
            api::handlers::files::SidResponse,
            api::handlers::files::DocumentFileResponse,
            services::processor::FileResult,
            services::processor::FileVersion,
            services::processor::FileMeta,
            services::upload::Artifact,
        )
    ),
    tags(
        (name = "files", description = "Document file uploads"),
        (name = "system", description = "System endpoints")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub pipeline: Arc<UploadPipeline>,
    pub store: Arc<dyn DocumentFileStore>,
    pub config: PipelineConfig,
}

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let files_prefix = state.config.files_prefix.trim_matches('/').to_string();
    let static_files = ServeDir::new(&state.config.fs_root);

    let router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/documents/:doc_id/files",
            get(api::handlers::files::get_document_files)
                .post(api::handlers::files::add_document_file)
                .layer(axum::extract::DefaultBodyLimit::max(
                    state.config.max_file_size + 10 * 1024 * 1024, // multipart overhead
                )),
        )
        .route(
            "/documents/:doc_id/files/sid",
            get(api::handlers::files::get_files_sid),
        );

    // Nesting at the root would shadow the API routes.
    let router = if files_prefix.is_empty() {
        router
    } else {
        router.nest_service(&format!("/{}", files_prefix), static_files)
    };

    router.layer(cors).with_state(state)
}
