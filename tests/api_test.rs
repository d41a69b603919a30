use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use rust_upload_pipeline::config::PipelineConfig;
use rust_upload_pipeline::infrastructure::database::run_migrations;
use rust_upload_pipeline::services::document_store::SeaOrmDocumentStore;
use rust_upload_pipeline::services::mimetype::InferDetector;
use rust_upload_pipeline::services::pipeline::UploadPipeline;
use rust_upload_pipeline::services::thumbnail_service::ImageThumbnailer;
use rust_upload_pipeline::{AppState, create_app};
use sea_orm::Database;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "XyZBoundary42";

async fn setup(tmp: &TempDir) -> Router {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    run_migrations(&db).await.unwrap();

    let config = PipelineConfig::for_root(tmp.path());
    let pipeline = UploadPipeline::new(
        config.clone(),
        Arc::new(InferDetector),
        Arc::new(ImageThumbnailer),
    );

    let state = AppState {
        db: db.clone(),
        pipeline: Arc::new(pipeline),
        store: Arc::new(SeaOrmDocumentStore::new(db)),
        config,
    };
    create_app(state)
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn multipart(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, content) in files {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"files[]\"; filename=\"{}\"\r\nContent-Type: text/plain\r\n\r\n",
                BOUNDARY, name
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

#[tokio::test]
async fn test_sid_endpoint_returns_uuid() {
    let tmp = TempDir::new().unwrap();
    let app = setup(&tmp).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/documents/7/files/sid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let sid = body["sid"].as_str().unwrap();
    assert!(uuid::Uuid::parse_str(sid).is_ok());
}

#[tokio::test]
async fn test_multipart_upload_is_processed_and_listed() {
    let tmp = TempDir::new().unwrap();
    let app = setup(&tmp).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/documents/7/files?sid=abc")
                .header(
                    "Content-Type",
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(Body::from(multipart(&[("report.txt", b"quarterly numbers")])))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    let files = body["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["name"], "report.txt");
    assert_eq!(files[0]["type"], "text");
    assert!(files[0].get("filepath").is_none());
    let default = &files[0]["versions"]["default"];
    assert_eq!(default["source"], ":original:");
    assert_eq!(default["meta"]["size"], 17);
    let url = default["url"].as_str().unwrap().to_string();
    assert!(url.starts_with("/files/text/"));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/documents/7/files")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed = json_body(response).await;
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["name"], "report.txt");
    assert_eq!(listed[0]["url"], url.as_str());
    assert!(listed[0].get("filepath").is_none());

    // Other documents stay empty.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/documents/8/files")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(json_body(response).await.as_array().unwrap().len(), 0);

    // The default version is served under the public prefix.
    let response = app
        .oneshot(Request::builder().uri(&url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"quarterly numbers");
}

#[tokio::test]
async fn test_upload_without_sid_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let app = setup(&tmp).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/documents/7/files")
                .header("Content-Disposition", "attachment; filename=\"a.txt\"")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .contains("missing sid in query param")
    );
}

#[tokio::test]
async fn test_malformed_range_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let app = setup(&tmp).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/documents/7/files?sid=s1")
                .header("Content-Disposition", "attachment; filename=\"a.txt\"")
                .header("Content-Range", "bytes 9-3/10")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_chunked_upload_reports_progress_then_completes() {
    let tmp = TempDir::new().unwrap();
    let app = setup(&tmp).await;

    let chunk = |range: &'static str, data: &'static str| {
        Request::builder()
            .method("POST")
            .uri("/documents/3/files?sid=chunky")
            .header("Content-Disposition", "attachment; filename=\"big.txt\"")
            .header("Content-Range", range)
            .body(Body::from(data))
            .unwrap()
    };

    let response = app.clone().oneshot(chunk("bytes 0-4/10", "hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["file"]["size"], 5);
    assert_eq!(body["file"]["sid"], "chunky");

    let response = app.clone().oneshot(chunk("bytes 5-9/10", "world")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    let file = &body["files"][0];
    assert_eq!(file["name"], "big.txt");
    assert_eq!(file["size"], 10);
    assert_eq!(file["versions"]["default"]["meta"]["size"], 10);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/documents/3/files")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_health() {
    let tmp = TempDir::new().unwrap();
    let app = setup(&tmp).await;

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "connected");
    assert_eq!(body["storage"], "writable");
}

#[tokio::test]
async fn test_two_files_in_one_request_are_stored_apart() {
    let tmp = TempDir::new().unwrap();
    let app = setup(&tmp).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/documents/9/files?sid=s1")
                .header(
                    "Content-Type",
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(Body::from(multipart(&[
                    ("a.txt", b"first file"),
                    ("b.txt", b"second file"),
                ])))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/documents/9/files")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed = json_body(response).await;
    let urls: Vec<String> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["url"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(urls.len(), 2);
    assert_ne!(urls[0], urls[1]);

    let mut contents = Vec::new();
    for url in &urls {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(url).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        contents.push(String::from_utf8(bytes.to_vec()).unwrap());
    }
    contents.sort();
    assert_eq!(contents, vec!["first file", "second file"]);
}
