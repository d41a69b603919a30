use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use uuid::Uuid;

use crate::entities::document_files;
use crate::services::pipeline::DEFAULT_VERSION;
use crate::services::processor::{FileMeta, FileResult};

/// Narrow persistence interface for processed uploads.
#[async_trait]
pub trait DocumentFileStore: Send + Sync {
    async fn save(&self, document_id: i64, result: &FileResult) -> Result<document_files::Model>;
    async fn list(&self, document_id: i64) -> Result<Vec<document_files::Model>>;
}

pub struct SeaOrmDocumentStore {
    db: DatabaseConnection,
}

impl SeaOrmDocumentStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DocumentFileStore for SeaOrmDocumentStore {
    /// The `default` version, when it succeeded, supplies the stored location.
    async fn save(&self, document_id: i64, result: &FileResult) -> Result<document_files::Model> {
        let primary = result
            .versions
            .get(DEFAULT_VERSION)
            .filter(|v| v.error.is_none());
        let filepath = primary
            .and_then(|v| v.filepath.clone())
            .unwrap_or_else(|| result.file.filepath.clone());
        let url = primary
            .and_then(|v| v.url.clone())
            .or_else(|| result.file.url.clone());

        let now = Utc::now();
        let record = document_files::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            document_id: Set(document_id),
            name: Set(result.file.name.clone()),
            filepath: Set(filepath.to_string_lossy().to_string()),
            url: Set(url),
            meta: Set(serde_json::to_value(FileMeta::from(&result.file))?),
            versions: Set(serde_json::to_value(&result.versions)?),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        let model = record
            .insert(&self.db)
            .await
            .with_context(|| format!("save file {} of document {}", result.file.name, document_id))?;
        tracing::info!("Stored {} for document {} as {}", model.name, document_id, model.id);
        Ok(model)
    }

    async fn list(&self, document_id: i64) -> Result<Vec<document_files::Model>> {
        let files = document_files::Entity::find()
            .filter(document_files::Column::DocumentId.eq(document_id))
            .order_by_asc(document_files::Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(files)
    }
}
