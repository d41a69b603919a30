use super::Processor;
use crate::services::thumbnail_service::Thumbnailer;
use crate::services::upload::Artifact;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Produces a thumbnail of an image source.
pub struct Resizer {
    name: String,
    source: String,
    destination: PathBuf,
    width: u32,
    height: u32,
    thumbnailer: Arc<dyn Thumbnailer>,
}

impl Resizer {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<PathBuf>,
        width: u32,
        height: u32,
        thumbnailer: Arc<dyn Thumbnailer>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            destination: destination.into(),
            width,
            height,
            thumbnailer,
        }
    }
}

#[async_trait]
impl Processor for Resizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn can_process(&self, category: &str) -> bool {
        category == "image"
    }

    async fn process(&self, source: &Artifact) -> Result<Artifact> {
        let thumb = self
            .thumbnailer
            .create(&source.filepath, &self.destination, self.width, self.height)
            .await
            .with_context(|| format!("thumbnail {}x{}", self.width, self.height))?;

        Ok(Artifact {
            filepath: thumb.filepath,
            size: thumb.size,
            mime: Some(thumb.mime),
            kind: Some(thumb.image_type),
            url: None,
            ..source.clone()
        })
    }
}
