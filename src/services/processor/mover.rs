use super::Processor;
use crate::services::upload::Artifact;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Relocates its source file to a fixed destination. Accepts every category.
pub struct Mover {
    name: String,
    source: String,
    destination: PathBuf,
}

impl Mover {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

async fn relocate(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        // Temp and chunk dirs may live on another filesystem than the store.
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            fs::copy(from, to).await?;
            fs::remove_file(from).await
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Processor for Mover {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn can_process(&self, _category: &str) -> bool {
        true
    }

    async fn process(&self, source: &Artifact) -> Result<Artifact> {
        if let Some(parent) = self.destination.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }

        relocate(&source.filepath, &self.destination)
            .await
            .with_context(|| {
                format!(
                    "move {} to {}",
                    source.filepath.display(),
                    self.destination.display()
                )
            })?;

        let size = fs::metadata(&self.destination).await?.len();
        tracing::debug!("Moved {} to {}", source.name, self.destination.display());

        Ok(Artifact {
            filepath: self.destination.clone(),
            size,
            url: None,
            ..source.clone()
        })
    }
}
