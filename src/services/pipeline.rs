use crate::config::PipelineConfig;
use crate::services::mimetype::{self, MimeDetector};
use crate::services::processor::{
    self, FileResult, GraphError, Mover, Processor, Resizer, SOURCE_ORIGINAL,
};
use crate::services::thumbnail_service::{self, Thumbnailer};
use crate::services::upload::{
    Artifact, BodyReader, Reassembler, Received, TransferHeaders, UploadDir, UploadError,
    file_stem, generate_filename,
};
use chrono::Local;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Name of the relocation step every original goes through first.
pub const DEFAULT_VERSION: &str = "default";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("invalid processing graph: {0}")]
    Graph(#[from] GraphError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// A ranged part is still missing bytes. Parts completed earlier in the same
    /// request were processed regardless.
    Incomplete {
        file: Artifact,
        processed: Vec<FileResult>,
    },
    Processed(Vec<FileResult>),
}

/// Reassembly, storage allocation and the derivative graph for one request.
pub struct UploadPipeline {
    config: PipelineConfig,
    reassembler: Reassembler,
    thumbnailer: Arc<dyn Thumbnailer>,
}

impl UploadPipeline {
    pub fn new(
        config: PipelineConfig,
        mime: Arc<dyn MimeDetector>,
        thumbnailer: Arc<dyn Thumbnailer>,
    ) -> Self {
        Self {
            reassembler: Reassembler::new(&config, mime),
            config,
            thumbnailer,
        }
    }

    /// Builds the configured MIME detector and thumbnailer.
    pub fn from_config(config: PipelineConfig) -> Self {
        let mime = mimetype::create_detector(&config.mime_detector_type, config.tool_timeout());
        let thumbnailer = thumbnail_service::create_thumbnailer(
            &config.thumbnailer_type,
            mime.clone(),
            config.tool_timeout(),
        );
        Self::new(config, mime, thumbnailer)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn handle(
        &self,
        headers: &TransferHeaders,
        body: BodyReader,
    ) -> Result<PipelineOutcome, PipelineError> {
        let received = self.reassembler.receive(headers, body).await?;

        let mut processed = Vec::with_capacity(received.len());
        let mut incomplete = None;
        for part in received {
            match part {
                Received::Complete(original) => processed.push(self.process(original).await?),
                Received::Failed(original) => processed.push(FileResult::failed(original)),
                Received::Incomplete(file) => incomplete = Some(file),
            }
        }

        Ok(match incomplete {
            Some(file) => PipelineOutcome::Incomplete { file, processed },
            None => PipelineOutcome::Processed(processed),
        })
    }

    /// Allocates the storage area for `original` and runs the default steps on it.
    pub async fn process(&self, original: Artifact) -> Result<FileResult, GraphError> {
        let dir = match UploadDir::create(&self.config.fs_root, original.category()).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Cannot allocate storage for {}: {}", original.name, e);
                return Ok(FileResult::failed(original.with_error(e)));
            }
        };

        let stem = file_stem(&original.sid, Local::now().time());
        let stem = match dir.reserve(&stem, &original.name, DEFAULT_VERSION).await {
            Ok(stem) => stem,
            Err(e) => {
                warn!("Cannot name {} in {}: {}", original.name, dir.abs().display(), e);
                return Ok(FileResult::failed(original.with_error(e)));
            }
        };
        let placeholder = dir.join(&generate_filename(&stem, &original.name, DEFAULT_VERSION));

        let steps = self.steps_for(&original, &dir, &stem);
        let hook = public_url_hook(self.config.fs_root.clone(), self.config.files_prefix.clone());
        let result = processor::process_file(original, &hook, steps).await?;

        let relocated = result
            .versions
            .get(DEFAULT_VERSION)
            .is_some_and(|v| v.error.is_none());
        if !relocated {
            let _ = tokio::fs::remove_file(&placeholder).await;
        }

        info!(
            "Processed {}: {} version(s), {} failed",
            result.file.name,
            result.versions.len(),
            result.versions.values().filter(|v| v.error.is_some()).count()
        );
        Ok(result)
    }

    /// `default` relocation followed by one resize per configured thumbnail, all named
    /// after `stem` (see [`UploadDir::reserve`]).
    pub fn steps_for(
        &self,
        original: &Artifact,
        dir: &UploadDir,
        stem: &str,
    ) -> Vec<Arc<dyn Processor>> {
        let mut steps: Vec<Arc<dyn Processor>> = Vec::with_capacity(1 + self.config.thumbnails.len());
        steps.push(Arc::new(Mover::new(
            DEFAULT_VERSION,
            SOURCE_ORIGINAL,
            dir.join(&generate_filename(stem, &original.name, DEFAULT_VERSION)),
        )));

        for thumb in &self.config.thumbnails {
            steps.push(Arc::new(Resizer::new(
                thumb.name.as_str(),
                DEFAULT_VERSION,
                dir.join(&generate_filename(stem, &original.name, &thumb.name)),
                thumb.width,
                thumb.height,
                self.thumbnailer.clone(),
            )));
        }
        steps
    }
}

/// After-hook that points `url` at `<prefix>/<path relative to root>`.
///
/// Errors pass through untouched; paths outside `root` keep no URL.
pub fn public_url_hook(
    root: PathBuf,
    prefix: String,
) -> impl Fn(anyhow::Result<Artifact>) -> anyhow::Result<Artifact> + Send + Sync {
    move |result| {
        let mut artifact = result?;
        if let Some(url) = public_url(&root, &prefix, &artifact.filepath) {
            artifact.url = Some(url);
        }
        Ok(artifact)
    }
}

fn public_url(root: &Path, prefix: &str, path: &Path) -> Option<String> {
    if path.as_os_str().is_empty() {
        return None;
    }
    let relative = path.strip_prefix(root).ok()?;

    let mut url = prefix.trim_end_matches('/').to_string();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                url.push('/');
                url.push_str(part.to_str()?);
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(url)
}
