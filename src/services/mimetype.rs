use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Returns a MIME string (e.g. "image/jpeg") for a file on disk.
#[async_trait]
pub trait MimeDetector: Send + Sync {
    async fn detect(&self, path: &Path) -> Result<String>;
}

/// Coarse category of a MIME type: "image" for "image/jpeg".
pub fn base(mime: &str) -> &str {
    mime.split('/').next().unwrap_or(mime).trim()
}

/// Magic-byte sniffing over the first 8 KB using the `infer` crate.
pub struct InferDetector;

#[async_trait]
impl MimeDetector for InferDetector {
    async fn detect(&self, path: &Path) -> Result<String> {
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("open {}", path.display()))?;

        let mut buffer = vec![0u8; 8192];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);

        if let Some(kind) = infer::get(&buffer) {
            return Ok(kind.mime_type().to_string());
        }

        if looks_like_text(&buffer) {
            Ok("text/plain".to_string())
        } else {
            Ok("application/octet-stream".to_string())
        }
    }
}

/// Valid UTF-8, allowing a multi-byte character cut off by the sample boundary.
fn looks_like_text(sample: &[u8]) -> bool {
    if sample.is_empty() {
        return true;
    }
    let text_ok = match std::str::from_utf8(sample) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    };
    text_ok && !sample.contains(&0)
}

/// Shells out to `file --mime-type -b`.
pub struct FileCommandDetector {
    timeout: Duration,
}

impl FileCommandDetector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl MimeDetector for FileCommandDetector {
    async fn detect(&self, path: &Path) -> Result<String> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("file")
                .arg("--mime-type")
                .arg("-b")
                .arg(path)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow!("file timed out after {:?}", self.timeout))?
        .context("failed to run file")?;

        if !output.status.success() {
            return Err(anyhow!(
                "file exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let mime = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !mime.contains('/') {
            return Err(anyhow!("unexpected file output '{}'", mime));
        }
        Ok(mime)
    }
}

/// Create a detector based on configuration
pub fn create_detector(kind: &str, timeout: Duration) -> Arc<dyn MimeDetector> {
    match kind {
        "infer" => Arc::new(InferDetector),
        "file" => Arc::new(FileCommandDetector::new(timeout)),
        other => {
            tracing::warn!("Unknown MIME detector '{}', using infer", other);
            Arc::new(InferDetector)
        }
    }
}
