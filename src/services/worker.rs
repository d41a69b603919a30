use std::path::PathBuf;
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

use crate::config::PipelineConfig;

/// Removes abandoned chunk accumulation files and temp uploads.
pub struct BackgroundWorker {
    roots: Vec<PathBuf>,
    max_age: Duration,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    pub fn new(config: &PipelineConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            roots: vec![config.chunks_dir(), config.temp_dir()],
            max_age: Duration::from_secs(config.chunk_cleanup_age_hours * 3600),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Background worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Background worker shutting down");
                    break;
                }
                _ = sleep(Duration::from_secs(3600)) => {
                    self.perform_cleanup().await;
                }
            }
        }
    }

    /// Returns the number of files removed.
    pub async fn perform_cleanup(&self) -> usize {
        tracing::info!("🧹 Running background cleanup tasks...");

        let now = SystemTime::now();
        let mut removed = 0;
        for root in &self.roots {
            let mut entries = match tokio::fs::read_dir(root).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::error!("Failed to scan {}: {}", root.display(), e);
                    continue;
                }
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| now.duration_since(m).ok())
                    .unwrap_or_default();
                if age < self.max_age {
                    continue;
                }

                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => {
                        tracing::info!("Removed stale upload file {}", entry.path().display());
                        removed += 1;
                    }
                    Err(e) => {
                        tracing::error!("Failed to remove {}: {}", entry.path().display(), e)
                    }
                }
            }
        }

        tracing::info!("✅ Background cleanup completed ({} removed)", removed);
        removed
    }
}
