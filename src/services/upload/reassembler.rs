use super::meta::sanitize_filename;
use super::{
    Artifact, ChunkFile, ChunkKey, ContentRange, MediaType, Received, TransferHeaders,
    TransferMeta, UploadError,
};
use crate::config::PipelineConfig;
use crate::services::mimetype::{self, MimeDetector};
use crate::utils::keyed_mutex::KeyedMutex;
use futures::TryStreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, warn};

/// Request body handed to the reassembler.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

enum Written {
    Complete { path: PathBuf, size: u64 },
    Partial { path: PathBuf, received: u64 },
}

/// Turns one inbound transfer into zero or more received artifacts.
pub struct Reassembler {
    chunks_dir: PathBuf,
    temp_dir: PathBuf,
    files_field: String,
    allow_local_source: bool,
    max_file_size: u64,
    mime: Arc<dyn MimeDetector>,
    locks: KeyedMutex,
}

impl Reassembler {
    pub fn new(config: &PipelineConfig, mime: Arc<dyn MimeDetector>) -> Self {
        Self {
            chunks_dir: config.chunks_dir(),
            temp_dir: config.temp_dir(),
            files_field: config.files_field.clone(),
            allow_local_source: config.allow_local_source,
            max_file_size: config.max_file_size as u64,
            mime,
            locks: KeyedMutex::new(),
        }
    }

    /// Parses the transfer headers and stores every file part of `body`.
    ///
    /// Protocol errors fail the whole request. Per-part failures come back as
    /// `Received::Failed`, and reading stops after the first `Received::Incomplete`.
    pub async fn receive(
        &self,
        headers: &TransferHeaders,
        body: BodyReader,
    ) -> Result<Vec<Received>, UploadError> {
        let meta = TransferMeta::parse(headers)?;
        let body = self.select_body(headers, body).await?;

        match &meta.media_type {
            MediaType::OctetStream => {
                let name = meta.filename.clone().ok_or(UploadError::MissingFilename)?;
                Ok(vec![self.save_part(&meta, name, body).await])
            }
            MediaType::Multipart { boundary } => {
                self.receive_multipart(&meta, boundary, body).await
            }
        }
    }

    async fn select_body(
        &self,
        headers: &TransferHeaders,
        body: BodyReader,
    ) -> Result<BodyReader, UploadError> {
        let Some(path) = headers.local_source.as_deref() else {
            return Ok(body);
        };
        if !self.allow_local_source {
            return Err(UploadError::LocalSourceDisabled);
        }

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| UploadError::LocalSource {
                path: path.to_string(),
                source,
            })?;
        debug!("Reading upload body from local source {}", path);
        Ok(Box::new(file))
    }

    async fn receive_multipart(
        &self,
        meta: &TransferMeta,
        boundary: &str,
        body: BodyReader,
    ) -> Result<Vec<Received>, UploadError> {
        let mut multipart = multer::Multipart::new(ReaderStream::new(body), boundary);
        let mut received = Vec::new();

        loop {
            let field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => break,
                Err(e) if received.is_empty() => return Err(e.into()),
                Err(e) => {
                    // The failing part, if any, already carries its own error.
                    warn!("Multipart body ended early after {} part(s): {}", received.len(), e);
                    break;
                }
            };
            if field.name() != Some(self.files_field.as_str()) {
                continue;
            }

            let Some(name) = field
                .file_name()
                .map(sanitize_filename)
                .filter(|n| !n.is_empty())
                .or_else(|| meta.filename.clone())
            else {
                discard(&received).await;
                return Err(UploadError::MissingFilename);
            };

            let reader = StreamReader::new(field.map_err(std::io::Error::other));
            let part = self.save_part(meta, name, reader).await;
            let incomplete = part.is_incomplete();
            received.push(part);
            if incomplete {
                break;
            }
        }

        Ok(received)
    }

    async fn save_part<R>(&self, meta: &TransferMeta, name: String, reader: R) -> Received
    where
        R: AsyncRead + Unpin + Send,
    {
        let written = match &meta.range {
            None => self.write_whole(reader).await,
            Some(range) => self.write_range(&meta.sid, &name, range, reader).await,
        };

        match written {
            Ok(Written::Complete { path, size }) => match self.mime.detect(&path).await {
                Ok(mime) => {
                    let mut artifact = Artifact::new(name, meta.sid.as_str(), path, size);
                    artifact.kind = Some(mimetype::base(&mime).to_string());
                    artifact.mime = Some(mime);
                    info!(
                        "Received {} ({} bytes, {})",
                        artifact.name,
                        artifact.size,
                        artifact.mime.as_deref().unwrap_or_default()
                    );
                    Received::Complete(artifact)
                }
                Err(e) => {
                    warn!("MIME detection failed for {}: {:#}", name, e);
                    Received::Failed(
                        Artifact::new(name, meta.sid.as_str(), path, size)
                            .with_error(UploadError::Mime(format!("{:#}", e))),
                    )
                }
            },
            Ok(Written::Partial { path, received }) => {
                Received::Incomplete(Artifact::new(name, meta.sid.as_str(), path, received))
            }
            Err(e) => {
                warn!("Failed to receive {}: {}", name, e);
                Received::Failed(Artifact::new(name, meta.sid.as_str(), PathBuf::new(), 0).with_error(e))
            }
        }
    }

    /// Copies the whole part into a fresh temporary file, enforcing the size limit.
    async fn write_whole<R>(&self, mut reader: R) -> Result<Written, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let temp = tempfile::Builder::new()
            .prefix("upload")
            .tempfile_in(&self.temp_dir)?;
        let (std_file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let mut buffer = vec![0u8; 8192];
        let mut size: u64 = 0;
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            size += n as u64;
            if size > self.max_file_size {
                return Err(UploadError::TooLarge {
                    size,
                    limit: self.max_file_size,
                });
            }
            file.write_all(&buffer[..n]).await?;
        }
        file.flush().await?;
        drop(file);

        // Dropping the temp path on any earlier return removes the partial file.
        let path = temp_path.keep().map_err(|e| e.error)?;
        Ok(Written::Complete { path, size })
    }

    async fn write_range<R>(
        &self,
        sid: &str,
        name: &str,
        range: &ContentRange,
        reader: R,
    ) -> Result<Written, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if range.total > self.max_file_size {
            return Err(UploadError::TooLarge {
                size: range.total,
                limit: self.max_file_size,
            });
        }

        let key = ChunkKey::new(sid, name);
        let chunk = ChunkFile::locate(&self.chunks_dir, &key);

        let guard = self.locks.lock(key.as_str()).await;
        let progress = chunk.write_range(range, reader).await;
        drop(guard);
        self.locks.cleanup();

        let progress = progress?;
        let path = chunk.path().to_path_buf();
        if progress.complete {
            Ok(Written::Complete {
                path,
                size: progress.total,
            })
        } else {
            Ok(Written::Partial {
                path,
                received: progress.received,
            })
        }
    }
}

/// Removes the files of parts received before the request was rejected.
///
/// Incomplete parts keep their chunk file so the upload can resume.
async fn discard(received: &[Received]) {
    for part in received.iter().filter(|p| !p.is_incomplete()) {
        let path = &part.artifact().filepath;
        if path.as_os_str().is_empty() {
            continue;
        }
        if let Err(e) = tokio::fs::remove_file(path).await {
            debug!("Could not remove {}: {}", path.display(), e);
        }
    }
}
