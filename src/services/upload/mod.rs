//! Upload ingestion: transfer parsing, chunk reassembly and storage area allocation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use utoipa::ToSchema;

pub mod chunk;
pub mod dir;
pub mod meta;
pub mod reassembler;

pub use chunk::{ChunkFile, ChunkKey, RangeLedger};
pub use dir::{UploadDir, file_stem, generate_filename};
pub use meta::{ContentRange, MediaType, TransferHeaders, TransferMeta};
pub use reassembler::{BodyReader, Reassembler};

/// A file tracked by the pipeline, either an uploaded original or a derivative.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub struct Artifact {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    /// Coarse category, e.g. "image" for "image/jpeg".
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip)]
    pub filepath: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Artifact {
    pub fn new(
        name: impl Into<String>,
        sid: impl Into<String>,
        filepath: impl Into<PathBuf>,
        size: u64,
    ) -> Self {
        Self {
            name: name.into(),
            sid: sid.into(),
            filepath: filepath.into(),
            size,
            ..Default::default()
        }
    }

    pub fn category(&self) -> &str {
        self.kind.as_deref().unwrap_or_default()
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Outcome of one part of an inbound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// All bytes are on disk and the MIME type is known.
    Complete(Artifact),
    /// A byte range was stored; `size` is the number of bytes received so far.
    Incomplete(Artifact),
    /// Writing this part failed; the reason is in `error`.
    Failed(Artifact),
}

impl Received {
    pub fn artifact(&self) -> &Artifact {
        match self {
            Received::Complete(a) | Received::Incomplete(a) | Received::Failed(a) => a,
        }
    }

    pub fn into_artifact(self) -> Artifact {
        match self {
            Received::Complete(a) | Received::Incomplete(a) | Received::Failed(a) => a,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Received::Complete(_))
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Received::Incomplete(_))
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("malformed Content-Type: {0}")]
    MalformedContentType(String),

    #[error("multipart boundary not defined")]
    MissingBoundary,

    #[error("malformed Content-Range: {0}")]
    MalformedContentRange(String),

    #[error("malformed Content-Disposition: {0}")]
    MalformedContentDisposition(String),

    #[error("filename in Content-Disposition is not defined")]
    MissingFilename,

    #[error("missing sid in query param")]
    MissingSessionId,

    #[error("local body source is disabled")]
    LocalSourceDisabled,

    #[error("cannot open local body source {path}: {source}")]
    LocalSource {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed multipart body: {0}")]
    Multipart(#[from] multer::Error),

    #[error("file size {size} exceeds the maximum of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("body ended after {received} of {expected} range bytes")]
    ShortRange { expected: u64, received: u64 },

    #[error("MIME detection failed: {0}")]
    Mime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Protocol errors make the whole request unusable; the client must fix and retry it.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            UploadError::MalformedContentType(_)
                | UploadError::MissingBoundary
                | UploadError::MalformedContentRange(_)
                | UploadError::MalformedContentDisposition(_)
                | UploadError::MissingFilename
                | UploadError::MissingSessionId
                | UploadError::LocalSourceDisabled
                | UploadError::LocalSource { .. }
                | UploadError::Multipart(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_json_shape() {
        let mut a = Artifact::new("cat.jpg", "sid-1", "/srv/data/tmp/upload123", 42);
        a.mime = Some("image/jpeg".to_string());
        a.kind = Some("image".to_string());

        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["name"], "cat.jpg");
        assert_eq!(json["sid"], "sid-1");
        assert_eq!(json["type"], "image");
        assert_eq!(json["size"], 42);
        assert!(json.get("filepath").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("url").is_none());
    }

    #[test]
    fn test_category_defaults_to_empty() {
        let a = Artifact::new("x", "s", "/tmp/x", 0);
        assert_eq!(a.category(), "");
    }

    #[test]
    fn test_protocol_classification() {
        assert!(UploadError::MissingSessionId.is_protocol());
        assert!(UploadError::MissingBoundary.is_protocol());
        assert!(!UploadError::TooLarge { size: 2, limit: 1 }.is_protocol());
        assert!(!UploadError::Io(std::io::Error::other("disk full")).is_protocol());
    }
}
