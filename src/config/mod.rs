use std::env;
use std::path::PathBuf;
use validator::Validate;

/// One thumbnail derivative produced for every image upload.
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct ThumbnailSpec {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(range(min = 1, max = 10000))]
    pub width: u32,
    #[validate(range(min = 1, max = 10000))]
    pub height: u32,
}

impl ThumbnailSpec {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            name: format!("thumbnail-{}x{}", width, height),
            width,
            height,
        }
    }

    /// Parses `"120x90"`.
    pub fn parse(s: &str) -> Option<Self> {
        let (w, h) = s.trim().split_once(['x', 'X'])?;
        let spec = Self::new(w.trim().parse().ok()?, h.trim().parse().ok()?);
        spec.validate().ok()?;
        Some(spec)
    }

    /// Parses a comma separated list, skipping malformed entries.
    pub fn parse_list(s: &str) -> Vec<Self> {
        s.split(',')
            .filter(|item| !item.trim().is_empty())
            .filter_map(|item| {
                let spec = Self::parse(item);
                if spec.is_none() {
                    tracing::warn!("Ignoring malformed thumbnail size '{}'", item.trim());
                }
                spec
            })
            .collect()
    }
}

/// Upload pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the local file store (default: "./data")
    pub fs_root: PathBuf,

    /// URL prefix under which `fs_root` is served (default: "/files")
    pub files_prefix: String,

    /// Directory for single-shot uploads before relocation (default: `<fs_root>/tmp`)
    pub temp_dir: Option<PathBuf>,

    /// Maximum file size in bytes (default: 1 GB)
    pub max_file_size: usize,

    /// Multipart form field carrying files (default: "files[]")
    pub files_field: String,

    /// Honour the `X-File` header naming a local body source (default: false)
    pub allow_local_source: bool,

    /// Thumbnail backend: "vips" or "image" (default: "vips")
    pub thumbnailer_type: String,

    /// MIME detector: "file" or "infer" (default: "file")
    pub mime_detector_type: String,

    /// Timeout for each external tool invocation in seconds (default: 30)
    pub tool_timeout_secs: u64,

    /// Thumbnails generated for image uploads (default: 120x90)
    pub thumbnails: Vec<ThumbnailSpec>,

    /// Age after which abandoned chunk and temp files are removed (default: 24)
    pub chunk_cleanup_age_hours: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fs_root: PathBuf::from("./data"),
            files_prefix: "/files".to_string(),
            temp_dir: None,
            max_file_size: 1024 * 1024 * 1024, // 1 GB
            files_field: "files[]".to_string(),
            allow_local_source: false,
            thumbnailer_type: "vips".to_string(),
            mime_detector_type: "file".to_string(),
            tool_timeout_secs: 30,
            thumbnails: vec![ThumbnailSpec::new(120, 90)],
            chunk_cleanup_age_hours: 24,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_env_with(Self::default())
    }

    fn from_env_with(default: Self) -> Self {
        Self {
            fs_root: env::var("FS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.fs_root),

            files_prefix: env::var("FILES_PREFIX").unwrap_or(default.files_prefix),

            temp_dir: env::var("UPLOAD_TEMP_DIR")
                .ok()
                .map(PathBuf::from)
                .or(default.temp_dir),

            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            files_field: env::var("UPLOAD_FILES_FIELD").unwrap_or(default.files_field),

            allow_local_source: env::var("ALLOW_LOCAL_SOURCE")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.allow_local_source),

            thumbnailer_type: env::var("THUMBNAILER").unwrap_or(default.thumbnailer_type),

            mime_detector_type: env::var("MIME_DETECTOR").unwrap_or(default.mime_detector_type),

            tool_timeout_secs: env::var("TOOL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.tool_timeout_secs),

            thumbnails: env::var("THUMBNAIL_SIZES")
                .map(|v| ThumbnailSpec::parse_list(&v))
                .unwrap_or(default.thumbnails),

            chunk_cleanup_age_hours: env::var("CHUNK_CLEANUP_AGE_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.chunk_cleanup_age_hours),
        }
    }

    /// Create config for development (in-process tools, local body source allowed)
    pub fn development() -> Self {
        Self {
            allow_local_source: true,
            thumbnailer_type: "image".to_string(),
            mime_detector_type: "infer".to_string(),
            ..Self::default()
        }
    }

    /// Create config for production (external tools, no local body source unless asked for)
    pub fn production() -> Self {
        let mut config = Self::from_env();
        config.thumbnailer_type = env::var("THUMBNAILER").unwrap_or_else(|_| "vips".to_string());
        config.mime_detector_type = env::var("MIME_DETECTOR").unwrap_or_else(|_| "file".to_string());
        config
    }

    /// Development defaults rooted at `root`, used by tests and local tooling.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            fs_root: root.into(),
            ..Self::development()
        }
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.fs_root.join("tmp"))
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.fs_root.join("chunks")
    }

    pub fn tool_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tool_timeout_secs)
    }
}
