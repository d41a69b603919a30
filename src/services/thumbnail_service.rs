use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};

use crate::services::mimetype::{self, MimeDetector};

/// A generated (or probed) thumbnail on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub filepath: PathBuf,
    pub mime: String,
    /// Coarse category of `mime`, normally "image".
    pub image_type: String,
    pub width: u32,
    pub height: u32,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifiedImage {
    pub width: u32,
    pub height: u32,
    pub size: u64,
}

#[async_trait]
pub trait Thumbnailer: Send + Sync {
    /// Resizes `src` to fit `width` x `height` and writes it to `dst`.
    async fn create(&self, src: &Path, dst: &Path, width: u32, height: u32) -> Result<Thumbnail>;

    /// Probes an existing image without resizing it.
    async fn identify(&self, path: &Path) -> Result<IdentifiedImage>;
}

/// A destination without a directory component lands next to the source.
pub fn resolve_destination(src: &Path, dst: &Path) -> PathBuf {
    let has_dir = dst
        .parent()
        .map(|p| !p.as_os_str().is_empty())
        .unwrap_or(false);
    if has_dir {
        return dst.to_path_buf();
    }
    match src.parent() {
        Some(dir) => dir.join(dst),
        None => dst.to_path_buf(),
    }
}

/// Parses the output of `identify -format "%w:%h:%B\n"`.
///
/// Multi-frame images print one line per frame; the first frame describes the image.
pub fn parse_identify_output(output: &str) -> Result<IdentifiedImage> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| anyhow!("identify produced no output"))?;

    let fields: Vec<&str> = line.split(':').collect();
    let [w, h, size] = fields.as_slice() else {
        return Err(anyhow!("unexpected identify output '{}'", line));
    };

    let number = |v: &str| {
        v.trim()
            .parse::<u64>()
            .map_err(|_| anyhow!("unexpected identify output '{}'", line))
    };
    Ok(IdentifiedImage {
        width: u32::try_from(number(*w)?)?,
        height: u32::try_from(number(*h)?)?,
        size: number(*size)?,
    })
}

async fn run_tool(mut cmd: Command, program: &str, timeout: Duration) -> Result<Output> {
    cmd.kill_on_drop(true);
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| anyhow!("{} timed out after {:?}", program, timeout))?
        .with_context(|| format!("failed to run {}", program))?;

    if !output.status.success() {
        let err_msg = String::from_utf8_lossy(&output.stderr);
        error!("{} failed: {}", program, err_msg.trim());
        return Err(anyhow!("{} failed: {}", program, err_msg.trim()));
    }
    Ok(output)
}

/// `vipsthumbnail` for resizing and ImageMagick `identify` for probing.
pub struct VipsThumbnailer {
    mime: Arc<dyn MimeDetector>,
    timeout: Duration,
}

impl VipsThumbnailer {
    pub fn new(mime: Arc<dyn MimeDetector>, timeout: Duration) -> Self {
        Self { mime, timeout }
    }

    async fn describe(&self, path: &Path) -> Result<Thumbnail> {
        let mime = self.mime.detect(path).await?;
        let id = self.identify(path).await?;
        Ok(Thumbnail {
            filepath: path.to_path_buf(),
            image_type: mimetype::base(&mime).to_string(),
            mime,
            width: id.width,
            height: id.height,
            size: id.size,
        })
    }
}

#[async_trait]
impl Thumbnailer for VipsThumbnailer {
    async fn create(&self, src: &Path, dst: &Path, width: u32, height: u32) -> Result<Thumbnail> {
        if src == dst {
            return self.describe(src).await;
        }

        let dst = resolve_destination(src, dst);
        debug!("vipsthumbnail {} -> {} ({}x{})", src.display(), dst.display(), width, height);

        let mut cmd = Command::new("vipsthumbnail");
        cmd.arg("-s")
            .arg(format!("{}x{}", width, height))
            .arg("-o")
            .arg(&dst)
            .arg(src);
        run_tool(cmd, "vipsthumbnail", self.timeout).await?;

        self.describe(&dst).await
    }

    async fn identify(&self, path: &Path) -> Result<IdentifiedImage> {
        let mut cmd = Command::new("identify");
        cmd.arg("-format").arg("%w:%h:%B\n").arg(path);
        let output = run_tool(cmd, "identify", self.timeout).await?;
        parse_identify_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// In-process resizing with the `image` crate.
pub struct ImageThumbnailer;

fn format_mime(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Png => "image/png",
        ImageFormat::Gif => "image/gif",
        ImageFormat::WebP => "image/webp",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl Thumbnailer for ImageThumbnailer {
    async fn create(&self, src: &Path, dst: &Path, width: u32, height: u32) -> Result<Thumbnail> {
        let src = src.to_path_buf();
        let dst = if src == dst {
            dst.to_path_buf()
        } else {
            resolve_destination(&src, dst)
        };

        tokio::task::spawn_blocking(move || -> Result<Thumbnail> {
            let img = image::io::Reader::open(&src)?
                .with_guessed_format()?
                .decode()
                .map_err(|e| anyhow!("Failed to load image {}: {}", src.display(), e))?;
            let format = ImageFormat::from_path(&dst).unwrap_or(ImageFormat::Jpeg);

            let thumb = if src == dst {
                img
            } else {
                let thumb = img.thumbnail(width, height);
                // JPEG has no alpha channel.
                let thumb = if format == ImageFormat::Jpeg {
                    image::DynamicImage::ImageRgb8(thumb.to_rgb8())
                } else {
                    thumb
                };
                thumb
                    .save_with_format(&dst, format)
                    .map_err(|e| anyhow!("Failed to write thumbnail {}: {}", dst.display(), e))?;
                thumb
            };

            let size = std::fs::metadata(&dst)?.len();
            let mime = format_mime(format);
            Ok(Thumbnail {
                filepath: dst,
                mime: mime.to_string(),
                image_type: mimetype::base(mime).to_string(),
                width: thumb.width(),
                height: thumb.height(),
                size,
            })
        })
        .await?
    }

    async fn identify(&self, path: &Path) -> Result<IdentifiedImage> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<IdentifiedImage> {
            let (width, height) = image::io::Reader::open(&path)?
                .with_guessed_format()?
                .into_dimensions()
                .map_err(|e| anyhow!("Failed to read image {}: {}", path.display(), e))?;
            let size = std::fs::metadata(&path)?.len();
            Ok(IdentifiedImage { width, height, size })
        })
        .await?
    }
}

/// Create a thumbnailer based on configuration
pub fn create_thumbnailer(
    kind: &str,
    mime: Arc<dyn MimeDetector>,
    timeout: Duration,
) -> Arc<dyn Thumbnailer> {
    match kind {
        "vips" => Arc::new(VipsThumbnailer::new(mime, timeout)),
        "image" => Arc::new(ImageThumbnailer),
        other => {
            tracing::warn!("Unknown thumbnailer '{}', using image", other);
            Arc::new(ImageThumbnailer)
        }
    }
}
