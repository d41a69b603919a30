use crate::utils::hash::{md5_hex, to_base36};
use chrono::{Datelike, Local, NaiveDate, NaiveTime, Timelike};
use std::io;
use std::path::{Path, PathBuf};

/// A storage area `<root>/<category>/<year>/<month>/<day>` that exists on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDir {
    root: PathBuf,
    relative: PathBuf,
}

impl UploadDir {
    /// Allocates today's directory for `category`, creating it if needed.
    pub async fn create(root: &Path, category: &str) -> io::Result<Self> {
        Self::create_for(root, category, Local::now().date_naive()).await
    }

    pub async fn create_for(root: &Path, category: &str, date: NaiveDate) -> io::Result<Self> {
        validate_category(category)?;

        let relative = PathBuf::from(category)
            .join(date.year().to_string())
            .join(date.month().to_string())
            .join(date.day().to_string());

        let dir = Self {
            root: root.to_path_buf(),
            relative,
        };
        tokio::fs::create_dir_all(dir.abs()).await?;
        Ok(dir)
    }

    pub fn abs(&self) -> PathBuf {
        self.root.join(&self.relative)
    }

    pub fn relative(&self) -> &Path {
        &self.relative
    }

    pub fn join(&self, filename: &str) -> PathBuf {
        self.abs().join(filename)
    }
}

fn validate_category(category: &str) -> io::Result<()> {
    if category.is_empty()
        || category.contains(['/', '\\'])
        || category == "."
        || category.contains("..")
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid storage category '{}'", category),
        ));
    }
    Ok(())
}

/// Stems tried by [`UploadDir::reserve`] before giving up.
const MAX_STEM_ATTEMPTS: u32 = 1000;

/// `<hex(md5(sid))>_<base36(seconds since midnight)>`, shared by every version of one original.
pub fn file_stem(sid: &str, time: NaiveTime) -> String {
    let seconds = u64::from(time.hour()) * 3600 + u64::from(time.minute()) * 60 + u64::from(time.second());
    format!("{}_{}", md5_hex(sid.as_bytes()), to_base36(seconds))
}

/// `<stem>[-<suffix>]<ext>`, keeping the extension of `original_name`.
pub fn generate_filename(stem: &str, original_name: &str, suffix: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();

    let mut name = stem.to_string();
    if !suffix.is_empty() {
        name.push('-');
        name.push_str(suffix);
    }
    name.push_str(&ext);
    name
}

impl UploadDir {
    /// Claims a stem no other original in this directory uses.
    ///
    /// `<stem>-<suffix><ext>` is created empty with `create_new`, so concurrent claims of the
    /// same stem cannot both succeed. Taken stems get a `_<n>` counter appended.
    pub async fn reserve(&self, stem: &str, original_name: &str, suffix: &str) -> io::Result<String> {
        for attempt in 0..MAX_STEM_ATTEMPTS {
            let candidate = if attempt == 0 {
                stem.to_string()
            } else {
                format!("{}_{}", stem, attempt)
            };
            let path = self.join(&generate_filename(&candidate, original_name, suffix));

            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(candidate),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free file name for stem {} in {}", stem, self.abs().display()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_is_partitioned_by_date() {
        let tmp = TempDir::new().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();

        let dir = UploadDir::create_for(tmp.path(), "image", date).await.unwrap();
        assert_eq!(dir.relative(), Path::new("image/2024/3/7"));
        assert!(dir.abs().is_dir());
        assert_eq!(dir.join("a.jpg"), tmp.path().join("image/2024/3/7/a.jpg"));
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();

        let first = UploadDir::create_for(tmp.path(), "text", date).await.unwrap();
        let second = UploadDir::create_for(tmp.path(), "text", date).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_create_rejects_path_like_categories() {
        let tmp = TempDir::new().unwrap();
        for category in ["", "..", "a/b", "a\\b", "."] {
            let err = UploadDir::create(tmp.path(), category).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{}", category);
        }
    }

    #[test]
    fn test_generate_filename() {
        let stem = file_stem("abc123", NaiveTime::from_hms_opt(13, 5, 9).unwrap());
        assert_eq!(stem, "e99a18c428cb38d5f260853678922e03_10cl");
        assert_eq!(
            generate_filename(&stem, "holiday.JPG", ""),
            "e99a18c428cb38d5f260853678922e03_10cl.JPG"
        );
        assert_eq!(
            generate_filename(&stem, "holiday.jpg", "thumbnail-120x90"),
            "e99a18c428cb38d5f260853678922e03_10cl-thumbnail-120x90.jpg"
        );
    }

    #[test]
    fn test_generate_filename_without_extension() {
        let stem = file_stem("abc123", NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        assert_eq!(
            generate_filename(&stem, "README", "default"),
            "e99a18c428cb38d5f260853678922e03_0-default"
        );
    }

    #[tokio::test]
    async fn test_reserve_never_hands_out_a_stem_twice() {
        let tmp = TempDir::new().unwrap();
        let dir = UploadDir::create(tmp.path(), "text").await.unwrap();

        let first = dir.reserve("abc_10cl", "a.txt", "default").await.unwrap();
        let second = dir.reserve("abc_10cl", "b.txt", "default").await.unwrap();
        let third = dir.reserve("abc_10cl", "c.txt", "default").await.unwrap();

        assert_eq!(first, "abc_10cl");
        assert_eq!(second, "abc_10cl_1");
        assert_eq!(third, "abc_10cl_2");
        assert!(dir.join("abc_10cl-default.txt").exists());
        assert!(dir.join("abc_10cl_1-default.txt").exists());
    }

    #[tokio::test]
    async fn test_reserve_is_per_extension() {
        let tmp = TempDir::new().unwrap();
        let dir = UploadDir::create(tmp.path(), "image").await.unwrap();

        assert_eq!(dir.reserve("s_1", "a.jpg", "default").await.unwrap(), "s_1");
        assert_eq!(dir.reserve("s_1", "a.png", "default").await.unwrap(), "s_1");
    }
}
