use super::{ContentRange, UploadError};
use crate::utils::hash::md5_hex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Identifies the accumulation file of one resumable upload: `hex(md5(sid + filename))`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey(String);

impl ChunkKey {
    pub fn new(sid: &str, filename: &str) -> Self {
        let mut input = String::with_capacity(sid.len() + filename.len());
        input.push_str(sid);
        input.push_str(filename);
        Self(md5_hex(input.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Byte ranges received so far for one chunk file, kept as sorted, merged inclusive intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeLedger {
    pub total: u64,
    pub ranges: Vec<(u64, u64)>,
}

impl RangeLedger {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ranges: Vec::new(),
        }
    }

    pub fn insert(&mut self, start: u64, end: u64) {
        self.ranges.push((start, end));
        self.ranges.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            match merged.last_mut() {
                Some(last) if s <= last.1.saturating_add(1) => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;
    }

    /// Distinct bytes received.
    pub fn received(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s + 1).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.ranges.as_slice() == [(0, self.total - 1)]
    }
}

/// State of a chunk file after one range write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub received: u64,
    pub total: u64,
    pub complete: bool,
}

/// On-disk location of a chunk file and its range ledger sidecar.
#[derive(Debug, Clone)]
pub struct ChunkFile {
    path: PathBuf,
    ledger_path: PathBuf,
}

impl ChunkFile {
    pub fn locate(chunks_dir: &Path, key: &ChunkKey) -> Self {
        Self {
            path: chunks_dir.join(key.as_str()),
            ledger_path: chunks_dir.join(format!("{}.ranges", key)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    /// Loads the ledger for `total`. Returns `(ledger, fresh)`; a fresh ledger means any
    /// existing chunk bytes are stale and must be discarded.
    async fn load_ledger(&self, total: u64) -> std::io::Result<(RangeLedger, bool)> {
        let raw = match fs::read(&self.ledger_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((RangeLedger::new(total), true));
            }
            Err(e) => return Err(e),
        };

        match serde_json::from_slice::<RangeLedger>(&raw) {
            Ok(ledger) if ledger.total == total => Ok((ledger, false)),
            Ok(ledger) => {
                tracing::warn!(
                    "Chunk {} declared total changed from {} to {}, restarting",
                    self.path.display(),
                    ledger.total,
                    total
                );
                Ok((RangeLedger::new(total), true))
            }
            Err(e) => {
                tracing::warn!("Corrupt range ledger {}: {}", self.ledger_path.display(), e);
                Ok((RangeLedger::new(total), true))
            }
        }
    }

    async fn save_ledger(&self, ledger: &RangeLedger) -> std::io::Result<()> {
        let json = serde_json::to_vec(ledger).map_err(std::io::Error::other)?;
        fs::write(&self.ledger_path, json).await
    }

    /// Writes exactly `range.len()` bytes from `reader` at `range.start`.
    ///
    /// The ledger is only updated once the whole range is on disk, so a short body
    /// never counts towards completion.
    pub async fn write_range<R>(
        &self,
        range: &ContentRange,
        reader: R,
    ) -> Result<ChunkProgress, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let (mut ledger, fresh) = self.load_ledger(range.total).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(fresh)
            .open(&self.path)
            .await?;
        file.seek(SeekFrom::Start(range.start)).await?;

        let expected = range.len();
        let mut limited = reader.take(expected);
        let written = tokio::io::copy(&mut limited, &mut file).await?;
        file.flush().await?;

        if written < expected {
            if fresh {
                // Keep the ledger absent-or-valid pair consistent for the next attempt.
                self.save_ledger(&ledger).await?;
            }
            return Err(UploadError::ShortRange {
                expected,
                received: written,
            });
        }

        ledger.insert(range.start, range.end);
        let complete = ledger.is_complete();
        if complete {
            file.set_len(range.total).await?;
            file.sync_all().await?;
            match fs::remove_file(&self.ledger_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            self.save_ledger(&ledger).await?;
        }

        tracing::debug!(
            "Chunk {}: {} of {} bytes received",
            self.path.display(),
            ledger.received(),
            range.total
        );

        Ok(ChunkProgress {
            received: ledger.received(),
            total: range.total,
            complete,
        })
    }
}
