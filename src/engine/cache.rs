// On-disk artifact cache. Entries mirror the artifact hierarchy; writes go through `.partial/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::path::NormalizedPath;

/// Directory under the cache root holding in-progress writes.
pub const PARTIAL_DIR: &str = ".partial";

#[derive(Debug, Error)]
#[error("cache I/O error on {}: {source}", path.display())]
pub struct CacheError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl CacheError {
    fn new(path: &Path, source: io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A complete, promoted artifact opened for reading.
pub struct CachedArtifact {
    pub file: tokio::fs::File,
    pub length: u64,
}

pub enum Lookup {
    Hit(CachedArtifact),
    Miss,
}

pub struct CacheStore {
    root: PathBuf,
    partial_dir: PathBuf,
    next_write: AtomicU64,
}

impl CacheStore {
    /// Open (creating if needed) a cache rooted at `root`.
    ///
    /// Leftover partial files from an earlier process are removed; no writer
    /// can own them any more.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        let partial_dir = root.join(PARTIAL_DIR);
        if partial_dir.exists() {
            fs::remove_dir_all(&partial_dir).map_err(|e| CacheError::new(&partial_dir, e))?;
        }
        fs::create_dir_all(&partial_dir).map_err(|e| CacheError::new(&partial_dir, e))?;
        Ok(Self {
            root,
            partial_dir,
            next_write: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of the entry for `path`.
    pub fn entry_path(&self, path: &NormalizedPath) -> PathBuf {
        self.root.join(path.to_relative_path())
    }

    /// Open the promoted entry for `path`, if there is one.
    pub async fn lookup(&self, path: &NormalizedPath) -> Result<Lookup, CacheError> {
        let entry = self.entry_path(path);
        let file = match tokio::fs::File::open(&entry).await {
            Ok(file) => file,
            Err(e) if is_absent(&e) => return Ok(Lookup::Miss),
            Err(e) => return Err(CacheError::new(&entry, e)),
        };
        let meta = file.metadata().await.map_err(|e| CacheError::new(&entry, e))?;
        if !meta.is_file() {
            return Ok(Lookup::Miss);
        }
        Ok(Lookup::Hit(CachedArtifact {
            file,
            length: meta.len(),
        }))
    }

    /// Start writing a new entry for `path` into a private temporary file.
    pub async fn begin_write(&self, path: &NormalizedPath) -> Result<WriteHandle, CacheError> {
        let id = self.next_write.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .partial_dir
            .join(format!("{}-{}-{}", std::process::id(), id, path.file_name()));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(|e| CacheError::new(&temp_path, e))?;
        debug!("cache write started {} -> {}", path, temp_path.display());
        Ok(WriteHandle {
            writer: BufWriter::new(file),
            temp_path: Some(temp_path),
            final_path: self.entry_path(path),
            written: 0,
        })
    }

    /// Atomically move a fully written entry into place. Returns its length.
    ///
    /// Lookups see either no entry or the complete one; on failure the
    /// temporary file is removed and the store is unchanged.
    pub async fn promote(&self, mut handle: WriteHandle) -> Result<u64, CacheError> {
        let result = handle.commit().await;
        if result.is_err() {
            handle.remove_temp().await;
        }
        result
    }

    /// Drop an unfinished write and its temporary data.
    pub async fn discard(&self, mut handle: WriteHandle) {
        handle.remove_temp().await;
    }
}

/// Exclusive writer for one pending cache entry.
pub struct WriteHandle {
    writer: BufWriter<tokio::fs::File>,
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    written: u64,
}

impl WriteHandle {
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), CacheError> {
        self.writer
            .write_all(data)
            .await
            .map_err(|e| CacheError::new(&self.final_path, e))?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    async fn commit(&mut self) -> Result<u64, CacheError> {
        let final_path = self.final_path.clone();
        let io_err = |e| CacheError::new(&final_path, e);

        self.writer.flush().await.map_err(io_err)?;
        self.writer.get_ref().sync_all().await.map_err(io_err)?;
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        if let Some(temp) = &self.temp_path {
            tokio::fs::rename(temp, &final_path).await.map_err(io_err)?;
        }
        self.temp_path = None;
        Ok(self.written)
    }

    async fn remove_temp(&mut self) {
        if let Some(temp) = self.temp_path.take() {
            if let Err(e) = tokio::fs::remove_file(&temp).await {
                warn!("failed to remove partial file {}: {}", temp.display(), e);
            }
        }
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        // Best-effort cleanup of a write that was neither promoted nor discarded.
        if let Some(temp) = self.temp_path.take() {
            let _ = fs::remove_file(temp);
        }
    }
}

fn is_absent(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory)
}
