//! Owned temporary files.
//!
//! A `StagedFile` is a path on local disk with exactly one owner. Dropping
//! the value deletes the file; `keep()` disarms the guard when ownership is
//! handed to someone else (the delivery queue).

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::BridgeError;

/// Longest extension carried over from an uploaded file name.
const MAX_EXTENSION_LEN: usize = 10;

#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    size: u64,
    armed: bool,
}

impl StagedFile {
    /// Reserve a collision-resistant upload path under `dir`:
    /// `tg_<YYYYmmdd_HHMMSS>_<12 hex>.<ext>`. Creates `dir` if needed.
    pub async fn for_upload(dir: &Path, original_name: &str) -> Result<Self, BridgeError> {
        let name = format!(
            "tg_{}_{}.{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            random_hex(6),
            extension_of(original_name)
        );
        Self::reserve(dir, &name).await
    }

    /// Reserve a scratch path for a proxied download:
    /// `tg_<16 hex>_<sanitized name>`.
    pub async fn for_download(dir: &Path, file_name: &str) -> Result<Self, BridgeError> {
        let name = format!("tg_{}_{}", random_hex(8), sanitize_file_name(file_name));
        Self::reserve(dir, &name).await
    }

    async fn reserve(dir: &Path, name: &str) -> Result<Self, BridgeError> {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            BridgeError::LocalResource(format!("Cannot create {}: {e}", dir.display()))
        })?;
        Ok(Self {
            path: dir.join(name),
            size: 0,
            armed: true,
        })
    }

    /// Take ownership of a file staged earlier (by another process run or
    /// another component).
    pub fn adopt(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written through [`StagedFile::writer`].
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open the file for writing, truncating anything already there.
    pub async fn writer(&mut self) -> Result<StagedWriter<'_>, BridgeError> {
        let file = tokio::fs::File::create(&self.path).await.map_err(|e| {
            BridgeError::LocalResource(format!("Cannot write staged file: {e}"))
        })?;
        self.size = 0;
        Ok(StagedWriter { owner: self, file })
    }

    /// Disarm the guard and return the path. The caller now owns the file.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Synchronous: the file is gone by the time the guard has dropped.
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed staged file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove staged file"),
        }
    }
}

/// Chunked writer that keeps the owner's size counter current.
pub struct StagedWriter<'a> {
    owner: &'a mut StagedFile,
    file: tokio::fs::File,
}

impl StagedWriter<'_> {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), BridgeError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| BridgeError::LocalResource(format!("Cannot write staged file: {e}")))?;
        self.owner.size += chunk.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.owner.size
    }

    pub async fn finish(mut self) -> Result<u64, BridgeError> {
        self.file
            .flush()
            .await
            .map_err(|e| BridgeError::LocalResource(format!("Cannot flush staged file: {e}")))?;
        Ok(self.owner.size)
    }
}

fn random_hex(bytes: usize) -> String {
    (0..bytes)
        .map(|_| format!("{:02x}", rand::random::<u8>()))
        .collect()
}

/// Lower-cased alphanumeric extension of `name`, `bin` when there is none.
pub fn extension_of(name: &str) -> String {
    let ext: String = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(MAX_EXTENSION_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    if ext.is_empty() { "bin".into() } else { ext }
}

/// Keep only characters that are safe in a single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(100)
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() { "file".into() } else { cleaned }
}
