//! Record file persistence
//!
//! All record writes go through [`StorageBackend::save`], which writes a
//! temporary sibling and renames it into place so readers never observe a
//! half-written file.

use crate::error::{SwapError, SwapResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically
    async fn save(&self, path: &Path, content: &str) -> SwapResult<()>;

    /// Load content from a file path
    /// Returns None if file doesn't exist
    async fn load(&self, path: &Path) -> SwapResult<Option<String>>;

    /// Remove a file, returning whether it existed
    async fn remove(&self, path: &Path) -> SwapResult<bool>;

    /// List files in `dir` with the given extension, sorted by path
    async fn list(&self, dir: &Path, extension: &str) -> SwapResult<Vec<PathBuf>>;
}

/// Temporary sibling used for atomic writes
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production storage backend using tokio::fs
pub struct FileSystemStorage;

impl FileSystemStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileSystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> SwapResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SwapError::storage(parent, e))?;
        }

        // Atomic write: write to temp file, then rename
        let temp_file = temp_path(path);

        let mut file = fs::File::create(&temp_file)
            .await
            .map_err(|e| SwapError::storage(&temp_file, e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| SwapError::storage(&temp_file, e))?;
        file.sync_all()
            .await
            .map_err(|e| SwapError::storage(&temp_file, e))?;
        drop(file);

        fs::rename(&temp_file, path)
            .await
            .map_err(|e| SwapError::storage(path, e))?;

        Ok(())
    }

    async fn load(&self, path: &Path) -> SwapResult<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SwapError::storage(path, e)),
        }
    }

    async fn remove(&self, path: &Path) -> SwapResult<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SwapError::storage(path, e)),
        }
    }

    async fn list(&self, dir: &Path, extension: &str) -> SwapResult<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SwapError::storage(dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SwapError::storage(dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(extension) && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
