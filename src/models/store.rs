//! Persistent model records, one TOML file per model id

use super::entry::{ModelEntry, validate_id};
use crate::error::{SwapError, SwapResult};
use crate::storage::StorageBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const RECORD_EXT: &str = "toml";

/// Whether `put` may replace an existing record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Fail with `Conflict` when the id exists
    Create,
    Overwrite,
}

/// CRUD over `<models_dir>/<id>.toml`
pub struct ModelStore {
    storage: Arc<dyn StorageBackend>,
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(storage: Arc<dyn StorageBackend>, dir: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> SwapResult<PathBuf> {
        let id = validate_id(id)?;
        Ok(self.dir.join(format!("{}.{}", id, RECORD_EXT)))
    }

    fn parse(path: &Path, content: &str) -> SwapResult<ModelEntry> {
        toml::from_str(content)
            .map_err(|e| SwapError::storage(path, format!("failed to parse model record: {}", e)))
    }

    /// Load a model, `NotFound` if absent
    pub async fn get(&self, id: &str) -> SwapResult<ModelEntry> {
        self.find(id)
            .await?
            .ok_or_else(|| SwapError::model_not_found(id))
    }

    /// Load a model if it exists
    pub async fn find(&self, id: &str) -> SwapResult<Option<ModelEntry>> {
        let path = match self.record_path(id) {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };
        match self.storage.load(&path).await? {
            Some(content) => Self::parse(&path, &content).map(Some),
            None => Ok(None),
        }
    }

    pub async fn contains(&self, id: &str) -> SwapResult<bool> {
        Ok(self.find(id).await?.is_some())
    }

    /// All models ordered by id. Unreadable records are skipped with a warning.
    pub async fn list(&self) -> SwapResult<Vec<ModelEntry>> {
        let mut entries = Vec::new();
        for path in self.storage.list(&self.dir, RECORD_EXT).await? {
            let Some(content) = self.storage.load(&path).await? else {
                continue;
            };
            match Self::parse(&path, &content) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(path = ?path, error = %e, "Skipping unreadable model record"),
            }
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    /// Write a full record atomically
    pub async fn put(&self, entry: &ModelEntry, mode: PutMode) -> SwapResult<()> {
        let path = self.record_path(&entry.id)?;

        if mode == PutMode::Create && self.storage.load(&path).await?.is_some() {
            return Err(SwapError::Conflict(format!(
                "model '{}' already exists (use --force to overwrite)",
                entry.id
            )));
        }

        let content = toml::to_string_pretty(entry)
            .map_err(|e| SwapError::storage(&path, format!("failed to serialize: {}", e)))?;
        self.storage.save(&path, &content).await?;

        tracing::debug!(model = %entry.id, path = ?path, "Model record saved");
        Ok(())
    }

    /// Delete a record, `NotFound` if absent
    pub async fn delete(&self, id: &str) -> SwapResult<ModelEntry> {
        let entry = self.get(id).await?;
        let path = self.record_path(id)?;
        self.storage.remove(&path).await?;
        tracing::debug!(model = %id, "Model record removed");
        Ok(entry)
    }
}
