//! Persisted transfer state
//!
//! A partial artifact lives at `<dest>.part` with its [`DownloadState`] in a
//! sidecar `<dest>.download.toml`, so a transfer can resume after a restart.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::InProgress => write!(f, "in progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Progress of a single artifact transfer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadState {
    pub status: DownloadStatus,
    /// Bytes present in the staging file (or the final file once completed)
    #[serde(default)]
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Remote fingerprint the staged bytes belong to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl DownloadState {
    pub fn completed(total: u64, validator: Option<String>, sha256: Option<String>) -> Self {
        Self {
            status: DownloadStatus::Completed,
            bytes: total,
            total: Some(total),
            validator,
            sha256,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == DownloadStatus::Completed
    }
}

/// Files involved in transferring one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPaths {
    pub dest: PathBuf,
    pub partial: PathBuf,
    pub sidecar: PathBuf,
}

impl StagingPaths {
    pub fn for_dest(dest: &Path) -> Self {
        Self {
            dest: dest.to_path_buf(),
            partial: with_suffix(dest, ".part"),
            sidecar: with_suffix(dest, ".download.toml"),
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}
