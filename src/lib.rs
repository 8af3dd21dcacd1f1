//! swap-manager - local model lifecycle manager for llama-swap
//!
//! Resolves model aliases to Hugging Face GGUF artifacts, keeps per-model
//! runtime arguments, downloads artifacts with resume and verification,
//! derives GPU offload settings, and compiles everything into the config
//! file consumed by the llama-swap supervisor.

pub mod aliases;
pub mod args;
pub mod compiler;
pub mod config;
pub mod download;
pub mod error;
pub mod gguf;
pub mod gpu;
pub mod manager;
pub mod models;
pub mod process;
pub mod storage;

pub use aliases::{AliasDefinition, AliasRegistry};
pub use args::{ArgMap, ArgValue};
pub use compiler::{CompileOptions, CompiledConfig, CompiledModel, compile};
pub use config::{GlobalConfig, Paths};
pub use download::{DownloadState, DownloadStatus, Downloader, FetchRequest, RetryPolicy};
pub use error::{DownloadError, SwapError, SwapResult};
pub use gpu::{GpuProfile, GpuProfiler, GpuVendor, recommend_layers};
pub use manager::{AddRequest, CompileRequest, Manager, PullOptions, ServeRequest};
pub use models::{ModelEntry, ModelStore, PutMode};
pub use process::{CommandRunner, HandoffMode, SystemCommandRunner};
pub use storage::{FileSystemStorage, StorageBackend};
