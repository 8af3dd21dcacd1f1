//! Command orchestration
//!
//! [`Manager`] wires the stores, the download engine, the GPU profiler and
//! the compiler together. Each method corresponds to one command and reads
//! the on-disk state at the start and writes it at the end.

use crate::aliases::{AliasDefinition, AliasRegistry};
use crate::args::{self, ArgMap, ArgValue};
use crate::compiler::{self, CompileOptions, CompiledConfig};
use crate::config::{GlobalConfig, Paths, artifact_path};
use crate::download::{
    DownloadState, DownloadStatus, Downloader, FetchRequest, NoProgress, ProgressObserver,
    RemoteFile, RemoteSource, RetryPolicy, StagingPaths,
};
use crate::error::{SwapError, SwapResult};
use crate::gguf;
use crate::gpu::{GpuProfile, GpuProfiler, LayerEstimate, recommend_layers};
use crate::models::{ModelEntry, ModelStore, PutMode, parse_model_spec, validate_id};
use crate::process::{self, CommandRunner, CommandSpec, HandoffMode, LaunchSpec};
use crate::storage::StorageBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Parameters of `add`
#[derive(Debug, Clone, Default)]
pub struct AddRequest {
    /// Alias, `REPO:FILE` or hub URL
    pub spec: String,
    pub name: Option<String>,
    /// `KEY=VALUE` pairs layered over the alias defaults
    pub args: Vec<String>,
    pub overwrite: bool,
    pub detect_gpu: bool,
}

/// Parameters of `pull`
pub struct PullOptions {
    pub resume: bool,
    pub progress: Arc<dyn ProgressObserver>,
    pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            resume: true,
            progress: Arc::new(NoProgress),
            cancel: None,
        }
    }
}

/// Parameters of `compile`
#[derive(Debug, Clone, Default)]
pub struct CompileRequest {
    pub selection: Option<Vec<String>>,
    /// `KEY=VALUE` overrides applied to every model
    pub overrides: Vec<String>,
    /// Detect hardware now instead of using the cached profile
    pub detect_gpu: bool,
}

/// Parameters of `serve`
#[derive(Debug, Clone)]
pub struct ServeRequest {
    pub compile: CompileRequest,
    /// Bind the supervisor on all interfaces
    pub public: bool,
    pub mode: HandoffMode,
    pub grace: Duration,
}

impl Default for ServeRequest {
    fn default() -> Self {
        Self {
            compile: CompileRequest::default(),
            public: false,
            mode: HandoffMode::default(),
            grace: Duration::from_secs(10),
        }
    }
}

/// Result of `remove`
#[derive(Debug, Clone)]
pub struct RemoveOutcome {
    pub entry: ModelEntry,
    /// Artifact file deleted from disk
    pub artifact_deleted: bool,
    /// Another model still references the artifact, so it was kept
    pub artifact_shared: bool,
}

/// Suggested offload for one model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSuggestion {
    pub id: String,
    pub layers: u32,
    /// Explicit `n-gpu-layers` that overrides the suggestion
    pub explicit: Option<i64>,
}

pub struct Manager {
    paths: Paths,
    storage: Arc<dyn StorageBackend>,
    runner: Arc<dyn CommandRunner>,
    remote: Arc<dyn RemoteSource>,
    aliases: AliasRegistry,
    store: ModelStore,
    retry: RetryPolicy,
}

impl Manager {
    pub fn new(
        paths: Paths,
        storage: Arc<dyn StorageBackend>,
        runner: Arc<dyn CommandRunner>,
        remote: Arc<dyn RemoteSource>,
    ) -> Self {
        let store = ModelStore::new(storage.clone(), paths.models_dir());
        Self {
            paths,
            storage,
            runner,
            remote,
            aliases: AliasRegistry::builtin(),
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub fn aliases(&self) -> &[AliasDefinition] {
        self.aliases.list()
    }

    /// Effective global settings, environment overrides included
    pub async fn load_global(&self) -> SwapResult<GlobalConfig> {
        GlobalConfig::load(self.storage.as_ref(), &self.paths).await
    }

    /// Stored global record, the only form that is ever saved back
    async fn load_record(&self) -> SwapResult<GlobalConfig> {
        GlobalConfig::load_record(self.storage.as_ref(), &self.paths).await
    }

    async fn save_global(&self, global: &GlobalConfig) -> SwapResult<()> {
        global.save(self.storage.as_ref(), &self.paths).await
    }

    // ------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------

    /// Create the storage layout and global record. An existing record is
    /// kept unless `reset` is set.
    pub async fn init(&self, reset: bool) -> SwapResult<GlobalConfig> {
        let existing = self.storage.load(&self.paths.config_file()).await?;
        let global = match existing {
            Some(_) if !reset => self.load_record().await?,
            _ => GlobalConfig::default(),
        };

        for dir in [self.paths.models_dir(), global.ggufs_dir(&self.paths)] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| SwapError::storage(&dir, e))?;
        }
        self.save_global(&global).await?;

        tracing::info!(home = ?self.paths.home, reset = reset, "Storage initialized");
        Ok(global)
    }

    // ------------------------------------------------------------------
    // Models
    // ------------------------------------------------------------------

    /// Register a model without downloading it
    pub async fn add(&self, req: &AddRequest) -> SwapResult<ModelEntry> {
        let source = parse_model_spec(&req.spec, &self.aliases)?;
        let id = match &req.name {
            Some(name) => validate_id(name)?,
            None => source.default_id()?,
        };

        let mut entry = ModelEntry::from_source(id, &source);
        let extra = args::parse_assignments(&req.args)?;
        entry.args = args::merge(&[&entry.args, &extra])?;

        let mode = if req.overwrite {
            PutMode::Overwrite
        } else {
            PutMode::Create
        };
        self.store.put(&entry, mode).await?;

        let mut global = self.load_record().await?;
        let mut global_changed = false;
        if global.default_model.is_none() {
            global.default_model = Some(entry.id.clone());
            global_changed = true;
        }
        if req.detect_gpu {
            global.gpu = Some(self.detect_gpu().await);
            global_changed = true;
        }
        if global_changed {
            self.save_global(&global).await?;
        }

        tracing::info!(
            model = %entry.id,
            repo = %entry.repo,
            file = %entry.file,
            alias = ?entry.source_alias,
            "Model added"
        );
        Ok(entry)
    }

    pub async fn list(&self) -> SwapResult<Vec<ModelEntry>> {
        self.store.list().await
    }

    pub async fn get(&self, id: &str) -> SwapResult<ModelEntry> {
        self.store.get(id).await
    }

    /// Download (or resume) a model's artifact
    pub async fn pull(&self, id: &str, options: PullOptions) -> SwapResult<ModelEntry> {
        let mut entry = self.store.get(id).await?;
        let global = self.load_global().await?;
        let dest = artifact_path(&global.ggufs_dir(&self.paths), &entry.file);

        let remote = RemoteFile::new(&entry.repo, &entry.file).with_revision(entry.revision());
        let mut request = FetchRequest::new(remote, &dest);
        request.resume = options.resume;
        if entry.artifact_path.as_deref() == Some(dest.as_path()) {
            request.previous = Some(entry.download.clone());
        }

        let mut downloader = Downloader::new(self.remote.clone())
            .with_retry(self.retry.clone())
            .with_progress(options.progress);
        if let Some(cancel) = options.cancel {
            downloader = downloader.with_cancel(cancel);
        }

        tracing::info!(model = %entry.id, repo = %entry.repo, file = %entry.file, dest = ?dest, "Pulling model");

        match downloader.fetch(&request).await {
            Ok(state) => {
                entry.download = state;
                entry.artifact_path = Some(dest.clone());
                if entry.layers.is_none() {
                    entry.layers = gguf::read_block_count(&dest).await;
                }
                self.store.put(&entry, PutMode::Overwrite).await?;
                Ok(entry)
            }
            Err(e) => {
                let intact = entry.is_servable()
                    && entry
                        .artifact_path
                        .as_deref()
                        .is_some_and(|path| path.is_file());
                if intact {
                    // The staging sidecar records the failed re-pull; the
                    // completed download stays servable
                    tracing::warn!(model = %entry.id, error = %e, "Re-pull failed, keeping existing artifact");
                    return Err(e.into());
                }
                entry.download = Downloader::staged_state(&dest).await.unwrap_or(DownloadState {
                    status: DownloadStatus::Failed,
                    ..Default::default()
                });
                self.store.put(&entry, PutMode::Overwrite).await?;
                Err(e.into())
            }
        }
    }

    /// Delete a model record, optionally with its artifact
    pub async fn remove(&self, id: &str, delete_artifact: bool) -> SwapResult<RemoveOutcome> {
        let entry = self.store.delete(id).await?;

        let mut global = self.load_record().await?;
        if global.default_model.as_deref() == Some(id) {
            global.default_model = None;
            self.save_global(&global).await?;
            tracing::info!(model = %id, "Removed model was the default; default cleared");
        }

        let mut outcome = RemoveOutcome {
            entry,
            artifact_deleted: false,
            artifact_shared: false,
        };
        if !delete_artifact {
            return Ok(outcome);
        }

        let dest = outcome
            .entry
            .artifact_path
            .clone()
            .unwrap_or_else(|| artifact_path(&global.ggufs_dir(&self.paths), &outcome.entry.file));

        let shared = self.store.list().await?.into_iter().any(|other| {
            other.artifact_path.as_deref() == Some(dest.as_path())
                || (other.repo == outcome.entry.repo && other.file == outcome.entry.file)
        });
        if shared {
            tracing::info!(model = %id, path = ?dest, "Artifact still referenced by another model, keeping it");
            outcome.artifact_shared = true;
            return Ok(outcome);
        }

        outcome.artifact_deleted = remove_file(&dest).await?;
        let staging = StagingPaths::for_dest(&dest);
        remove_file(&staging.partial).await?;
        remove_file(&staging.sidecar).await?;
        tracing::info!(model = %id, path = ?dest, deleted = outcome.artifact_deleted, "Artifact removed");
        Ok(outcome)
    }

    /// Duplicate a model record under a new id
    pub async fn copy(&self, source: &str, target: &str, force: bool) -> SwapResult<ModelEntry> {
        let original = self.store.get(source).await?;
        let mut copy = original.clone();
        copy.id = validate_id(target)?;
        copy.added_at = chrono::Utc::now();
        // The alias stays with the original
        copy.source_alias = None;

        let mode = if force {
            PutMode::Overwrite
        } else {
            PutMode::Create
        };
        self.store.put(&copy, mode).await?;
        tracing::info!(source = %source, target = %copy.id, "Model copied");
        Ok(copy)
    }

    // ------------------------------------------------------------------
    // Arguments
    // ------------------------------------------------------------------

    /// Set `KEY=VALUE` arguments on a model
    pub async fn set_args(&self, id: &str, assignments: &[String]) -> SwapResult<ModelEntry> {
        let mut entry = self.store.get(id).await?;
        let updates = args::parse_assignments(assignments)?;
        entry.args = args::merge(&[&entry.args, &updates])?;
        self.store.put(&entry, PutMode::Overwrite).await?;
        Ok(entry)
    }

    /// Remove arguments, returning the keys that were present
    pub async fn unset_args(&self, id: &str, keys: &[String]) -> SwapResult<Vec<String>> {
        let mut entry = self.store.get(id).await?;
        let mut removed = Vec::new();
        for key in keys {
            let key = args::normalize_key(key)?;
            if entry.args.remove(&key).is_some() {
                removed.push(key);
            }
        }
        if !removed.is_empty() {
            self.store.put(&entry, PutMode::Overwrite).await?;
        }
        Ok(removed)
    }

    pub async fn get_arg(&self, id: &str, key: &str) -> SwapResult<Option<ArgValue>> {
        let entry = self.store.get(id).await?;
        let key = args::normalize_key(key)?;
        Ok(entry.args.get(&key).cloned())
    }

    /// Arguments a model would be served with
    pub async fn effective_args(&self, id: &str) -> SwapResult<ArgMap> {
        let entry = self.store.get(id).await?;
        let global = self.load_global().await?;
        let gpu = global.gpu.clone().unwrap_or_default();
        compiler::effective_args(&global, &entry, &gpu, &ArgMap::new())
    }

    // ------------------------------------------------------------------
    // Global settings
    // ------------------------------------------------------------------

    pub async fn global_set(&self, key: &str, value: &str) -> SwapResult<GlobalConfig> {
        let mut global = self.load_record().await?;
        global.set_key(key, value)?;
        global.validate()?;
        self.save_global(&global).await?;
        Ok(global)
    }

    pub async fn global_get(&self, key: &str) -> SwapResult<Option<String>> {
        self.load_global().await?.get_key(key)
    }

    /// Remove a default argument (`FLAG` or `default-args.FLAG`) or a
    /// supervisor macro (`macros.NAME`)
    pub async fn global_unset(&self, key: &str) -> SwapResult<bool> {
        let mut global = self.load_record().await?;
        let removed = match key.strip_prefix("macros.") {
            Some(name) => global.macros.remove(name.trim()).is_some(),
            None => {
                let flag = args::normalize_key(key.strip_prefix("default-args.").unwrap_or(key))?;
                global.default_args.remove(&flag).is_some()
            }
        };
        if removed {
            self.save_global(&global).await?;
        }
        Ok(removed)
    }

    /// Replace the global record with defaults
    pub async fn global_reset(&self) -> SwapResult<GlobalConfig> {
        let global = GlobalConfig::default();
        self.save_global(&global).await?;
        tracing::info!("Global config reset to defaults");
        Ok(global)
    }

    // ------------------------------------------------------------------
    // Hardware
    // ------------------------------------------------------------------

    pub async fn detect_gpu(&self) -> GpuProfile {
        GpuProfiler::new(self.runner.as_ref()).detect().await
    }

    /// Detect, cache the profile, and suggest layers for every model
    pub async fn gpu_report(&self) -> SwapResult<(GpuProfile, Vec<LayerSuggestion>)> {
        let profile = self.detect_gpu().await;
        let mut record = self.load_record().await?;
        record.gpu = Some(profile.clone());
        self.save_global(&record).await?;
        let global = self.load_global().await?;

        let suggestions = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|entry| LayerSuggestion {
                layers: recommend_layers(
                    &profile,
                    entry.download.total.unwrap_or(0),
                    entry.layers,
                    LayerEstimate(global.layer_bytes_estimate),
                ),
                explicit: entry.args.get(args::GPU_LAYERS_KEY).and_then(ArgValue::as_int),
                id: entry.id,
            })
            .collect();
        Ok((profile, suggestions))
    }

    // ------------------------------------------------------------------
    // Compile and serve
    // ------------------------------------------------------------------

    /// Compile and atomically write the supervisor config
    pub async fn compile(&self, req: &CompileRequest) -> SwapResult<(CompiledConfig, PathBuf)> {
        let entries = self.store.list().await?;

        if req.detect_gpu {
            let profile = self.detect_gpu().await;
            let mut record = self.load_record().await?;
            record.gpu = Some(profile);
            self.save_global(&record).await?;
        }
        let global = self.load_global().await?;
        let gpu = global.gpu.clone().unwrap_or_default();

        let options = CompileOptions {
            selection: req.selection.clone(),
            overrides: args::parse_assignments(&req.overrides)?,
        };
        let compiled = compiler::compile(&global, &entries, &gpu, &options)?;

        let path = self.paths.compiled_config();
        compiled.write(self.storage.as_ref(), &path).await?;
        Ok((compiled, path))
    }

    /// Supervisor invocation for a compiled config
    pub async fn launch_spec(&self, config_path: &Path, req: &ServeRequest) -> SwapResult<LaunchSpec> {
        let global = self.load_global().await?;
        let host = if req.public { "0.0.0.0" } else { "127.0.0.1" };
        let listen = format!("{}:{}", host, global.listen_port);

        let command = CommandSpec::new(
            global.supervisor_binary.clone(),
            [
                "--config".to_string(),
                config_path.display().to_string(),
                "--listen".to_string(),
                listen,
            ],
        );
        Ok(LaunchSpec {
            command,
            config_path: config_path.to_path_buf(),
            grace: req.grace,
        })
    }

    /// Compile, then hand execution to the supervisor
    pub async fn serve(&self, req: &ServeRequest) -> SwapResult<i32> {
        let (compiled, path) = self.compile(&req.compile).await?;
        tracing::info!(models = compiled.models.len(), public = req.public, "Starting supervisor");
        let spec = self.launch_spec(&path, req).await?;
        process::hand_off(spec, req.mode).await
    }
}

async fn remove_file(path: &Path) -> SwapResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SwapError::storage(path, e)),
    }
}
