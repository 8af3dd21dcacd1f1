//! Supervisor config compiler
//!
//! Turns the global record, model records and a GPU profile into the
//! llama-swap YAML schema. Compilation is pure: identical inputs give
//! byte-identical output, and every validation failure is raised before
//! anything is written.

use crate::args::{self, ArgMap, ArgValue, GPU_LAYERS_KEY, PORT_KEY};
use crate::config::GlobalConfig;
use crate::error::{SwapError, SwapResult};
use crate::gpu::{GpuProfile, LayerEstimate, recommend_layers};
use crate::models::ModelEntry;
use crate::storage::StorageBackend;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Supervisor alias attached to the default model
pub const DEFAULT_ALIAS: &str = "default";
pub const HEALTH_CHECK_PATH: &str = "/health";
const LOOPBACK: &str = "127.0.0.1";

/// Per-invocation compile inputs
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Models to serve; `None` serves every stored model
    pub selection: Option<Vec<String>>,
    /// Highest-precedence arguments applied to every model
    pub overrides: ArgMap,
}

/// One model in supervisor form
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledModel {
    /// Shell-quoted command line
    pub cmd: String,
    pub proxy: String,
    pub check_endpoint: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,

    #[serde(skip)]
    pub program: String,
    /// Ordered argument list, unquoted
    #[serde(skip)]
    pub args: Vec<String>,
    #[serde(skip)]
    pub port: u16,
    #[serde(skip)]
    pub is_default: bool,
}

/// Full supervisor config
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub macros: BTreeMap<String, String>,
    pub models: BTreeMap<String, CompiledModel>,
    pub groups: BTreeMap<String, serde_yaml::Value>,
}

impl CompiledConfig {
    pub fn to_yaml(&self) -> SwapResult<String> {
        serde_yaml::to_string(self)
            .map_err(|e| SwapError::Config(format!("failed to serialize supervisor config: {}", e)))
    }

    /// Atomically replace the compiled file
    pub async fn write(&self, storage: &dyn StorageBackend, path: &Path) -> SwapResult<()> {
        let yaml = self.to_yaml()?;
        storage.save(path, &yaml).await?;
        tracing::info!(path = ?path, models = self.models.len(), "Supervisor config written");
        Ok(())
    }
}

/// Effective arguments for one model: built-in defaults < global defaults
/// < model arguments < overrides, then the GPU suggestion where no
/// explicit layer count exists
pub fn effective_args(
    global: &GlobalConfig,
    entry: &ModelEntry,
    gpu: &GpuProfile,
    overrides: &ArgMap,
) -> SwapResult<ArgMap> {
    let builtin = args::builtin_defaults();
    let mut merged = args::merge(&[&builtin, &global.default_args, &entry.args, overrides])
        .map_err(|e| SwapError::Config(format!("model '{}': {}", entry.id, e)))?;

    if !merged.contains_key(GPU_LAYERS_KEY) {
        let layers = recommend_layers(
            gpu,
            entry.download.total.unwrap_or(0),
            entry.layers,
            LayerEstimate(global.layer_bytes_estimate),
        );
        if layers > 0 {
            merged.insert(GPU_LAYERS_KEY.to_string(), ArgValue::Int(i64::from(layers)));
        }
    }
    Ok(merged)
}

/// Compile the supervisor config
pub fn compile(
    global: &GlobalConfig,
    entries: &[ModelEntry],
    gpu: &GpuProfile,
    options: &CompileOptions,
) -> SwapResult<CompiledConfig> {
    global.validate()?;

    let by_id: BTreeMap<&str, &ModelEntry> = entries.iter().map(|e| (e.id.as_str(), e)).collect();

    if let Some(default) = &global.default_model
        && !by_id.contains_key(default.as_str())
    {
        return Err(SwapError::Config(format!(
            "default model '{}' does not exist",
            default
        )));
    }

    let selected: Vec<&ModelEntry> = match &options.selection {
        Some(ids) => {
            let unique: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
            unique
                .into_iter()
                .map(|id| {
                    by_id
                        .get(id)
                        .copied()
                        .ok_or_else(|| SwapError::model_not_found(id))
                })
                .collect::<SwapResult<_>>()?
        }
        None => by_id.values().copied().collect(),
    };

    if selected.is_empty() {
        return Err(SwapError::Config("no models to serve".to_string()));
    }

    // Referenced models must have a completed artifact
    for entry in &selected {
        if !entry.is_servable() {
            return Err(SwapError::Config(format!(
                "model '{}' has no downloaded artifact (download status: {}); run pull first",
                entry.id, entry.download.status
            )));
        }
    }

    let mut resolved: Vec<(&ModelEntry, ArgMap)> = Vec::with_capacity(selected.len());
    for entry in selected {
        let args = effective_args(global, entry, gpu, &options.overrides)?;
        resolved.push((entry, args));
    }

    let ports = assign_ports(global, &resolved)?;
    let aliases = assign_aliases(global, &resolved);

    let mut models = BTreeMap::new();
    for (entry, args) in &resolved {
        let port = ports[entry.id.as_str()];
        let model = build_model(global, entry, args, port, aliases.get(entry.id.as_str()));
        models.insert(entry.id.clone(), model);
    }

    tracing::debug!(models = models.len(), "Compiled supervisor config");

    Ok(CompiledConfig {
        health_check_timeout: global.health_check_timeout,
        log_level: global.log_level.clone(),
        macros: global.macros.clone(),
        models,
        groups: BTreeMap::new(),
    })
}

/// Explicit ports first, then the lowest free port of the model range in id order
fn assign_ports<'a>(
    global: &GlobalConfig,
    resolved: &[(&'a ModelEntry, ArgMap)],
) -> SwapResult<BTreeMap<&'a str, u16>> {
    let mut claimed: BTreeMap<u16, &str> = BTreeMap::new();
    let mut ports = BTreeMap::new();

    for &(entry, ref args) in resolved {
        let Some(value) = args.get(PORT_KEY) else {
            continue;
        };
        let port = value
            .as_int()
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0)
            .ok_or_else(|| {
                SwapError::Config(format!("model '{}' has invalid port {}", entry.id, value))
            })?;

        if port == global.listen_port {
            return Err(SwapError::Config(format!(
                "model '{}' uses port {} which is the supervisor listen port",
                entry.id, port
            )));
        }
        if let Some(other) = claimed.insert(port, entry.id.as_str()) {
            return Err(SwapError::Config(format!(
                "models '{}' and '{}' both use port {}",
                other, entry.id, port
            )));
        }
        ports.insert(entry.id.as_str(), port);
    }

    let mut candidates = (global.start_port..global.end_port)
        .filter(|p| *p != global.listen_port && !claimed.contains_key(p));
    for &(entry, _) in resolved {
        if ports.contains_key(entry.id.as_str()) {
            continue;
        }
        let port = candidates.next().ok_or_else(|| {
            SwapError::Config(format!(
                "no free port left in {}..{} for model '{}'",
                global.start_port, global.end_port, entry.id
            ))
        })?;
        ports.insert(entry.id.as_str(), port);
    }
    Ok(ports)
}

/// Supervisor aliases: the source alias and `default`. An alias name is
/// given to the first model (by id) claiming it and never shadows a model id.
fn assign_aliases<'a>(
    global: &GlobalConfig,
    resolved: &[(&'a ModelEntry, ArgMap)],
) -> BTreeMap<&'a str, Vec<String>> {
    let ids: BTreeSet<&str> = resolved.iter().map(|(e, _)| e.id.as_str()).collect();
    let mut taken: BTreeSet<String> = BTreeSet::new();
    let mut out: BTreeMap<&str, Vec<String>> = BTreeMap::new();

    let mut ordered: Vec<&'a ModelEntry> = resolved.iter().map(|(e, _)| *e).collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));

    for entry in ordered {
        let mut names = Vec::new();
        if let Some(alias) = &entry.source_alias {
            if ids.contains(alias.as_str()) || !taken.insert(alias.clone()) {
                tracing::debug!(model = %entry.id, alias = %alias, "Alias already claimed, skipping");
            } else {
                names.push(alias.clone());
            }
        }
        if global.default_model.as_deref() == Some(entry.id.as_str())
            && !ids.contains(DEFAULT_ALIAS)
        {
            names.push(DEFAULT_ALIAS.to_string());
        }
        out.insert(entry.id.as_str(), names);
    }
    out
}

fn build_model(
    global: &GlobalConfig,
    entry: &ModelEntry,
    args: &ArgMap,
    port: u16,
    aliases: Option<&Vec<String>>,
) -> CompiledModel {
    // Port and model path are always set by the compiler
    let mut rest = args.clone();
    rest.remove(PORT_KEY);
    let host = match rest.remove("host") {
        Some(ArgValue::Str(host)) => host,
        _ => LOOPBACK.to_string(),
    };

    let artifact = entry
        .artifact_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    let proxy = format!("http://{}:{}", proxy_host(&host), port);
    let mut argv = vec![
        "--model".to_string(),
        artifact,
        "--host".to_string(),
        host,
        "--port".to_string(),
        port.to_string(),
    ];
    argv.extend(args::render(&rest));

    let cmd = std::iter::once(global.server_binary.as_str())
        .chain(argv.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ");

    let aliases = aliases.cloned().unwrap_or_default();
    CompiledModel {
        cmd,
        proxy,
        check_endpoint: HEALTH_CHECK_PATH.to_string(),
        is_default: aliases.iter().any(|a| a == DEFAULT_ALIAS),
        aliases,
        ttl: global.model_ttl,
        program: global.server_binary.clone(),
        args: argv,
        port,
    }
}

/// Address the supervisor dials for a server bound to `host`
fn proxy_host(host: &str) -> String {
    match host {
        "0.0.0.0" | "::" | "[::]" | "" => LOOPBACK.to_string(),
        h if h.contains(':') && !h.starts_with('[') => format!("[{}]", h),
        h => h.to_string(),
    }
}

/// Quote a token for the supervisor's shell-style command splitting
pub fn shell_quote(token: &str) -> String {
    let plain = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if plain {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}
