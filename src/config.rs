//! Global configuration record and on-disk layout

use crate::args::{self, ArgMap};
use crate::error::{SwapError, SwapResult};
use crate::gpu::GpuProfile;
use crate::storage::StorageBackend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable overriding the storage root
pub const HOME_ENV: &str = "SWAP_MANAGER_HOME";

/// Directory layout under the storage root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub home: PathBuf,
}

impl Paths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Resolve the storage root.
    ///
    /// Checks in order:
    /// 1. `$SWAP_MANAGER_HOME`
    /// 2. `<config dir>/swap-manager`
    /// 3. `~/.config/swap-manager`
    pub fn resolve() -> Self {
        if let Ok(home) = std::env::var(HOME_ENV)
            && !home.is_empty()
        {
            return Self::new(home);
        }

        let home = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("swap-manager");
        Self::new(home)
    }

    pub fn config_file(&self) -> PathBuf {
        self.home.join("config.toml")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.home.join("models")
    }

    pub fn default_ggufs_dir(&self) -> PathBuf {
        self.home.join("ggufs")
    }

    /// Compiled supervisor config, overwritten on every compile
    pub fn compiled_config(&self) -> PathBuf {
        self.home.join("llama-swap.yaml")
    }
}

/// Process-wide settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Where GGUF artifacts live; defaults to `<home>/ggufs`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ggufs_dir: Option<PathBuf>,

    /// Model served under the `default` supervisor alias
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Port the supervisor listens on
    pub listen_port: u16,

    /// Port range [start, end) used for automatic model port assignment
    pub start_port: u16,
    pub end_port: u16,

    /// Inference server executable invoked by the supervisor
    pub server_binary: String,

    /// Supervisor executable launched by `serve`
    pub supervisor_binary: String,

    /// Seconds the supervisor waits for a model's health check
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_timeout: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Seconds of inactivity before the supervisor unloads a model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_ttl: Option<u64>,

    /// Device memory assumed per layer when the layer count is unknown
    pub layer_bytes_estimate: u64,

    /// Arguments applied to every model below its own arguments
    pub default_args: ArgMap,

    /// Supervisor macros, copied verbatim into the compiled config
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub macros: BTreeMap<String, String>,

    /// Last detected hardware profile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuProfile>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            ggufs_dir: None,
            default_model: None,
            listen_port: default_listen_port(),
            start_port: default_start_port(),
            end_port: default_end_port(),
            server_binary: default_server_binary(),
            supervisor_binary: default_supervisor_binary(),
            health_check_timeout: None,
            log_level: None,
            model_ttl: None,
            layer_bytes_estimate: default_layer_bytes_estimate(),
            default_args: ArgMap::new(),
            macros: BTreeMap::new(),
            gpu: None,
        }
    }
}

impl GlobalConfig {
    /// Load the effective settings: the stored record with environment
    /// overrides applied. Never save the result; use [`Self::load_record`]
    /// for read-modify-write.
    pub async fn load(storage: &dyn StorageBackend, paths: &Paths) -> SwapResult<Self> {
        let mut config = Self::load_record(storage, paths).await?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load the stored record as written, falling back to defaults when absent
    pub async fn load_record(storage: &dyn StorageBackend, paths: &Paths) -> SwapResult<Self> {
        let path = paths.config_file();
        let config = match storage.load(&path).await? {
            Some(content) => toml::from_str(&content).map_err(|e| {
                SwapError::storage(&path, format!("failed to parse global config: {}", e))
            })?,
            None => {
                tracing::debug!(path = ?path, "No global config found, using defaults");
                Self::default()
            }
        };
        Ok(config)
    }

    /// Persist the record atomically
    pub async fn save(&self, storage: &dyn StorageBackend, paths: &Paths) -> SwapResult<()> {
        let path = paths.config_file();
        let content = toml::to_string_pretty(self)
            .map_err(|e| SwapError::storage(&path, format!("failed to serialize: {}", e)))?;
        storage.save(&path, &content).await?;
        tracing::debug!(path = ?path, "Global config saved");
        Ok(())
    }

    /// Environment variable overrides
    pub fn apply_env_overrides(&mut self) -> SwapResult<()> {
        if let Ok(port) = std::env::var("SWAP_MANAGER_LISTEN_PORT") {
            self.listen_port = port.parse().map_err(|_| {
                SwapError::Config(format!("invalid SWAP_MANAGER_LISTEN_PORT value: {}", port))
            })?;
        }
        if let Ok(binary) = std::env::var("SWAP_MANAGER_SERVER_BIN") {
            self.server_binary = binary;
        }
        if let Ok(binary) = std::env::var("SWAP_MANAGER_SUPERVISOR_BIN") {
            self.supervisor_binary = binary;
        }
        Ok(())
    }

    /// Validate port settings
    pub fn validate(&self) -> SwapResult<()> {
        if self.listen_port < 1024 {
            return Err(SwapError::Config(format!(
                "listen port must be >= 1024 (got {})",
                self.listen_port
            )));
        }
        if self.start_port < 1024 {
            return Err(SwapError::Config(format!(
                "start port must be >= 1024 (got {})",
                self.start_port
            )));
        }
        if self.start_port >= self.end_port {
            return Err(SwapError::Config(format!(
                "model port range {}..{} is empty",
                self.start_port, self.end_port
            )));
        }
        if (self.start_port..self.end_port).contains(&self.listen_port) {
            return Err(SwapError::Config(format!(
                "listen port {} falls inside the model port range {}..{}",
                self.listen_port, self.start_port, self.end_port
            )));
        }
        Ok(())
    }

    /// Directory holding downloaded artifacts
    pub fn ggufs_dir(&self, paths: &Paths) -> PathBuf {
        self.ggufs_dir
            .clone()
            .unwrap_or_else(|| paths.default_ggufs_dir())
    }

    /// Set a key from the command line.
    /// `default-args.<flag>` keys edit the default argument layer.
    pub fn set_key(&mut self, key: &str, value: &str) -> SwapResult<()> {
        if let Some(flag) = key.strip_prefix("default-args.") {
            let flag = args::normalize_key(flag)?;
            let parsed = args::parse_value(&flag, value)?;
            self.default_args.insert(flag, parsed);
            return Ok(());
        }
        if let Some(name) = key.strip_prefix("macros.") {
            let name = validate_macro_name(name)?;
            match non_empty(value) {
                Some(value) => self.macros.insert(name, value.to_string()),
                None => self.macros.remove(&name),
            };
            return Ok(());
        }

        match normalize_global_key(key).as_str() {
            "ggufs_dir" => self.ggufs_dir = non_empty(value).map(PathBuf::from),
            "default_model" => self.default_model = non_empty(value).map(str::to_string),
            "listen_port" => self.listen_port = parse_number(key, value)?,
            "start_port" => self.start_port = parse_number(key, value)?,
            "end_port" => self.end_port = parse_number(key, value)?,
            "server_binary" => self.server_binary = value.to_string(),
            "supervisor_binary" => self.supervisor_binary = value.to_string(),
            "health_check_timeout" => {
                self.health_check_timeout = non_empty(value)
                    .map(|v| parse_number(key, v))
                    .transpose()?
            }
            "log_level" => self.log_level = non_empty(value).map(str::to_string),
            "model_ttl" => {
                self.model_ttl = non_empty(value)
                    .map(|v| parse_number(key, v))
                    .transpose()?
            }
            "layer_bytes_estimate" => self.layer_bytes_estimate = parse_number(key, value)?,
            _ => {
                return Err(SwapError::Config(format!(
                    "unknown global config key: {}",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Read a key as display text
    pub fn get_key(&self, key: &str) -> SwapResult<Option<String>> {
        if let Some(flag) = key.strip_prefix("default-args.") {
            return Ok(self.default_args.get(flag).map(|v| v.to_string()));
        }
        if let Some(name) = key.strip_prefix("macros.") {
            return Ok(self.macros.get(name).cloned());
        }

        let value = match normalize_global_key(key).as_str() {
            "ggufs_dir" => self.ggufs_dir.as_ref().map(|p| p.display().to_string()),
            "default_model" => self.default_model.clone(),
            "listen_port" => Some(self.listen_port.to_string()),
            "start_port" => Some(self.start_port.to_string()),
            "end_port" => Some(self.end_port.to_string()),
            "server_binary" => Some(self.server_binary.clone()),
            "supervisor_binary" => Some(self.supervisor_binary.clone()),
            "health_check_timeout" => self.health_check_timeout.map(|v| v.to_string()),
            "log_level" => self.log_level.clone(),
            "model_ttl" => self.model_ttl.map(|v| v.to_string()),
            "layer_bytes_estimate" => Some(self.layer_bytes_estimate.to_string()),
            _ => {
                return Err(SwapError::Config(format!(
                    "unknown global config key: {}",
                    key
                )));
            }
        };
        Ok(value)
    }
}

/// Macro names are referenced as `${name}` in supervisor commands
pub fn validate_macro_name(name: &str) -> SwapResult<String> {
    let name = name.trim();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(name.to_string())
    } else {
        Err(SwapError::Config(format!("invalid macro name: '{}'", name)))
    }
}

fn normalize_global_key(key: &str) -> String {
    key.trim().replace('-', "_").to_lowercase()
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> SwapResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SwapError::Config(format!("invalid value for {}: {}", key, value)))
}

// Default functions
fn default_listen_port() -> u16 {
    8080
}
fn default_start_port() -> u16 {
    9001
}
fn default_end_port() -> u16 {
    9999
}
fn default_server_binary() -> String {
    "llama-server".to_string()
}
fn default_supervisor_binary() -> String {
    "llama-swap".to_string()
}
fn default_layer_bytes_estimate() -> u64 {
    768 * 1024 * 1024
}

/// Resolve an artifact path relative to the artifact directory
pub fn artifact_path(ggufs_dir: &Path, file: &str) -> PathBuf {
    ggufs_dir.join(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::ArgValue;
    use crate::storage::mocks::MockStorage;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = GlobalConfig::default();
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.start_port, 9001);
        assert!(config.default_model.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_validation() {
        let config = GlobalConfig {
            listen_port: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GlobalConfig {
            listen_port: 9100,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GlobalConfig {
            start_port: 9500,
            end_port: 9500,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_set_and_get_keys() {
        let mut config = GlobalConfig::default();
        config.set_key("default-model", "qwen3-8b").unwrap();
        config.set_key("listen_port", "8181").unwrap();
        config.set_key("default-args.ctx-size", "8192").unwrap();

        assert_eq!(config.default_model.as_deref(), Some("qwen3-8b"));
        assert_eq!(config.listen_port, 8181);
        assert_eq!(config.default_args["ctx-size"], ArgValue::Int(8192));
        assert_eq!(
            config.get_key("default-args.ctx-size").unwrap().as_deref(),
            Some("8192")
        );
        assert_eq!(config.get_key("listen-port").unwrap().as_deref(), Some("8181"));

        assert!(config.set_key("listen_port", "not-a-port").is_err());
        assert!(config.set_key("default-args.ctx-size", "big").is_err());
        assert!(config.set_key("colour", "blue").is_err());

        config.set_key("default_model", "").unwrap();
        assert!(config.default_model.is_none());
    }

    #[test]
    fn test_macro_keys() {
        let mut config = GlobalConfig::default();
        config.set_key("macros.models_dir", "/srv/ggufs").unwrap();
        assert_eq!(
            config.get_key("macros.models_dir").unwrap().as_deref(),
            Some("/srv/ggufs")
        );
        assert!(config.set_key("macros.bad name", "x").is_err());

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: GlobalConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.macros["models_dir"], "/srv/ggufs");

        config.set_key("macros.models_dir", "").unwrap();
        assert!(config.macros.is_empty());
        assert!(!toml::to_string_pretty(&config).unwrap().contains("macros"));
    }

    #[tokio::test]
    async fn test_load_missing_returns_defaults() {
        let storage = MockStorage::new();
        let paths = Paths::new("/test/home");
        let config = GlobalConfig::load(&storage, &paths).await.unwrap();
        assert_eq!(config.server_binary, GlobalConfig::default().server_binary);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let storage = MockStorage::new();
        let paths = Paths::new("/test/home");

        let mut config = GlobalConfig::default();
        config.default_model = Some("mistral-7b".to_string());
        config
            .default_args
            .insert("flash-attn".to_string(), ArgValue::Bool(true));
        config.save(&storage, &paths).await.unwrap();

        assert!(storage.get_file(&paths.config_file()).await.is_some());
        let loaded = GlobalConfig::load(&storage, &paths).await.unwrap();
        assert_eq!(loaded.default_model.as_deref(), Some("mistral-7b"));
        assert_eq!(loaded.default_args["flash-attn"], ArgValue::Bool(true));
    }

    #[tokio::test]
    async fn test_corrupted_config_fails() {
        let storage = MockStorage::new();
        let paths = Paths::new("/test/home");
        storage
            .save(&paths.config_file(), "listen_port = [")
            .await
            .unwrap();

        let err = GlobalConfig::load(&storage, &paths).await.unwrap_err();
        assert!(matches!(err, SwapError::Storage { .. }));
    }

    #[test]
    #[serial]
    fn test_home_env_override() {
        unsafe {
            std::env::set_var(HOME_ENV, "/srv/models");
        }
        let paths = Paths::resolve();
        unsafe {
            std::env::remove_var(HOME_ENV);
        }
        assert_eq!(paths.home, PathBuf::from("/srv/models"));
        assert_eq!(paths.config_file(), PathBuf::from("/srv/models/config.toml"));
        assert_eq!(
            paths.compiled_config(),
            PathBuf::from("/srv/models/llama-swap.yaml")
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_env_overrides_stay_out_of_the_record() {
        let storage = MockStorage::new();
        let paths = Paths::new("/test/home");
        unsafe {
            std::env::set_var("SWAP_MANAGER_LISTEN_PORT", "8999");
        }
        let effective = GlobalConfig::load(&storage, &paths).await;
        let record = GlobalConfig::load_record(&storage, &paths).await;
        unsafe {
            std::env::remove_var("SWAP_MANAGER_LISTEN_PORT");
        }
        assert_eq!(effective.unwrap().listen_port, 8999);
        assert_eq!(record.unwrap().listen_port, 8080);
    }

    #[test]
    #[serial]
    fn test_listen_port_env_override() {
        let mut config = GlobalConfig::default();
        unsafe {
            std::env::set_var("SWAP_MANAGER_LISTEN_PORT", "8999");
        }
        let result = config.apply_env_overrides();
        unsafe {
            std::env::remove_var("SWAP_MANAGER_LISTEN_PORT");
        }
        result.unwrap();
        assert_eq!(config.listen_port, 8999);
    }
}
