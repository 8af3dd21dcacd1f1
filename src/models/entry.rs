//! Per-model record and model source parsing

use crate::aliases::{AliasDefinition, AliasRegistry};
use crate::args::ArgMap;
use crate::download::{DownloadState, DownloadStatus};
use crate::error::{SwapError, SwapResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const HUB_URL_PREFIX: &str = "https://huggingface.co/";

/// A configured model, one record file per id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    /// Hub repository, e.g. `unsloth/Qwen3-8B-GGUF`
    pub repo: String,
    /// GGUF file name within the repository
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Alias this entry was created from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_alias: Option<String>,
    /// Total transformer layers, clamps the GPU offload suggestion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layers: Option<u32>,
    /// Set once the artifact has been fully downloaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub download: DownloadState,
    #[serde(default)]
    pub args: ArgMap,
}

impl ModelEntry {
    pub fn new(id: impl Into<String>, repo: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            repo: repo.into(),
            file: file.into(),
            revision: None,
            source_alias: None,
            layers: None,
            artifact_path: None,
            added_at: Utc::now(),
            download: DownloadState::default(),
            args: ArgMap::new(),
        }
    }

    /// Build an entry from a parsed source, copying alias defaults
    pub fn from_source(id: impl Into<String>, source: &ModelSource) -> Self {
        let mut entry = Self::new(id, &source.repo, &source.file);
        entry.revision = source.revision.clone();
        if let Some(alias) = source.alias {
            entry.source_alias = Some(alias.alias.to_string());
            entry.layers = alias.layers;
            entry.args = alias.default_args();
        }
        entry
    }

    /// Only entries with a completed local artifact can be served
    pub fn is_servable(&self) -> bool {
        self.artifact_path.is_some() && self.download.status == DownloadStatus::Completed
    }

    /// Revision used for hub requests
    pub fn revision(&self) -> &str {
        self.revision.as_deref().unwrap_or("main")
    }
}

/// Where a model's artifact comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    pub repo: String,
    pub file: String,
    pub revision: Option<String>,
    pub alias: Option<&'static AliasDefinition>,
}

impl ModelSource {
    fn from_alias(def: &'static AliasDefinition) -> Self {
        Self {
            repo: def.repo.to_string(),
            file: def.file.to_string(),
            revision: None,
            alias: Some(def),
        }
    }

    /// Default model id: the artifact's file stem
    pub fn default_id(&self) -> SwapResult<String> {
        derive_id(&self.file)
    }
}

/// Parse a model spec: an alias, `REPO:FILE`, a hub resolve URL, or a
/// bare repository that belongs to an alias.
pub fn parse_model_spec(input: &str, registry: &AliasRegistry) -> SwapResult<ModelSource> {
    let input = input.trim();

    if let Ok(def) = registry.resolve(input) {
        return Ok(ModelSource::from_alias(def));
    }

    if let Some(rest) = input.strip_prefix(HUB_URL_PREFIX) {
        return parse_hub_url(input, rest);
    }

    if let Some((repo, file)) = input.split_once(':') {
        if !repo.contains('/') {
            // Looks like an alias with an unknown variant
            return Err(SwapError::alias_not_found(input));
        }
        validate_repo(repo)?;
        validate_file(file)?;
        return Ok(ModelSource {
            repo: repo.to_string(),
            file: file.to_string(),
            revision: None,
            alias: registry.find_by_repo(repo).filter(|d| d.file == file),
        });
    }

    if input.contains('/') {
        validate_repo(input)?;
        return registry
            .find_by_repo(input)
            .map(ModelSource::from_alias)
            .ok_or_else(|| {
                SwapError::Config(format!(
                    "'{}' is a repository without a file; use REPO:FILE",
                    input
                ))
            });
    }

    Err(SwapError::alias_not_found(input))
}

/// `https://huggingface.co/<owner>/<repo>/resolve/<rev>/<path>`
fn parse_hub_url(input: &str, rest: &str) -> SwapResult<ModelSource> {
    let malformed = || {
        SwapError::Config(format!(
            "unsupported hub URL '{}', expected {}<owner>/<repo>/resolve/<revision>/<file>",
            input, HUB_URL_PREFIX
        ))
    };

    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    let mut parts = rest.splitn(5, '/');
    let owner = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
    let name = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
    if !matches!(parts.next(), Some("resolve" | "blob")) {
        return Err(malformed());
    }
    let revision = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
    let file = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;

    let repo = format!("{}/{}", owner, name);
    validate_repo(&repo)?;
    let file = urlencoding::decode(file).map_err(|_| malformed())?.into_owned();
    validate_file(&file)?;

    Ok(ModelSource {
        repo,
        file,
        revision: (revision != "main").then(|| revision.to_string()),
        alias: None,
    })
}

fn validate_repo(repo: &str) -> SwapResult<()> {
    let valid_chars = repo
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    let segments: Vec<&str> = repo.split('/').collect();
    if !valid_chars || segments.len() != 2 || segments.iter().any(|s| s.is_empty()) {
        return Err(SwapError::Config(format!(
            "invalid repository id '{}', expected owner/name",
            repo
        )));
    }
    Ok(())
}

fn validate_file(file: &str) -> SwapResult<()> {
    if file.is_empty()
        || file.starts_with('/')
        || file.split('/').any(|seg| seg == ".." || seg.is_empty())
    {
        return Err(SwapError::Config(format!("invalid file name '{}'", file)));
    }
    Ok(())
}

/// Derive a model id from an artifact file name
pub fn derive_id(file: &str) -> SwapResult<String> {
    let base = file.rsplit('/').next().unwrap_or(file);
    let stem = base
        .strip_suffix(".gguf")
        .or_else(|| base.strip_suffix(".GGUF"))
        .unwrap_or(base);
    let id: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    validate_id(id.trim_matches('-'))
}

/// Check an id is safe to use as a record file name
pub fn validate_id(id: &str) -> SwapResult<String> {
    let id = id.trim();
    if id.is_empty() || !id.chars().any(|c| c.is_ascii_alphanumeric()) {
        return Err(SwapError::Config(format!(
            "model id '{}' must contain a letter or digit",
            id
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(SwapError::Config(format!(
            "model id '{}' may only contain letters, digits, '-' and '_'",
            id
        )));
    }
    Ok(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::ArgValue;

    fn registry() -> AliasRegistry {
        AliasRegistry::builtin()
    }

    #[test]
    fn test_parse_alias() {
        let source = parse_model_spec("qwen3:8b", &registry()).unwrap();
        assert_eq!(source.repo, "unsloth/Qwen3-8B-GGUF");
        assert_eq!(source.alias.map(|a| a.alias), Some("qwen3:8b"));
        assert_eq!(source.default_id().unwrap(), "Qwen3-8B-Q4_K_M");
    }

    #[test]
    fn test_parse_repo_file() {
        let source =
            parse_model_spec("someone/Tiny-GGUF:tiny-q8_0.gguf", &registry()).unwrap();
        assert_eq!(source.repo, "someone/Tiny-GGUF");
        assert_eq!(source.file, "tiny-q8_0.gguf");
        assert!(source.alias.is_none());
        assert!(source.revision.is_none());
    }

    #[test]
    fn test_parse_hub_url() {
        let source = parse_model_spec(
            "https://huggingface.co/bartowski/Phi-GGUF/resolve/abc123/sub%20dir/phi-Q4.gguf?download=true",
            &registry(),
        )
        .unwrap();
        assert_eq!(source.repo, "bartowski/Phi-GGUF");
        assert_eq!(source.file, "sub dir/phi-Q4.gguf");
        assert_eq!(source.revision.as_deref(), Some("abc123"));

        let main = parse_model_spec(
            "https://huggingface.co/a/b/resolve/main/m.gguf",
            &registry(),
        )
        .unwrap();
        assert!(main.revision.is_none());
    }

    #[test]
    fn test_parse_bare_repo_of_alias() {
        let source = parse_model_spec("unsloth/phi-4-GGUF", &registry()).unwrap();
        assert_eq!(source.alias.map(|a| a.alias), Some("phi4:14b"));

        let err = parse_model_spec("someone/unknown", &registry()).unwrap_err();
        assert!(matches!(err, SwapError::Config(_)));
    }

    #[test]
    fn test_parse_failures() {
        assert!(matches!(
            parse_model_spec("qwen9:1b", &registry()),
            Err(SwapError::NotFound { kind: "alias", .. })
        ));
        assert!(matches!(
            parse_model_spec("bad repo/x:file.gguf", &registry()),
            Err(SwapError::Config(_))
        ));
        assert!(matches!(
            parse_model_spec("owner/repo:../../etc/passwd", &registry()),
            Err(SwapError::Config(_))
        ));
        assert!(matches!(
            parse_model_spec("https://huggingface.co/owner/repo", &registry()),
            Err(SwapError::Config(_))
        ));
    }

    #[test]
    fn test_derive_id() {
        assert_eq!(derive_id("Qwen3-8B-Q4_K_M.gguf").unwrap(), "Qwen3-8B-Q4_K_M");
        assert_eq!(derive_id("dir/llama.v3.gguf").unwrap(), "llama-v3");
        assert!(derive_id(".gguf").is_err());
    }

    #[test]
    fn test_validate_id() {
        assert_eq!(validate_id("my_model-2").unwrap(), "my_model-2");
        assert!(validate_id("---").is_err());
        assert!(validate_id("../escape").is_err());
        assert!(validate_id("a b").is_err());
    }

    #[test]
    fn test_entry_from_alias_copies_defaults() {
        let source = parse_model_spec("qwen3:4b", &registry()).unwrap();
        let entry = ModelEntry::from_source("q", &source);
        assert_eq!(entry.source_alias.as_deref(), Some("qwen3:4b"));
        assert_eq!(entry.layers, Some(36));
        assert_eq!(entry.args["jinja"], ArgValue::Bool(true));
        assert!(!entry.is_servable());
    }

    #[test]
    fn test_entry_toml_roundtrip() {
        let mut entry = ModelEntry::new("tiny", "someone/Tiny-GGUF", "tiny.gguf");
        entry.args.insert("ctx-size".to_string(), ArgValue::Int(2048));
        entry.artifact_path = Some(PathBuf::from("/models/tiny.gguf"));
        entry.download.status = DownloadStatus::Completed;
        entry.download.validator = Some("abc".to_string());

        let text = toml::to_string_pretty(&entry).unwrap();
        let parsed: ModelEntry = toml::from_str(&text).unwrap();
        assert_eq!(parsed, entry);
        assert!(parsed.is_servable());
    }
}
