//! Built-in model aliases
//!
//! Maps short names such as `qwen3:8b` to a hub repository and GGUF file.
//! The table is compiled in and never mutated, so resolution is a pure
//! function of the binary version.

use crate::args::{self, ArgMap};
use crate::error::{SwapError, SwapResult};

/// A single alias definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasDefinition {
    pub alias: &'static str,
    pub repo: &'static str,
    pub file: &'static str,
    /// Total transformer layers, used as the offload clamp
    pub layers: Option<u32>,
    default_args: &'static [(&'static str, &'static str)],
}

impl AliasDefinition {
    /// Default arguments copied into a model created from this alias
    pub fn default_args(&self) -> ArgMap {
        self.default_args
            .iter()
            .filter_map(|(key, value)| {
                args::parse_value(key, value)
                    .ok()
                    .map(|v| (key.to_string(), v))
            })
            .collect()
    }
}

const fn def(
    alias: &'static str,
    repo: &'static str,
    file: &'static str,
    layers: u32,
    default_args: &'static [(&'static str, &'static str)],
) -> AliasDefinition {
    AliasDefinition {
        alias,
        repo,
        file,
        layers: Some(layers),
        default_args,
    }
}

// Kept sorted by alias; `test_table_sorted_and_unique` enforces it.
static BUILTIN: &[AliasDefinition] = &[
    def(
        "deepseek-r1:8b",
        "unsloth/DeepSeek-R1-0528-Qwen3-8B-GGUF",
        "DeepSeek-R1-0528-Qwen3-8B-Q4_K_M.gguf",
        36,
        &[("ctx-size", "16384"), ("temp", "0.6")],
    ),
    def(
        "gemma3:12b",
        "unsloth/gemma-3-12b-it-GGUF",
        "gemma-3-12b-it-Q4_K_M.gguf",
        48,
        &[("ctx-size", "8192")],
    ),
    def(
        "gemma3:4b",
        "unsloth/gemma-3-4b-it-GGUF",
        "gemma-3-4b-it-Q4_K_M.gguf",
        34,
        &[("ctx-size", "8192")],
    ),
    def(
        "llama3.1:8b",
        "bartowski/Meta-Llama-3.1-8B-Instruct-GGUF",
        "Meta-Llama-3.1-8B-Instruct-Q4_K_M.gguf",
        32,
        &[("ctx-size", "8192")],
    ),
    def(
        "llama3.2:3b",
        "bartowski/Llama-3.2-3B-Instruct-GGUF",
        "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
        28,
        &[("ctx-size", "8192")],
    ),
    def(
        "mistral:7b",
        "bartowski/Mistral-7B-Instruct-v0.3-GGUF",
        "Mistral-7B-Instruct-v0.3-Q4_K_M.gguf",
        32,
        &[("ctx-size", "8192")],
    ),
    def(
        "phi4:14b",
        "unsloth/phi-4-GGUF",
        "phi-4-Q4_K_M.gguf",
        40,
        &[("ctx-size", "16384")],
    ),
    def(
        "qwen2.5-coder:7b",
        "Qwen/Qwen2.5-Coder-7B-Instruct-GGUF",
        "qwen2.5-coder-7b-instruct-q4_k_m.gguf",
        28,
        &[("ctx-size", "16384")],
    ),
    def(
        "qwen3:32b",
        "Qwen/Qwen3-32B-GGUF",
        "Qwen3-32B-Q4_K_M.gguf",
        64,
        &[("ctx-size", "16384"), ("jinja", "true")],
    ),
    def(
        "qwen3:4b",
        "unsloth/Qwen3-4B-GGUF",
        "Qwen3-4B-Q4_K_M.gguf",
        36,
        &[("ctx-size", "16384"), ("jinja", "true")],
    ),
    def(
        "qwen3:8b",
        "unsloth/Qwen3-8B-GGUF",
        "Qwen3-8B-Q4_K_M.gguf",
        36,
        &[("ctx-size", "16384"), ("jinja", "true")],
    ),
];

/// Read-only alias table
#[derive(Debug, Clone, Copy)]
pub struct AliasRegistry {
    entries: &'static [AliasDefinition],
}

impl Default for AliasRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl AliasRegistry {
    pub fn builtin() -> Self {
        Self { entries: BUILTIN }
    }

    /// Resolve an alias to its definition
    pub fn resolve(&self, alias: &str) -> SwapResult<&'static AliasDefinition> {
        self.entries
            .binary_search_by(|def| def.alias.cmp(alias))
            .map(|idx| &self.entries[idx])
            .map_err(|_| SwapError::alias_not_found(alias))
    }

    /// Find the alias whose repository equals `repo`
    pub fn find_by_repo(&self, repo: &str) -> Option<&'static AliasDefinition> {
        self.entries.iter().find(|def| def.repo == repo)
    }

    /// All aliases, ordered lexicographically by alias
    pub fn list(&self) -> &'static [AliasDefinition] {
        self.entries
    }
}
