//! Typed runtime arguments for the inference server
//!
//! Arguments are stored as a sorted map of flag name (without the leading
//! `--`) to a value from a small closed set of types. Known llama-server
//! flags carry a declared type and are validated when layers are merged,
//! so a malformed value is rejected here instead of by the server.

use crate::error::{SwapError, SwapResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single argument value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::Int(i) => write!(f, "{}", i),
            ArgValue::Float(x) => write!(f, "{}", x),
            ArgValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl ArgValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Argument map, ordered by flag name so rendering is deterministic
pub type ArgMap = BTreeMap<String, ArgValue>;

/// Declared type of a known flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Str,
    Int,
    Float,
    Bool,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str => write!(f, "string"),
            Self::Int => write!(f, "integer"),
            Self::Float => write!(f, "float"),
            Self::Bool => write!(f, "boolean"),
        }
    }
}

/// Flag carrying the number of layers offloaded to the GPU
pub const GPU_LAYERS_KEY: &str = "n-gpu-layers";
/// Flag carrying a model's explicit listen port
pub const PORT_KEY: &str = "port";

const DECLARED: &[(&str, ArgKind)] = &[
    ("alias", ArgKind::Str),
    ("batch-size", ArgKind::Int),
    ("cache-type-k", ArgKind::Str),
    ("cache-type-v", ArgKind::Str),
    ("chat-template", ArgKind::Str),
    ("cont-batching", ArgKind::Bool),
    ("ctx-size", ArgKind::Int),
    ("flash-attn", ArgKind::Bool),
    ("host", ArgKind::Str),
    ("jinja", ArgKind::Bool),
    ("min-p", ArgKind::Float),
    ("mlock", ArgKind::Bool),
    (GPU_LAYERS_KEY, ArgKind::Int),
    ("no-mmap", ArgKind::Bool),
    ("parallel", ArgKind::Int),
    (PORT_KEY, ArgKind::Int),
    ("repeat-penalty", ArgKind::Float),
    ("temp", ArgKind::Float),
    ("threads", ArgKind::Int),
    ("top-k", ArgKind::Int),
    ("top-p", ArgKind::Float),
    ("ubatch-size", ArgKind::Int),
];

/// Lowest-precedence layer, below the global defaults
pub fn builtin_defaults() -> ArgMap {
    let mut args = ArgMap::new();
    args.insert("ctx-size".to_string(), ArgValue::Int(4096));
    args
}

pub fn declared_kind(key: &str) -> Option<ArgKind> {
    DECLARED
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, kind)| *kind)
}

/// Normalize and validate a flag name (`--ctx-size` and `ctx-size` are equal)
pub fn normalize_key(raw: &str) -> SwapResult<String> {
    let key = raw.trim().trim_start_matches('-');
    if key.is_empty() {
        return Err(SwapError::Config("argument key cannot be empty".to_string()));
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(SwapError::Config(format!(
            "invalid argument key format: {}",
            raw
        )));
    }
    Ok(key.to_string())
}

/// Parse a `KEY=VALUE` pair from the command line
pub fn parse_assignment(raw: &str) -> SwapResult<(String, ArgValue)> {
    let (key, value) = raw.split_once('=').ok_or_else(|| {
        SwapError::Config(format!("argument '{}' is not in KEY=VALUE format", raw))
    })?;
    let key = normalize_key(key)?;
    let value = parse_value(&key, value.trim())?;
    Ok((key, value))
}

/// Parse several `KEY=VALUE` pairs into a map
pub fn parse_assignments<S: AsRef<str>>(raw: &[S]) -> SwapResult<ArgMap> {
    raw.iter()
        .map(|pair| parse_assignment(pair.as_ref()))
        .collect()
}

/// Parse a textual value for a flag: declared flags are coerced to their
/// type, undeclared ones are inferred (bool, then int, then float, then string)
pub fn parse_value(key: &str, text: &str) -> SwapResult<ArgValue> {
    match declared_kind(key) {
        Some(kind) => coerce_text(key, text, kind),
        None => Ok(infer(text)),
    }
}

fn infer(text: &str) -> ArgValue {
    if let Ok(b) = text.parse::<bool>() {
        ArgValue::Bool(b)
    } else if let Ok(i) = text.parse::<i64>() {
        ArgValue::Int(i)
    } else if let Ok(x) = text.parse::<f64>() {
        ArgValue::Float(x)
    } else {
        ArgValue::Str(text.to_string())
    }
}

fn coerce_text(key: &str, text: &str, kind: ArgKind) -> SwapResult<ArgValue> {
    let value = match kind {
        ArgKind::Str => Some(ArgValue::Str(text.to_string())),
        ArgKind::Int => text.parse::<i64>().ok().map(ArgValue::Int),
        ArgKind::Float => text.parse::<f64>().ok().map(ArgValue::Float),
        ArgKind::Bool => text.parse::<bool>().ok().map(ArgValue::Bool),
    };
    value.ok_or_else(|| {
        SwapError::Config(format!(
            "argument '{}' expects a {} value, got '{}'",
            key, kind, text
        ))
    })
}

/// Check a stored value against the flag's declared type.
///
/// Records edited by hand may hold numbers as strings; those are coerced.
/// Integers are accepted where a float is declared.
pub fn validate(key: &str, value: &ArgValue) -> SwapResult<ArgValue> {
    let Some(kind) = declared_kind(key) else {
        return Ok(value.clone());
    };
    match (kind, value) {
        (ArgKind::Str, ArgValue::Str(_))
        | (ArgKind::Int, ArgValue::Int(_))
        | (ArgKind::Float, ArgValue::Float(_))
        | (ArgKind::Bool, ArgValue::Bool(_)) => Ok(value.clone()),
        (ArgKind::Float, ArgValue::Int(i)) => Ok(ArgValue::Float(*i as f64)),
        (_, ArgValue::Str(text)) => coerce_text(key, text, kind),
        (ArgKind::Str, other) => Ok(ArgValue::Str(other.to_string())),
        (_, other) => Err(SwapError::Config(format!(
            "argument '{}' expects a {} value, got '{}'",
            key, kind, other
        ))),
    }
}

/// Merge argument layers, lowest precedence first. Later layers win per key
/// and every resulting value is validated against its declared type.
pub fn merge(layers: &[&ArgMap]) -> SwapResult<ArgMap> {
    let mut merged = ArgMap::new();
    for layer in layers {
        for (key, value) in layer.iter() {
            merged.insert(key.clone(), validate(key, value)?);
        }
    }
    Ok(merged)
}

/// Render arguments as an ordered command-line list.
/// `true` booleans become bare flags, `false` booleans are omitted.
pub fn render(args: &ArgMap) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len() * 2);
    for (key, value) in args {
        match value {
            ArgValue::Bool(true) => out.push(format!("--{}", key)),
            ArgValue::Bool(false) => {}
            other => {
                out.push(format!("--{}", key));
                out.push(other.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, ArgValue)]) -> ArgMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_parse_declared_int() {
        let (key, value) = parse_assignment("ctx-size=8192").unwrap();
        assert_eq!(key, "ctx-size");
        assert_eq!(value, ArgValue::Int(8192));
    }

    #[test]
    fn test_parse_strips_leading_dashes() {
        let (key, value) = parse_assignment("--flash-attn=true").unwrap();
        assert_eq!(key, "flash-attn");
        assert_eq!(value, ArgValue::Bool(true));
    }

    #[test]
    fn test_parse_rejects_malformed_declared_value() {
        let err = parse_assignment("ctx-size=large").unwrap_err();
        assert!(matches!(err, SwapError::Config(_)));
        assert!(err.to_string().contains("integer"));
    }

    #[test]
    fn test_parse_rejects_missing_equals() {
        assert!(parse_assignment("ctx-size").is_err());
        assert!(parse_assignment("=5").is_err());
        assert!(parse_assignment("bad key=5").is_err());
    }

    #[test]
    fn test_undeclared_values_are_inferred() {
        assert_eq!(parse_value("rope-scale", "2.5").unwrap(), ArgValue::Float(2.5));
        assert_eq!(parse_value("seed", "42").unwrap(), ArgValue::Int(42));
        assert_eq!(parse_value("verbose", "false").unwrap(), ArgValue::Bool(false));
        assert_eq!(
            parse_value("lora", "/tmp/a.gguf").unwrap(),
            ArgValue::Str("/tmp/a.gguf".to_string())
        );
    }

    #[test]
    fn test_validate_coerces_string_numbers() {
        let value = validate("ctx-size", &ArgValue::Str("4096".to_string())).unwrap();
        assert_eq!(value, ArgValue::Int(4096));
        let value = validate("temp", &ArgValue::Int(1)).unwrap();
        assert_eq!(value, ArgValue::Float(1.0));
        assert!(validate("threads", &ArgValue::Bool(true)).is_err());
    }

    #[test]
    fn test_merge_precedence() {
        let builtin = map(&[("ctx-size", ArgValue::Int(4096))]);
        let global = map(&[
            ("ctx-size", ArgValue::Int(8192)),
            ("threads", ArgValue::Int(4)),
        ]);
        let model = map(&[("threads", ArgValue::Int(8))]);
        let overrides = map(&[("ctx-size", ArgValue::Int(2048))]);

        let merged = merge(&[&builtin, &global, &model, &overrides]).unwrap();
        assert_eq!(merged["ctx-size"], ArgValue::Int(2048));
        assert_eq!(merged["threads"], ArgValue::Int(8));
    }

    #[test]
    fn test_merge_rejects_bad_layer() {
        let model = map(&[("n-gpu-layers", ArgValue::Str("all".to_string()))]);
        assert!(merge(&[&model]).is_err());
    }

    #[test]
    fn test_render_booleans_and_order() {
        let args = map(&[
            ("threads", ArgValue::Int(8)),
            ("flash-attn", ArgValue::Bool(true)),
            ("mlock", ArgValue::Bool(false)),
            ("ctx-size", ArgValue::Int(4096)),
        ]);
        assert_eq!(
            render(&args),
            vec!["--ctx-size", "4096", "--flash-attn", "--threads", "8"]
        );
    }
}
