//! Minimal GGUF header reader
//!
//! Only reads the metadata key/value section far enough to find the
//! transformer block count. Anything unexpected yields `None`.

use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

const MAGIC: &[u8; 4] = b"GGUF";
const MAX_KV_PAIRS: u64 = 1 << 20;
const MAX_KEY_LEN: u64 = 64 * 1024;

// Metadata value type tags
const T_U8: u32 = 0;
const T_I8: u32 = 1;
const T_U16: u32 = 2;
const T_I16: u32 = 3;
const T_U32: u32 = 4;
const T_I32: u32 = 5;
const T_F32: u32 = 6;
const T_BOOL: u32 = 7;
const T_STRING: u32 = 8;
const T_ARRAY: u32 = 9;
const T_U64: u32 = 10;
const T_I64: u32 = 11;
const T_F64: u32 = 12;

#[derive(Debug)]
enum Value {
    Int(u64),
    Text(String),
    Other,
}

/// Read `<architecture>.block_count` from a GGUF file
pub async fn read_block_count(path: &Path) -> Option<u32> {
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!(path = ?path, error = %e, "Cannot open artifact for header read");
            return None;
        }
    };

    let mut reader = BufReader::new(file);
    let result = block_count(&mut reader).await;
    if result.is_none() {
        tracing::debug!(path = ?path, "No layer count found in GGUF header");
    }
    result
}

async fn block_count<R: AsyncRead + Unpin>(reader: &mut R) -> Option<u32> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await.ok()?;
    if &magic != MAGIC {
        return None;
    }

    // Version 1 used 32-bit lengths and is not worth supporting
    let version = reader.read_u32_le().await.ok()?;
    if version < 2 {
        return None;
    }

    let _tensor_count = reader.read_u64_le().await.ok()?;
    let kv_count = reader.read_u64_le().await.ok()?;
    if kv_count > MAX_KV_PAIRS {
        return None;
    }

    let mut arch: Option<String> = None;
    let mut counts: Vec<(String, u64)> = Vec::new();

    for _ in 0..kv_count {
        let key = read_string(reader, MAX_KEY_LEN).await?;
        let ty = reader.read_u32_le().await.ok()?;
        let value = read_value(reader, ty).await?;

        match value {
            Value::Text(name) if key == "general.architecture" => arch = Some(name),
            Value::Int(n) if key.ends_with(".block_count") => counts.push((key, n)),
            _ => {}
        }

        if let Some(arch) = &arch {
            let wanted = format!("{}.block_count", arch);
            if let Some((_, n)) = counts.iter().find(|(k, _)| *k == wanted) {
                return u32::try_from(*n).ok().filter(|n| *n > 0);
            }
        }
    }
    None
}

async fn read_string<R: AsyncRead + Unpin>(reader: &mut R, limit: u64) -> Option<String> {
    let len = reader.read_u64_le().await.ok()?;
    if len > limit {
        return None;
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await.ok()?;
    String::from_utf8(buf).ok()
}

async fn skip<R: AsyncRead + Unpin>(reader: &mut R, n: u64) -> Option<()> {
    let copied = tokio::io::copy(&mut reader.take(n), &mut tokio::io::sink())
        .await
        .ok()?;
    (copied == n).then_some(())
}

fn scalar_width(ty: u32) -> Option<u64> {
    match ty {
        T_U8 | T_I8 | T_BOOL => Some(1),
        T_U16 | T_I16 => Some(2),
        T_U32 | T_I32 | T_F32 => Some(4),
        T_U64 | T_I64 | T_F64 => Some(8),
        _ => None,
    }
}

async fn read_value<R: AsyncRead + Unpin>(reader: &mut R, ty: u32) -> Option<Value> {
    match ty {
        T_U32 => Some(Value::Int(u64::from(reader.read_u32_le().await.ok()?))),
        T_I32 => {
            let v = reader.read_i32_le().await.ok()?;
            Some(u64::try_from(v).map(Value::Int).unwrap_or(Value::Other))
        }
        T_U64 => Some(Value::Int(reader.read_u64_le().await.ok()?)),
        T_I64 => {
            let v = reader.read_i64_le().await.ok()?;
            Some(u64::try_from(v).map(Value::Int).unwrap_or(Value::Other))
        }
        T_STRING => {
            let len = reader.read_u64_le().await.ok()?;
            if len <= MAX_KEY_LEN {
                let mut buf = vec![0u8; len as usize];
                reader.read_exact(&mut buf).await.ok()?;
                Some(String::from_utf8(buf).map(Value::Text).unwrap_or(Value::Other))
            } else {
                skip(reader, len).await?;
                Some(Value::Other)
            }
        }
        T_ARRAY => {
            let elem = reader.read_u32_le().await.ok()?;
            let count = reader.read_u64_le().await.ok()?;
            if let Some(width) = scalar_width(elem) {
                skip(reader, width.checked_mul(count)?).await?;
            } else if elem == T_STRING {
                for _ in 0..count {
                    let len = reader.read_u64_le().await.ok()?;
                    skip(reader, len).await?;
                }
            } else {
                // Nested arrays never occur in practice
                return None;
            }
            Some(Value::Other)
        }
        other => {
            skip(reader, scalar_width(other)?).await?;
            Some(Value::Other)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Writer for synthetic headers used across tests

    pub enum Kv<'a> {
        Str(&'a str, &'a str),
        U32(&'a str, u32),
        F32(&'a str, f32),
        StrArray(&'a str, &'a [&'a str]),
    }

    fn push_str(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    pub fn header(kvs: &[Kv<'_>]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"GGUF");
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&(kvs.len() as u64).to_le_bytes());
        for kv in kvs {
            match kv {
                Kv::Str(k, v) => {
                    push_str(&mut buf, k);
                    buf.extend_from_slice(&8u32.to_le_bytes());
                    push_str(&mut buf, v);
                }
                Kv::U32(k, v) => {
                    push_str(&mut buf, k);
                    buf.extend_from_slice(&4u32.to_le_bytes());
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                Kv::F32(k, v) => {
                    push_str(&mut buf, k);
                    buf.extend_from_slice(&6u32.to_le_bytes());
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                Kv::StrArray(k, items) => {
                    push_str(&mut buf, k);
                    buf.extend_from_slice(&9u32.to_le_bytes());
                    buf.extend_from_slice(&8u32.to_le_bytes());
                    buf.extend_from_slice(&(items.len() as u64).to_le_bytes());
                    for item in *items {
                        push_str(&mut buf, item);
                    }
                }
            }
        }
        buf
    }
}
