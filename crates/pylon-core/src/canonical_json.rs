//! Canonical JSON serialization for deterministic status hashing.
//!
//! The resync protocol decides whether a source's view of a status is stale
//! by comparing hashes, so two JSON documents that differ only in object key
//! order must serialize to identical bytes. Canonical JSON has:
//!
//! - Object keys sorted lexicographically (UTF-8 byte order)
//! - No whitespace
//! - UTF-8 output
//! - `serde_json`'s stable number formatting (integers verbatim, floats via
//!   shortest-roundtrip)
//!
//! Statuses are opaque JSON reported by external agents, so the serializer
//! accepts whatever valid JSON they produce; only hash *equality* matters,
//! and that is decided within a single broker deployment.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur during canonical JSON serialization.
#[derive(Debug, Error)]
pub enum CanonicalJsonError {
    /// Serde JSON conversion failed.
    #[error("serde_json error: {0}")]
    Serde(#[from] serde_json::Error),

    /// UTF-8 encoding error (should never happen with valid JSON).
    #[error("UTF-8 encoding error")]
    Utf8Error,
}

/// Serialize `value` into canonical JSON bytes.
///
/// # Errors
///
/// Returns `CanonicalJsonError::Serde` if the value does not convert to a
/// JSON tree.
#[must_use = "canonical bytes should be used for hashing"]
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalJsonError> {
    let v = serde_json::to_value(value)?;
    let mut out = Vec::<u8>::new();
    write_value(&v, &mut out)?;
    Ok(out)
}

/// Same as `to_canonical_bytes`, but returns a UTF-8 String.
///
/// # Errors
///
/// Returns `CanonicalJsonError::Serde` if serialization fails, or
/// `CanonicalJsonError::Utf8Error` if UTF-8 conversion fails.
#[must_use = "canonical string should be used for hashing"]
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, CanonicalJsonError> {
    let bytes = to_canonical_bytes(value)?;
    String::from_utf8(bytes).map_err(|_| CanonicalJsonError::Utf8Error)
}

fn write_value(v: &Value, out: &mut Vec<u8>) -> Result<(), CanonicalJsonError> {
    match v {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            // serde_json formats i64/u64 verbatim and floats with the
            // shortest representation that round-trips, both stable.
            serde_json::to_writer(&mut *out, n)?;
        }
        Value::String(s) => {
            // Writes JSON string with quotes + escaping, no whitespace.
            serde_json::to_writer(&mut *out, s)?;
        }
        Value::Array(arr) => {
            out.push(b'[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => write_object(map, out)?,
    }
    Ok(())
}

fn write_object(map: &Map<String, Value>, out: &mut Vec<u8>) -> Result<(), CanonicalJsonError> {
    out.push(b'{');

    // Collect keys and sort deterministically by UTF-8 byte order.
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    for (i, k) in keys.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }

        serde_json::to_writer(&mut *out, *k)?;
        out.push(b':');

        // Key is guaranteed to exist since we got it from map.keys()
        if let Some(val) = map.get(*k) {
            write_value(val, out)?;
        }
    }

    out.push(b'}');
    Ok(())
}
