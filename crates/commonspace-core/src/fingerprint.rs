//! Stage fingerprints: canonical JSON of a stage's inputs and parameters, hashed.
//!
//! Canonicalization follows RFC 8785 closely enough for cache keys:
//! - object keys ordered by UTF-16 code units
//! - integer-valued floats written as integers; NaN/Infinity rejected
//! - compact output

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cas::Digest;
use crate::error::{PipelineError, Result};

/// Bumped whenever stage semantics change so that old cache entries stop matching.
pub const ENGINE_VERSION: &str = concat!("commonspace-", env!("CARGO_PKG_VERSION"), "/1");

fn sort_keys_utf16(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.to_string(), sort_keys_utf16(v));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys_utf16).collect()),
        other => other.clone(),
    }
}

fn normalize_value(value: &Value) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut normalized = serde_json::Map::new();
            for (k, v) in map {
                normalized.insert(k.clone(), normalize_value(v)?);
            }
            Ok(Value::Object(normalized))
        }
        Value::Array(arr) => Ok(Value::Array(
            arr.iter().map(normalize_value).collect::<Result<Vec<_>>>()?,
        )),
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => {
            let Some(f) = n.as_f64() else {
                return Ok(Value::Number(n.clone()));
            };
            if !f.is_finite() {
                return Err(PipelineError::Input(
                    "NaN/Infinity not permitted in stage parameters".to_string(),
                ));
            }
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                Ok(Value::Number(serde_json::Number::from(f as i64)))
            } else {
                Ok(Value::Number(n.clone()))
            }
        }
        other => Ok(other.clone()),
    }
}

/// Canonical form: normalize numbers, sort keys, compact JSON.
pub fn canonical_json(value: &Value) -> Result<String> {
    let normalized = normalize_value(value)?;
    Ok(serde_json::to_string(&sort_keys_utf16(&normalized))?)
}

/// Everything a stage execution's output depends on.
#[derive(Debug, Clone, Serialize)]
pub struct FingerprintInput<'a> {
    pub engine_version: &'a str,
    pub stage: &'a str,
    /// Round of the brain fixed-point loop; `None` outside it.
    pub iteration: Option<u32>,
    /// `None` for stages that run once over the whole batch.
    pub subject: Option<usize>,
    /// Content digests of the input files, in the order the stage consumes them.
    pub inputs: &'a [Digest],
    pub params: &'a Value,
}

/// Deterministic cache key of one stage execution.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageFingerprint(Digest);

impl StageFingerprint {
    pub fn compute(input: &FingerprintInput<'_>) -> Result<Self> {
        let value = serde_json::to_value(input)?;
        let canonical = canonical_json(&value)?;
        Ok(Self(Digest::compute(canonical.as_bytes())))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl fmt::Display for StageFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for StageFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StageFingerprint({})", self.0.short())
    }
}
