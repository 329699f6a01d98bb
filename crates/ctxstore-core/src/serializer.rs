//! Value codec and content hashing

use std::fmt::Debug;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{StorageError, StorageResult};

/// Bidirectional codec between context values and stored bytes.
///
/// Implementations must round-trip and must be deterministic, since
/// content hashes are computed over the encoded bytes.
pub trait Serializer: Send + Sync + Debug {
    fn encode(&self, value: &Value) -> StorageResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> StorageResult<Value>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, value: &Value) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(&canonical(value)).map_err(StorageError::serialization)
    }

    fn decode(&self, bytes: &[u8]) -> StorageResult<Value> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(bytes).map_err(StorageError::serialization)
    }
}

/// Copy of `value` with object keys sorted at every level, so encoding does
/// not depend on insertion order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// SHA-256 of encoded bytes, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
