// ============================================================================
// Context Storage Core - Context Entity
// File: crates/ctxstore-core/src/domain/context.rs
// Description: Per-dialogue state materialised from storage
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::field::{FieldKey, FieldKind, FieldName};
use super::tracking::SyncState;
use crate::error::{StorageError, StorageResult};

/// MAIN record of a context as drivers store it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainInfo {
    pub current_turn_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    /// Serialized framework data.
    pub framework_data: Vec<u8>,
}

/// Full state of one dialogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    pub current_turn_id: i64,
    /// Nanoseconds since the Unix epoch.
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub labels: BTreeMap<i64, Value>,
    #[serde(default)]
    pub requests: BTreeMap<i64, Value>,
    #[serde(default)]
    pub responses: BTreeMap<i64, Value>,
    #[serde(default)]
    pub misc: BTreeMap<String, Value>,
    #[serde(default)]
    pub framework_data: Value,
    #[serde(skip)]
    pub(crate) sync: SyncState,
}

impl Context {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            current_turn_id: 0,
            created_at: 0,
            updated_at: 0,
            labels: BTreeMap::new(),
            requests: BTreeMap::new(),
            responses: BTreeMap::new(),
            misc: BTreeMap::new(),
            framework_data: Value::Null,
            sync: SyncState::default(),
        }
    }

    pub fn with_random_id() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Whether this context has a stored counterpart.
    pub fn is_persisted(&self) -> bool {
        self.sync.stored.is_some()
    }

    /// Start a new turn with the given request.
    pub fn add_request(&mut self, request: Value) -> i64 {
        let turn = self.current_turn_id;
        self.requests.insert(turn, request);
        self.current_turn_id = turn + 1;
        turn
    }

    /// Attach a response to the current turn.
    pub fn add_response(&mut self, response: Value) {
        self.responses.insert(self.last_turn(), response);
    }

    /// Attach a label to the current turn.
    pub fn add_label(&mut self, label: Value) {
        self.labels.insert(self.last_turn(), label);
    }

    pub fn last_request(&self) -> Option<&Value> {
        self.requests.last_key_value().map(|(_, v)| v)
    }

    pub fn last_response(&self) -> Option<&Value> {
        self.responses.last_key_value().map(|(_, v)| v)
    }

    pub fn last_label(&self) -> Option<&Value> {
        self.labels.last_key_value().map(|(_, v)| v)
    }

    pub fn set_misc(&mut self, key: impl Into<String>, value: Value) {
        self.misc.insert(key.into(), value);
    }

    pub fn get_misc(&self, key: &str) -> Option<&Value> {
        self.misc.get(key)
    }

    fn last_turn(&self) -> i64 {
        (self.current_turn_id - 1).max(0)
    }

    fn turn_map(&self, field: FieldName) -> Option<&BTreeMap<i64, Value>> {
        match field {
            FieldName::Labels => Some(&self.labels),
            FieldName::Requests => Some(&self.requests),
            FieldName::Responses => Some(&self.responses),
            FieldName::Misc => None,
        }
    }

    fn turn_map_mut(&mut self, field: FieldName) -> Option<&mut BTreeMap<i64, Value>> {
        match field {
            FieldName::Labels => Some(&mut self.labels),
            FieldName::Requests => Some(&mut self.requests),
            FieldName::Responses => Some(&mut self.responses),
            FieldName::Misc => None,
        }
    }

    /// Keys currently held in memory for a field.
    pub fn field_keys(&self, field: FieldName) -> BTreeSet<FieldKey> {
        match self.turn_map(field) {
            Some(map) => map.keys().map(|k| FieldKey::Turn(*k)).collect(),
            None => self.misc.keys().map(|k| FieldKey::Name(k.clone())).collect(),
        }
    }

    pub fn field_value(&self, field: FieldName, key: &FieldKey) -> Option<&Value> {
        match (self.turn_map(field), key) {
            (Some(map), FieldKey::Turn(k)) => map.get(k),
            (None, FieldKey::Name(k)) => self.misc.get(k),
            _ => None,
        }
    }

    pub fn insert_field(&mut self, field: FieldName, key: FieldKey, value: Value) -> StorageResult<()> {
        match (field.kind(), key) {
            (FieldKind::Turn, FieldKey::Turn(k)) => {
                if let Some(map) = self.turn_map_mut(field) {
                    map.insert(k, value);
                }
                Ok(())
            }
            (FieldKind::Keyed, FieldKey::Name(k)) => {
                self.misc.insert(k, value);
                Ok(())
            }
            (_, key) => Err(StorageError::serialization(format!(
                "key '{}' does not belong to field '{}'",
                key, field
            ))),
        }
    }

    /// Highest turn index present in any turn field.
    pub fn max_turn_key(&self) -> Option<i64> {
        FieldName::TURN_FIELDS
            .iter()
            .filter_map(|f| self.turn_map(*f).and_then(|m| m.keys().next_back().copied()))
            .max()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.current_turn_id == other.current_turn_id
            && self.created_at == other.created_at
            && self.updated_at == other.updated_at
            && self.labels == other.labels
            && self.requests == other.requests
            && self.responses == other.responses
            && self.misc == other.misc
            && self.framework_data == other.framework_data
    }
}

/// Current time in nanoseconds, strictly after `previous`.
pub fn next_timestamp(previous: i64) -> i64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
    now.max(previous.saturating_add(1))
}
