// ============================================================================
// Context Storage Infrastructure - Blob Document
// File: crates/ctxstore-infrastructure/src/blob/document.rs
// Description: Single in-memory document holding every stored context
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use ctxstore_core::domain::{FieldKey, FieldName, MainInfo};
use ctxstore_core::error::{StorageError, StorageResult};
use ctxstore_core::repositories::FieldItems;

/// Opaque bytes, stored as base64 text when the document is written as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Blob)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MainRecord {
    current_turn_id: i64,
    created_at: i64,
    updated_at: i64,
    framework_data: Blob,
}

/// One row of the turns table: a column per turn field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TurnRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    labels: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    requests: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    responses: Option<Blob>,
}

impl TurnRecord {
    fn column(&self, field: FieldName) -> Option<&Blob> {
        match field {
            FieldName::Labels => self.labels.as_ref(),
            FieldName::Requests => self.requests.as_ref(),
            FieldName::Responses => self.responses.as_ref(),
            FieldName::Misc => None,
        }
    }

    fn column_mut(&mut self, field: FieldName) -> Option<&mut Option<Blob>> {
        match field {
            FieldName::Labels => Some(&mut self.labels),
            FieldName::Requests => Some(&mut self.requests),
            FieldName::Responses => Some(&mut self.responses),
            FieldName::Misc => None,
        }
    }

    fn is_empty(&self) -> bool {
        self.labels.is_none() && self.requests.is_none() && self.responses.is_none()
    }
}

/// Every context of a file-blob store, in the relational "main / turns / misc" shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDocument {
    #[serde(default)]
    main: BTreeMap<String, MainRecord>,
    #[serde(default)]
    turns: BTreeMap<String, BTreeMap<i64, TurnRecord>>,
    #[serde(default)]
    misc: BTreeMap<String, BTreeMap<String, Blob>>,
}

impl BlobDocument {
    pub fn load_main(&self, id: &str) -> Option<MainInfo> {
        self.main.get(id).map(|record| MainInfo {
            current_turn_id: record.current_turn_id,
            created_at: record.created_at,
            updated_at: record.updated_at,
            framework_data: record.framework_data.0.clone(),
        })
    }

    /// Upsert; `created_at` of an existing record is kept.
    pub fn update_main(&mut self, id: &str, info: &MainInfo) {
        let created_at = self
            .main
            .get(id)
            .map_or(info.created_at, |record| record.created_at);
        self.main.insert(
            id.to_string(),
            MainRecord {
                current_turn_id: info.current_turn_id,
                created_at,
                updated_at: info.updated_at,
                framework_data: Blob(info.framework_data.clone()),
            },
        );
    }

    pub fn delete_main(&mut self, id: &str) -> bool {
        self.main.remove(id).is_some()
    }

    /// All stored `(key, bytes)` of a field, ascending by key.
    fn entries(&self, id: &str, field: FieldName) -> Vec<(FieldKey, &Blob)> {
        match field {
            FieldName::Misc => self
                .misc
                .get(id)
                .map(|items| {
                    items
                        .iter()
                        .map(|(k, v)| (FieldKey::Name(k.clone()), v))
                        .collect()
                })
                .unwrap_or_default(),
            turn_field => self
                .turns
                .get(id)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|(k, row)| row.column(turn_field).map(|v| (FieldKey::Turn(*k), v)))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn field_latest(&self, id: &str, field: FieldName, limit: Option<usize>) -> FieldItems {
        self.entries(id, field)
            .into_iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(k, v)| (k, v.0.clone()))
            .collect()
    }

    pub fn field_keys(&self, id: &str, field: FieldName) -> BTreeSet<FieldKey> {
        self.entries(id, field).into_iter().map(|(k, _)| k).collect()
    }

    pub fn field_items(&self, id: &str, field: FieldName, keys: &BTreeSet<FieldKey>) -> FieldItems {
        self.entries(id, field)
            .into_iter()
            .filter(|(k, _)| keys.contains(k))
            .map(|(k, v)| (k, v.0.clone()))
            .collect()
    }

    pub fn update_items(
        &mut self,
        id: &str,
        field: FieldName,
        items: &[(FieldKey, Option<Vec<u8>>)],
    ) -> StorageResult<()> {
        if let Some((key, _)) = items.iter().find(|(k, _)| k.kind() != field.kind()) {
            return Err(StorageError::serialization(format!(
                "key '{}' does not belong to field '{}'",
                key, field
            )));
        }

        if field == FieldName::Misc {
            let entries = self.misc.entry(id.to_string()).or_default();
            for (key, value) in items {
                let FieldKey::Name(name) = key else { continue };
                match value {
                    Some(bytes) => {
                        entries.insert(name.clone(), Blob(bytes.clone()));
                    }
                    None => {
                        entries.remove(name);
                    }
                }
            }
            if entries.is_empty() {
                self.misc.remove(id);
            }
            return Ok(());
        }

        let rows = self.turns.entry(id.to_string()).or_default();
        for (key, value) in items {
            let FieldKey::Turn(turn) = key else { continue };
            let row = rows.entry(*turn).or_default();
            if let Some(column) = row.column_mut(field) {
                *column = value.clone().map(Blob);
            }
            if row.is_empty() {
                rows.remove(turn);
            }
        }
        if rows.is_empty() {
            self.turns.remove(id);
        }
        Ok(())
    }

    pub fn delete_context(&mut self, id: &str) {
        self.main.remove(id);
        self.turns.remove(id);
        self.misc.remove(id);
    }

    pub fn clear(&mut self) {
        self.main.clear();
        self.turns.clear();
        self.misc.clear();
    }

    pub fn len(&self) -> usize {
        self.main.len()
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty() && self.turns.is_empty() && self.misc.is_empty()
    }
}
