// ============================================================================
// Context Storage Core - Field Configuration
// File: crates/ctxstore-core/src/domain/field.rs
// Description: Logical fields, keys, subscripts and read/write policies
// ============================================================================

use std::collections::BTreeSet;
use std::fmt;

use ctxstore_shared::constants::DEFAULT_TURN_SUBSCRIPT;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Logical, subscriptable field of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    Labels,
    Requests,
    Responses,
    Misc,
}

/// Turn fields are integer-keyed and ordered; keyed fields are string-keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Turn,
    Keyed,
}

impl FieldName {
    pub const ALL: [FieldName; 4] = [
        FieldName::Labels,
        FieldName::Requests,
        FieldName::Responses,
        FieldName::Misc,
    ];

    pub const TURN_FIELDS: [FieldName; 3] =
        [FieldName::Labels, FieldName::Requests, FieldName::Responses];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldName::Labels => "labels",
            FieldName::Requests => "requests",
            FieldName::Responses => "responses",
            FieldName::Misc => "misc",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "labels" => Some(FieldName::Labels),
            "requests" => Some(FieldName::Requests),
            "responses" => Some(FieldName::Responses),
            "misc" => Some(FieldName::Misc),
            _ => None,
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldName::Misc => FieldKind::Keyed,
            _ => FieldKind::Turn,
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of one entry inside a field: a turn index or a misc key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldKey {
    Turn(i64),
    Name(String),
}

impl FieldKey {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldKey::Turn(_) => FieldKind::Turn,
            FieldKey::Name(_) => FieldKind::Keyed,
        }
    }

    pub fn as_turn(&self) -> Option<i64> {
        match self {
            FieldKey::Turn(k) => Some(*k),
            FieldKey::Name(_) => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            FieldKey::Turn(_) => None,
            FieldKey::Name(k) => Some(k),
        }
    }

    /// Parse a key read back from a string-only store (hash fields, file documents).
    pub fn parse_for(field: FieldName, raw: &str) -> StorageResult<Self> {
        match field.kind() {
            FieldKind::Turn => raw.parse::<i64>().map(FieldKey::Turn).map_err(|_| {
                StorageError::serialization(format!("invalid turn key '{}' in {}", raw, field))
            }),
            FieldKind::Keyed => Ok(FieldKey::Name(raw.to_string())),
        }
    }
}

impl From<i64> for FieldKey {
    fn from(key: i64) -> Self {
        FieldKey::Turn(key)
    }
}

impl From<&str> for FieldKey {
    fn from(key: &str) -> Self {
        FieldKey::Name(key.to_string())
    }
}

impl From<String> for FieldKey {
    fn from(key: String) -> Self {
        FieldKey::Name(key)
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKey::Turn(k) => write!(f, "{}", k),
            FieldKey::Name(k) => f.write_str(k),
        }
    }
}

/// Which entries of a field are materialised and synchronised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscript {
    All,
    /// The N highest keys.
    Last(usize),
    /// The N lowest keys.
    First(usize),
    Keys(BTreeSet<FieldKey>),
}

impl Subscript {
    /// Negative counts select the first N keys, non-negative counts the last N.
    pub fn from_count(count: i64) -> Self {
        if count < 0 {
            Subscript::First(count.unsigned_abs() as usize)
        } else {
            Subscript::Last(count as usize)
        }
    }

    pub fn keys<K: Into<FieldKey>>(keys: impl IntoIterator<Item = K>) -> Self {
        Subscript::Keys(keys.into_iter().map(Into::into).collect())
    }

    /// Resolve the subscript against a key universe.
    pub fn select<'a>(&self, keys: impl IntoIterator<Item = &'a FieldKey>) -> BTreeSet<FieldKey> {
        let ordered: BTreeSet<&FieldKey> = keys.into_iter().collect();
        match self {
            Subscript::All => ordered.into_iter().cloned().collect(),
            Subscript::Last(n) => ordered.into_iter().rev().take(*n).cloned().collect(),
            Subscript::First(n) => ordered.into_iter().take(*n).cloned().collect(),
            Subscript::Keys(wanted) => ordered
                .into_iter()
                .filter(|k| wanted.contains(*k))
                .cloned()
                .collect(),
        }
    }

    fn check_kind(&self, field: FieldName) -> StorageResult<()> {
        match (field.kind(), self) {
            (FieldKind::Keyed, Subscript::Last(_) | Subscript::First(_)) => {
                Err(StorageError::invalid_config(format!(
                    "field '{}' is not ordered, integer subscripts are not allowed",
                    field
                )))
            }
            (kind, Subscript::Keys(keys)) => match keys.iter().find(|k| k.kind() != kind) {
                Some(bad) => Err(StorageError::invalid_config(format!(
                    "key '{}' does not match the key type of field '{}'",
                    bad, field
                ))),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPolicy {
    Read,
    Ignore,
}

impl ReadPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPolicy::Read => "read",
            ReadPolicy::Ignore => "ignore",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "read" => Some(ReadPolicy::Read),
            "ignore" => Some(ReadPolicy::Ignore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    Ignore,
    /// Write every selected key.
    Update,
    /// Write selected keys whose content hash changed since they were read.
    HashUpdate,
    /// Write a key only if it has never been stored.
    UpdateOnce,
    /// Write selected keys that storage does not know yet.
    Append,
}

impl WritePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            WritePolicy::Ignore => "ignore",
            WritePolicy::Update => "update",
            WritePolicy::HashUpdate => "hash_update",
            WritePolicy::UpdateOnce => "update_once",
            WritePolicy::Append => "append",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ignore" => Some(WritePolicy::Ignore),
            "update" => Some(WritePolicy::Update),
            "hash_update" => Some(WritePolicy::HashUpdate),
            "update_once" => Some(WritePolicy::UpdateOnce),
            "append" => Some(WritePolicy::Append),
            _ => None,
        }
    }
}

/// Declarative policy for one logical field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldConfig {
    name: FieldName,
    pub subscript: Subscript,
    pub read: ReadPolicy,
    pub write: WritePolicy,
}

impl FieldConfig {
    /// Default policy: turn fields keep the last 3 turns and append,
    /// misc keeps everything and writes on content change.
    pub fn new(name: FieldName) -> Self {
        match name.kind() {
            FieldKind::Turn => Self {
                name,
                subscript: Subscript::from_count(DEFAULT_TURN_SUBSCRIPT),
                read: ReadPolicy::Read,
                write: WritePolicy::Append,
            },
            FieldKind::Keyed => Self {
                name,
                subscript: Subscript::All,
                read: ReadPolicy::Read,
                write: WritePolicy::HashUpdate,
            },
        }
    }

    pub fn name(&self) -> FieldName {
        self.name
    }

    pub fn with_subscript(mut self, subscript: Subscript) -> StorageResult<Self> {
        subscript.check_kind(self.name)?;
        self.subscript = subscript;
        Ok(self)
    }

    pub fn with_read(mut self, read: ReadPolicy) -> Self {
        self.read = read;
        self
    }

    pub fn with_write(mut self, write: WritePolicy) -> Self {
        self.write = write;
        self
    }

    pub fn validate(&self) -> StorageResult<()> {
        self.subscript.check_kind(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn_keys(keys: &[i64]) -> Vec<FieldKey> {
        keys.iter().map(|k| FieldKey::Turn(*k)).collect()
    }

    #[test]
    fn test_subscript_sign_convention() {
        assert_eq!(Subscript::from_count(3), Subscript::Last(3));
        assert_eq!(Subscript::from_count(-2), Subscript::First(2));
        assert_eq!(Subscript::from_count(0), Subscript::Last(0));
    }

    #[test]
    fn test_select_orders_numerically() {
        let keys = turn_keys(&[10, 2, 9, 1, 100]);

        let last = Subscript::Last(2).select(&keys);
        assert_eq!(last, turn_keys(&[10, 100]).into_iter().collect());

        let first = Subscript::First(2).select(&keys);
        assert_eq!(first, turn_keys(&[1, 2]).into_iter().collect());

        let all = Subscript::All.select(&keys);
        assert_eq!(all.len(), 5);

        let explicit = Subscript::keys([2i64, 3]).select(&keys);
        assert_eq!(explicit, turn_keys(&[2]).into_iter().collect());
    }

    #[test]
    fn test_select_more_than_available() {
        let keys = turn_keys(&[0, 1]);
        assert_eq!(Subscript::Last(5).select(&keys).len(), 2);
        assert!(Subscript::Last(0).select(&keys).is_empty());
    }

    #[test]
    fn test_subscript_kind_must_match_field() {
        let misc = FieldConfig::new(FieldName::Misc);
        assert!(misc.clone().with_subscript(Subscript::Last(2)).is_err());
        assert!(misc.clone().with_subscript(Subscript::keys([1i64])).is_err());
        assert!(misc.with_subscript(Subscript::keys(["lang"])).is_ok());

        let requests = FieldConfig::new(FieldName::Requests);
        assert!(requests.clone().with_subscript(Subscript::keys(["x"])).is_err());
        assert!(requests.with_subscript(Subscript::First(1)).is_ok());
    }

    #[test]
    fn test_defaults() {
        let labels = FieldConfig::new(FieldName::Labels);
        assert_eq!(labels.subscript, Subscript::Last(3));
        assert_eq!(labels.write, WritePolicy::Append);

        let misc = FieldConfig::new(FieldName::Misc);
        assert_eq!(misc.subscript, Subscript::All);
        assert_eq!(misc.write, WritePolicy::HashUpdate);
    }

    #[test]
    fn test_names_round_trip() {
        for field in FieldName::ALL {
            assert_eq!(FieldName::from_str(field.as_str()), Some(field));
        }
        assert_eq!(FieldName::from_str("history"), None);
        assert_eq!(WritePolicy::from_str("hash_update"), Some(WritePolicy::HashUpdate));
        assert_eq!(ReadPolicy::from_str("skip"), None);
    }

    #[test]
    fn test_parse_key_for_field() {
        assert_eq!(FieldKey::parse_for(FieldName::Requests, "12").unwrap(), FieldKey::Turn(12));
        assert!(FieldKey::parse_for(FieldName::Labels, "abc").is_err());
        assert_eq!(
            FieldKey::parse_for(FieldName::Misc, "12").unwrap(),
            FieldKey::Name("12".into())
        );
    }
}
