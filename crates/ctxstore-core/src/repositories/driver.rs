//! Storage driver trait (port)
//!
//! Seven primitives every backend implements, plus whole-context and
//! global removal. Drivers are stateless with respect to contexts: every
//! call names the context id it works on.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::domain::{FieldKey, FieldName, MainInfo};
use crate::error::StorageResult;

/// Stored entries of a field: `(key, encoded value)`.
pub type FieldItems = Vec<(FieldKey, Vec<u8>)>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DbDriver: Send + Sync {
    /// Short backend name used in logs and errors.
    fn backend(&self) -> &'static str;

    /// `true` when every primitive is atomic per id without an external lock.
    fn is_concurrent(&self) -> bool;

    async fn load_main_info(&self, id: &str) -> StorageResult<Option<MainInfo>>;

    /// Upsert the MAIN record.
    async fn update_main_info(&self, id: &str, info: &MainInfo) -> StorageResult<()>;

    /// Idempotent.
    async fn delete_main_info(&self, id: &str) -> StorageResult<()>;

    /// Entries sorted by key, highest first, at most `limit` of them.
    async fn load_field_latest(
        &self,
        id: &str,
        field: FieldName,
        limit: Option<usize>,
    ) -> StorageResult<FieldItems>;

    async fn load_field_keys(&self, id: &str, field: FieldName) -> StorageResult<BTreeSet<FieldKey>>;

    /// Entries for the requested keys; missing keys are skipped.
    async fn load_field_items(
        &self,
        id: &str,
        field: FieldName,
        keys: &BTreeSet<FieldKey>,
    ) -> StorageResult<FieldItems>;

    /// Bulk upsert; a `None` value deletes the entry. An empty patch is a no-op.
    async fn update_field_items(
        &self,
        id: &str,
        field: FieldName,
        items: &[(FieldKey, Option<Vec<u8>>)],
    ) -> StorageResult<()>;

    /// Remove MAIN and every field entry of a context. Idempotent.
    async fn delete_context(&self, id: &str) -> StorageResult<()>;

    async fn clear_all(&self) -> StorageResult<()>;
}
