// ============================================================================
// Context Storage Infrastructure - MongoDB Driver
// File: crates/ctxstore-infrastructure/src/document/mongo.rs
// ============================================================================
//! Document-store family on MongoDB.
//!
//! Three collections per prefix, mirroring the relational tables:
//! `{prefix}_main` keyed by `_id`, `{prefix}_turns` with one document per
//! `(id, key)` and a sub-field per turn field, `{prefix}_misc` with one
//! document per `(id, key)`. Both item collections carry a unique
//! `(id, key)` index.

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{doc, Binary, Bson, Document};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, error, info};

use ctxstore_core::domain::{FieldKey, FieldKind, FieldName, MainInfo};
use ctxstore_core::error::{StorageError, StorageResult};
use ctxstore_core::repositories::{DbDriver, FieldItems};
use ctxstore_shared::constants::DEFAULT_DOCUMENT_DATABASE;
use ctxstore_shared::utils::mask_credentials;
use ctxstore_shared::StorageSettings;

const BACKEND: &str = "mongodb";
const MISC_VALUE: &str = "value";

pub struct MongoDriver {
    main: Collection<Document>,
    turns: Collection<Document>,
    misc: Collection<Document>,
}

impl MongoDriver {
    pub async fn connect(settings: &StorageSettings) -> StorageResult<Self> {
        let url = &settings.connection;
        let unreachable_err = |e: mongodb::error::Error| {
            error!("MongoDB at {} is unreachable: {}", mask_credentials(url), e);
            StorageError::capability_missing(
                BACKEND,
                format!("cannot reach {}: {}", mask_credentials(url), e),
            )
        };

        let client = Client::with_uri_str(url).await.map_err(unreachable_err)?;
        let database: Database = client
            .default_database()
            .unwrap_or_else(|| client.database(DEFAULT_DOCUMENT_DATABASE));
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(unreachable_err)?;

        let prefix = &settings.table_prefix;
        let driver = Self {
            main: database.collection(&format!("{}_main", prefix)),
            turns: database.collection(&format!("{}_turns", prefix)),
            misc: database.collection(&format!("{}_misc", prefix)),
        };
        for collection in [&driver.turns, &driver.misc] {
            let index = IndexModel::builder()
                .keys(doc! { "id": 1, "key": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build();
            collection
                .create_index(index)
                .await
                .map_err(|e| driver.fail("create_index", "*", e))?;
        }

        info!(
            "Connected to MongoDB context store at {} (database {})",
            mask_credentials(url),
            database.name()
        );
        Ok(driver)
    }

    fn fail(&self, operation: &'static str, id: &str, e: impl std::fmt::Display) -> StorageError {
        error!("mongodb {} failed for {}: {}", operation, id, e);
        StorageError::backend(BACKEND, operation, id, e.to_string())
    }

    /// `(collection, value sub-field)` holding a field's entries.
    fn location(&self, field: FieldName) -> (&Collection<Document>, &'static str) {
        match field.kind() {
            FieldKind::Turn => (&self.turns, field.as_str()),
            FieldKind::Keyed => (&self.misc, MISC_VALUE),
        }
    }

    async fn find_items(
        &self,
        field: FieldName,
        filter: Document,
        limit: Option<usize>,
        operation: &'static str,
        id: &str,
    ) -> StorageResult<FieldItems> {
        let (collection, value) = self.location(field);
        let mut find = collection
            .find(filter)
            .projection(doc! { "key": 1, value: 1 })
            .sort(doc! { "key": -1 });
        if let Some(limit) = limit {
            find = find.limit(limit as i64);
        }
        let documents: Vec<Document> = find
            .await
            .map_err(|e| self.fail(operation, id, e))?
            .try_collect()
            .await
            .map_err(|e| self.fail(operation, id, e))?;

        documents
            .iter()
            .map(|document| {
                let key = read_key(document.get("key"), field)?;
                let bytes = document
                    .get_binary_generic(value)
                    .map_err(|e| StorageError::serialization(format!("{} in {}: {}", value, id, e)))?;
                Ok((key, bytes.clone()))
            })
            .collect()
    }
}

fn blob(bytes: &[u8]) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    })
}

fn key_bson(key: &FieldKey) -> Bson {
    match key {
        FieldKey::Turn(turn) => Bson::Int64(*turn),
        FieldKey::Name(name) => Bson::String(name.clone()),
    }
}

fn read_key(value: Option<&Bson>, field: FieldName) -> StorageResult<FieldKey> {
    match (field.kind(), value) {
        (FieldKind::Turn, Some(Bson::Int64(turn))) => Ok(FieldKey::Turn(*turn)),
        (FieldKind::Turn, Some(Bson::Int32(turn))) => Ok(FieldKey::Turn(i64::from(*turn))),
        (FieldKind::Keyed, Some(Bson::String(name))) => Ok(FieldKey::Name(name.clone())),
        (_, other) => Err(StorageError::serialization(format!(
            "unexpected {} key {:?}",
            field, other
        ))),
    }
}

/// Filter matching the stored entries of `field` for `id`.
fn present(id: &str, value: &str) -> Document {
    doc! { "id": id, value: { "$exists": true } }
}

#[async_trait]
impl DbDriver for MongoDriver {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn is_concurrent(&self) -> bool {
        false
    }

    async fn load_main_info(&self, id: &str) -> StorageResult<Option<MainInfo>> {
        let Some(document) = self
            .main
            .find_one(doc! { "_id": id })
            .await
            .map_err(|e| self.fail("load_main_info", id, e))?
        else {
            return Ok(None);
        };

        let read = |e: mongodb::bson::document::ValueAccessError| {
            StorageError::serialization(format!("main record of {}: {}", id, e))
        };
        Ok(Some(MainInfo {
            current_turn_id: document.get_i64("current_turn_id").map_err(read)?,
            created_at: document.get_i64("created_at").map_err(read)?,
            updated_at: document.get_i64("updated_at").map_err(read)?,
            framework_data: document.get_binary_generic("framework_data").map_err(read)?.clone(),
        }))
    }

    async fn update_main_info(&self, id: &str, info: &MainInfo) -> StorageResult<()> {
        let update = doc! {
            "$set": {
                "current_turn_id": info.current_turn_id,
                "updated_at": info.updated_at,
                "framework_data": blob(&info.framework_data),
            },
            "$setOnInsert": { "created_at": info.created_at },
        };
        self.main
            .update_one(doc! { "_id": id }, update)
            .upsert(true)
            .await
            .map_err(|e| self.fail("update_main_info", id, e))?;
        Ok(())
    }

    async fn delete_main_info(&self, id: &str) -> StorageResult<()> {
        self.main
            .delete_one(doc! { "_id": id })
            .await
            .map_err(|e| self.fail("delete_main_info", id, e))?;
        Ok(())
    }

    async fn load_field_latest(
        &self,
        id: &str,
        field: FieldName,
        limit: Option<usize>,
    ) -> StorageResult<FieldItems> {
        let (_, value) = self.location(field);
        self.find_items(field, present(id, value), limit, "load_field_latest", id)
            .await
    }

    async fn load_field_keys(&self, id: &str, field: FieldName) -> StorageResult<BTreeSet<FieldKey>> {
        let (collection, value) = self.location(field);
        let keys = collection
            .distinct("key", present(id, value))
            .await
            .map_err(|e| self.fail("load_field_keys", id, e))?;
        keys.iter().map(|key| read_key(Some(key), field)).collect()
    }

    async fn load_field_items(
        &self,
        id: &str,
        field: FieldName,
        keys: &BTreeSet<FieldKey>,
    ) -> StorageResult<FieldItems> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let (_, value) = self.location(field);
        let mut filter = present(id, value);
        filter.insert("key", doc! { "$in": keys.iter().map(key_bson).collect::<Vec<_>>() });
        self.find_items(field, filter, None, "load_field_items", id)
            .await
    }

    async fn update_field_items(
        &self,
        id: &str,
        field: FieldName,
        items: &[(FieldKey, Option<Vec<u8>>)],
    ) -> StorageResult<()> {
        let (collection, value) = self.location(field);
        for (key, bytes) in items {
            let filter = doc! { "id": id, "key": key_bson(key) };
            match (field.kind(), bytes) {
                (_, Some(bytes)) => {
                    collection
                        .update_one(filter, doc! { "$set": { value: blob(bytes) } })
                        .upsert(true)
                        .await
                        .map_err(|e| self.fail("update_field_items", id, e))?;
                }
                (FieldKind::Turn, None) => {
                    collection
                        .update_one(filter, doc! { "$unset": { value: "" } })
                        .await
                        .map_err(|e| self.fail("update_field_items", id, e))?;
                }
                (FieldKind::Keyed, None) => {
                    collection
                        .delete_one(filter)
                        .await
                        .map_err(|e| self.fail("update_field_items", id, e))?;
                }
            }
        }
        if !items.is_empty() {
            debug!("Updated {} {} entries of {} in mongodb", items.len(), field, id);
        }
        Ok(())
    }

    async fn delete_context(&self, id: &str) -> StorageResult<()> {
        for collection in [&self.turns, &self.misc] {
            collection
                .delete_many(doc! { "id": id })
                .await
                .map_err(|e| self.fail("delete_context", id, e))?;
        }
        self.delete_main_info(id).await
    }

    async fn clear_all(&self) -> StorageResult<()> {
        for collection in [&self.turns, &self.misc, &self.main] {
            collection
                .delete_many(doc! {})
                .await
                .map_err(|e| self.fail("clear_all", "*", e))?;
        }
        info!("Cleared every context from mongodb");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_key_by_field_kind() {
        assert_eq!(
            read_key(Some(&Bson::Int64(7)), FieldName::Labels).unwrap(),
            FieldKey::Turn(7)
        );
        assert_eq!(
            read_key(Some(&Bson::Int32(3)), FieldName::Requests).unwrap(),
            FieldKey::Turn(3)
        );
        assert_eq!(
            read_key(Some(&Bson::String("tz".into())), FieldName::Misc).unwrap(),
            FieldKey::Name("tz".into())
        );
        assert!(read_key(Some(&Bson::String("1".into())), FieldName::Requests).is_err());
        assert!(read_key(None, FieldName::Misc).is_err());
    }

    #[test]
    fn test_present_filter() {
        assert_eq!(
            present("u1", "responses"),
            doc! { "id": "u1", "responses": { "$exists": true } }
        );
    }
}
