// ============================================================================
// Context Storage Infrastructure - Redis Driver
// File: crates/ctxstore-infrastructure/src/cache/redis_driver.rs
// ============================================================================
//! Key-value/hash family on Redis.
//!
//! ```text
//! {prefix}:main:{id}      hash  current_turn_id, created_at, updated_at, framework_data
//! {prefix}:{field}:{id}   hash  key -> encoded value
//! {prefix}:ids            set   every id with a MAIN record
//! ```
//!
//! Hashes have no ordering, so "latest N" sorts the keys client-side.
//! Multi-key writes go through MULTI/EXEC pipelines.

use std::collections::BTreeSet;

use async_trait::async_trait;
use deadpool_redis::redis::{self, Pipeline};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use tracing::{debug, error, info};

use ctxstore_core::domain::{FieldKey, FieldName, MainInfo};
use ctxstore_core::error::{StorageError, StorageResult};
use ctxstore_core::repositories::{DbDriver, FieldItems};
use ctxstore_shared::utils::mask_credentials;
use ctxstore_shared::StorageSettings;

const BACKEND: &str = "redis";
const MAIN_FIELDS: [&str; 4] = ["current_turn_id", "created_at", "updated_at", "framework_data"];

/// Redis key names for one table prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn main(&self, id: &str) -> String {
        format!("{}:main:{}", self.prefix, id)
    }

    pub fn field(&self, field: FieldName, id: &str) -> String {
        format!("{}:{}:{}", self.prefix, field, id)
    }

    pub fn ids(&self) -> String {
        format!("{}:ids", self.prefix)
    }

    /// Every key that belongs to a context.
    pub fn context_keys(&self, id: &str) -> Vec<String> {
        std::iter::once(self.main(id))
            .chain(FieldName::ALL.iter().map(|f| self.field(*f, id)))
            .collect()
    }
}

pub struct RedisDriver {
    pool: Pool,
    keys: KeyLayout,
}

impl RedisDriver {
    /// Build the pool and PING the server. `rediss://` connects over TLS.
    pub async fn connect(settings: &StorageSettings) -> StorageResult<Self> {
        let url = &settings.connection;
        let driver = Self {
            pool: build_pool(settings)?,
            keys: KeyLayout::new(settings.table_prefix.clone()),
        };
        let ping = async {
            let mut conn = driver.pool.get().await.map_err(|e| e.to_string())?;
            redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .map_err(|e| e.to_string())
        };
        ping.await.map_err(|reason| {
            error!("Redis at {} is unreachable: {}", mask_credentials(url), reason);
            StorageError::capability_missing(
                BACKEND,
                format!("cannot reach {}: {}", mask_credentials(url), reason),
            )
        })?;

        info!("Connected to Redis context store at {}", mask_credentials(url));
        Ok(driver)
    }

    async fn conn(&self, operation: &'static str, id: &str) -> StorageResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| self.fail(operation, id, e))
    }

    fn fail(&self, operation: &'static str, id: &str, e: impl std::fmt::Display) -> StorageError {
        error!("redis {} failed for {}: {}", operation, id, e);
        StorageError::backend(BACKEND, operation, id, e.to_string())
    }

    async fn run_pipeline(&self, pipe: &Pipeline, operation: &'static str, id: &str) -> StorageResult<()> {
        let mut conn = self.conn(operation, id).await?;
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| self.fail(operation, id, e))
    }

    async fn hash_keys(&self, id: &str, field: FieldName, operation: &'static str) -> StorageResult<Vec<FieldKey>> {
        let mut conn = self.conn(operation, id).await?;
        let raw: Vec<String> = redis::cmd("HKEYS")
            .arg(self.keys.field(field, id))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(operation, id, e))?;
        raw.iter().map(|k| FieldKey::parse_for(field, k)).collect()
    }

    async fn hash_values(
        &self,
        id: &str,
        field: FieldName,
        keys: Vec<FieldKey>,
        operation: &'static str,
    ) -> StorageResult<FieldItems> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn(operation, id).await?;
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(self.keys.field(field, id));
        for key in &keys {
            cmd.arg(key.to_string());
        }
        let values: Vec<Option<Vec<u8>>> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(operation, id, e))?;

        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|bytes| (key, bytes)))
            .collect())
    }
}

/// Pool for `settings.connection`; no connection is opened yet.
fn build_pool(settings: &StorageSettings) -> StorageResult<Pool> {
    let url = &settings.connection;
    let mut config = Config::from_url(url.as_str());
    config.pool = Some(deadpool_redis::PoolConfig::new(settings.pool.max_connections as usize));
    config.create_pool(Some(Runtime::Tokio1)).map_err(|e| {
        StorageError::capability_missing(
            BACKEND,
            format!("invalid Redis URL {}: {}", mask_credentials(url), e),
        )
    })
}

/// Keys sorted highest first, at most `limit` of them.
pub fn latest_keys(mut keys: Vec<FieldKey>, limit: Option<usize>) -> Vec<FieldKey> {
    keys.sort_unstable_by(|a, b| b.cmp(a));
    keys.truncate(limit.unwrap_or(usize::MAX));
    keys
}

#[async_trait]
impl DbDriver for RedisDriver {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn is_concurrent(&self) -> bool {
        false
    }

    async fn load_main_info(&self, id: &str) -> StorageResult<Option<MainInfo>> {
        let mut conn = self.conn("load_main_info", id).await?;
        let (turn, created, updated, data): (Option<i64>, Option<i64>, Option<i64>, Option<Vec<u8>>) =
            redis::cmd("HMGET")
                .arg(self.keys.main(id))
                .arg(MAIN_FIELDS.to_vec())
                .query_async(&mut conn)
                .await
                .map_err(|e| self.fail("load_main_info", id, e))?;

        Ok(match (turn, created, updated, data) {
            (Some(current_turn_id), Some(created_at), Some(updated_at), Some(framework_data)) => {
                Some(MainInfo {
                    current_turn_id,
                    created_at,
                    updated_at,
                    framework_data,
                })
            }
            _ => None,
        })
    }

    async fn update_main_info(&self, id: &str, info: &MainInfo) -> StorageResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(self.keys.main(id))
            .arg(MAIN_FIELDS[0])
            .arg(info.current_turn_id)
            .arg(MAIN_FIELDS[2])
            .arg(info.updated_at)
            .arg(MAIN_FIELDS[3])
            .arg(info.framework_data.as_slice())
            .ignore()
            .cmd("HSETNX")
            .arg(self.keys.main(id))
            .arg(MAIN_FIELDS[1])
            .arg(info.created_at)
            .ignore()
            .cmd("SADD")
            .arg(self.keys.ids())
            .arg(id)
            .ignore();
        self.run_pipeline(&pipe, "update_main_info", id).await
    }

    async fn delete_main_info(&self, id: &str) -> StorageResult<()> {
        let mut pipe = redis::pipe();
        pipe.cmd("DEL").arg(self.keys.main(id)).ignore();
        self.run_pipeline(&pipe, "delete_main_info", id).await
    }

    async fn load_field_latest(
        &self,
        id: &str,
        field: FieldName,
        limit: Option<usize>,
    ) -> StorageResult<FieldItems> {
        let keys = self.hash_keys(id, field, "load_field_latest").await?;
        let mut items = self
            .hash_values(id, field, latest_keys(keys, limit), "load_field_latest")
            .await?;
        items.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(items)
    }

    async fn load_field_keys(&self, id: &str, field: FieldName) -> StorageResult<BTreeSet<FieldKey>> {
        Ok(self
            .hash_keys(id, field, "load_field_keys")
            .await?
            .into_iter()
            .collect())
    }

    async fn load_field_items(
        &self,
        id: &str,
        field: FieldName,
        keys: &BTreeSet<FieldKey>,
    ) -> StorageResult<FieldItems> {
        self.hash_values(id, field, keys.iter().cloned().collect(), "load_field_items")
            .await
    }

    async fn update_field_items(
        &self,
        id: &str,
        field: FieldName,
        items: &[(FieldKey, Option<Vec<u8>>)],
    ) -> StorageResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let hash = self.keys.field(field, id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in items {
            match value {
                Some(bytes) => pipe
                    .cmd("HSET")
                    .arg(&hash)
                    .arg(key.to_string())
                    .arg(bytes.as_slice())
                    .ignore(),
                None => pipe.cmd("HDEL").arg(&hash).arg(key.to_string()).ignore(),
            };
        }
        self.run_pipeline(&pipe, "update_field_items", id).await?;
        debug!("Updated {} {} entries of {} in redis", items.len(), field, id);
        Ok(())
    }

    async fn delete_context(&self, id: &str) -> StorageResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(self.keys.context_keys(id))
            .ignore()
            .cmd("SREM")
            .arg(self.keys.ids())
            .arg(id)
            .ignore();
        self.run_pipeline(&pipe, "delete_context", id).await
    }

    async fn clear_all(&self) -> StorageResult<()> {
        let mut conn = self.conn("clear_all", "*").await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.ids())
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail("clear_all", "*", e))?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.cmd("DEL").arg(self.keys.context_keys(id)).ignore();
        }
        pipe.cmd("DEL").arg(self.keys.ids()).ignore();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| self.fail("clear_all", "*", e))?;
        info!("Cleared {} contexts from redis", ids.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeyLayout::new("bot");
        assert_eq!(keys.main("u1"), "bot:main:u1");
        assert_eq!(keys.field(FieldName::Requests, "u1"), "bot:requests:u1");
        assert_eq!(keys.ids(), "bot:ids");
        assert_eq!(
            keys.context_keys("u1"),
            vec!["bot:main:u1", "bot:labels:u1", "bot:requests:u1", "bot:responses:u1", "bot:misc:u1"]
        );
    }

    #[tokio::test]
    async fn test_pool_accepts_plain_and_tls_urls() {
        assert!(build_pool(&StorageSettings::new("redis://localhost:6379/0")).is_ok());
        assert!(build_pool(&StorageSettings::new("rediss://:secret@cache.internal:6380")).is_ok());
    }

    #[test]
    fn test_latest_keys_sort_numerically() {
        let keys = vec![FieldKey::Turn(9), FieldKey::Turn(10), FieldKey::Turn(2)];
        assert_eq!(
            latest_keys(keys.clone(), Some(2)),
            vec![FieldKey::Turn(10), FieldKey::Turn(9)]
        );
        assert_eq!(latest_keys(keys, None).len(), 3);
    }
}
