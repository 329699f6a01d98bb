// ============================================================================
// Context Storage Core - Context Storage Service
// File: crates/ctxstore-core/src/services/context_storage.rs
// ============================================================================
//! Entry point for callers: read, write and delete contexts by id.

use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{Context, FieldConfig};
use crate::error::StorageResult;
use crate::repositories::DbDriver;
use crate::schema::{ContextSchema, WriteReport};
use crate::services::{KeyedGuard, KeyedLocks};

/// A driver paired with the schema that decides what to sync.
#[derive(Clone)]
pub struct ContextStorage {
    driver: Arc<dyn DbDriver>,
    schema: ContextSchema,
    locks: KeyedLocks,
}

impl ContextStorage {
    pub fn new(driver: Arc<dyn DbDriver>, schema: ContextSchema) -> Self {
        Self {
            driver,
            schema,
            locks: KeyedLocks::new(),
        }
    }

    pub fn schema(&self) -> &ContextSchema {
        &self.schema
    }

    pub fn driver(&self) -> &Arc<dyn DbDriver> {
        &self.driver
    }

    pub fn backend(&self) -> &'static str {
        self.driver.backend()
    }

    async fn guard(&self, id: &str) -> Option<KeyedGuard> {
        if self.driver.is_concurrent() {
            None
        } else {
            Some(self.locks.acquire(id).await)
        }
    }

    /// Load a context, or a fresh one when `id` is not stored.
    pub async fn read(&self, id: &str) -> StorageResult<Context> {
        self.read_with_schema(&self.schema, id).await
    }

    /// Load a context with some field configs replaced for this call only.
    pub async fn read_with(&self, id: &str, overrides: &[FieldConfig]) -> StorageResult<Context> {
        let mut schema = self.schema.clone();
        for config in overrides {
            schema = schema.with_field(config.clone())?;
        }
        self.read_with_schema(&schema, id).await
    }

    async fn read_with_schema(&self, schema: &ContextSchema, id: &str) -> StorageResult<Context> {
        let _guard = self.guard(id).await;
        let driver = self.driver.as_ref();

        let known = schema.load_known_keys(driver, id).await?;
        let (ctx, _baseline) = schema.read(driver, &known, id).await?;
        Ok(ctx)
    }

    /// Persist a context.
    ///
    /// Uses the keys and hashes recorded by the read (or previous write)
    /// that produced `ctx`. A context that was never read first adopts
    /// whatever is already stored under its id, so only a genuinely new
    /// id gets a fresh `created_at`.
    pub async fn write(&self, ctx: &mut Context) -> StorageResult<WriteReport> {
        let _guard = self.guard(&ctx.id).await;

        if !ctx.is_persisted() {
            self.schema.attach_stored(self.driver.as_ref(), ctx).await?;
        }
        let baseline = ctx.sync.baseline.clone();
        let known = ctx.sync.known_keys.clone();
        self.schema.write(self.driver.as_ref(), ctx, &baseline, &known).await
    }

    /// Whether a MAIN record exists for `id`.
    pub async fn contains(&self, id: &str) -> StorageResult<bool> {
        Ok(self.driver.load_main_info(id).await?.is_some())
    }

    /// Remove a context and all of its field entries.
    pub async fn delete(&self, id: &str) -> StorageResult<()> {
        let _guard = self.guard(id).await;
        self.driver.delete_context(id).await?;
        debug!("Deleted context {} from {}", id, self.driver.backend());
        Ok(())
    }

    /// Remove every context in this storage.
    pub async fn clear_all(&self) -> StorageResult<()> {
        self.driver.clear_all().await?;
        self.locks.prune();
        info!("Cleared all contexts from {}", self.driver.backend());
        Ok(())
    }
}

impl std::fmt::Debug for ContextStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStorage")
            .field("backend", &self.driver.backend())
            .field("schema", &self.schema)
            .finish()
    }
}
