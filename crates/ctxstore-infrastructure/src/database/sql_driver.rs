// ============================================================================
// Context Storage Infrastructure - Relational Driver
// File: crates/ctxstore-infrastructure/src/database/sql_driver.rs
// ============================================================================
//! SQLite / PostgreSQL / MySQL driver over the sqlx `Any` pool.

use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use tracing::{debug, error, info};

use ctxstore_core::domain::{FieldKey, FieldKind, FieldName, MainInfo};
use ctxstore_core::error::{StorageError, StorageResult};
use ctxstore_core::repositories::{DbDriver, FieldItems};
use ctxstore_shared::utils::{mask_credentials, split_scheme};
use ctxstore_shared::StorageSettings;

use super::connection::create_any_pool;
use super::statements::{Dialect, Statements};

pub struct SqlDriver {
    pool: AnyPool,
    sql: Statements,
}

impl SqlDriver {
    /// Connect, ping the server and create the tables if needed.
    pub async fn connect(settings: &StorageSettings) -> StorageResult<Self> {
        let (url, dialect) = normalize_url(&settings.connection)?;
        let backend = backend_name(dialect);
        let sql = Statements::new(dialect, &settings.table_prefix)?;

        let pool = create_any_pool(&url, &settings.pool).await.map_err(|e| {
            error!("Cannot connect to {}: {}", mask_credentials(&url), e);
            StorageError::capability_missing(
                backend,
                format!("cannot connect to {}: {}", mask_credentials(&url), e),
            )
        })?;

        let driver = Self { pool, sql };
        driver.create_tables().await?;
        info!("Connected to {} context store at {}", backend, mask_credentials(&url));
        Ok(driver)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    async fn create_tables(&self) -> StorageResult<()> {
        for statement in self.sql.create_tables() {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| self.fail("create_tables", "*", e))?;
        }
        Ok(())
    }

    fn fail(&self, operation: &'static str, id: &str, e: sqlx::Error) -> StorageError {
        error!("{} {} failed for {}: {}", self.backend(), operation, id, e);
        StorageError::backend(self.backend(), operation, id, e)
    }
}

/// Turn `<scheme>[+driver]://<address>` into a URL sqlx understands.
pub fn normalize_url(connection: &str) -> StorageResult<(String, Dialect)> {
    let (scheme, address) = split_scheme(connection).ok_or_else(|| {
        StorageError::invalid_config(format!(
            "malformed connection string '{}'",
            mask_credentials(connection)
        ))
    })?;
    let dialect = Dialect::from_scheme(scheme).ok_or_else(|| {
        StorageError::invalid_config(format!("'{}' is not a relational scheme", scheme))
    })?;
    let base = match dialect {
        Dialect::Postgres => "postgres",
        Dialect::Sqlite => "sqlite",
        Dialect::MySql => "mysql",
    };

    let mut url = format!("{}://{}", base, address);
    if dialect == Dialect::Sqlite && !address.contains(":memory:") && !address.contains("mode=") {
        url.push(if address.contains('?') { '&' } else { '?' });
        url.push_str("mode=rwc");
    }
    Ok((url, dialect))
}

fn backend_name(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => "postgres",
        Dialect::Sqlite => "sqlite",
        Dialect::MySql => "mysql",
    }
}

fn bind_key<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    key: &'q FieldKey,
) -> Query<'q, Any, AnyArguments<'q>> {
    match key {
        FieldKey::Turn(turn) => query.bind(*turn),
        FieldKey::Name(name) => query.bind(name.as_str()),
    }
}

fn read_key(row: &AnyRow, field: FieldName) -> Result<FieldKey, sqlx::Error> {
    Ok(match field.kind() {
        FieldKind::Turn => FieldKey::Turn(row.try_get(0)?),
        FieldKind::Keyed => FieldKey::Name(row.try_get(0)?),
    })
}

fn read_items(rows: &[AnyRow], field: FieldName) -> Result<FieldItems, sqlx::Error> {
    rows.iter()
        .map(|row| Ok((read_key(row, field)?, row.try_get::<Vec<u8>, _>(1)?)))
        .collect()
}

#[async_trait]
impl DbDriver for SqlDriver {
    fn backend(&self) -> &'static str {
        backend_name(self.sql.dialect())
    }

    fn is_concurrent(&self) -> bool {
        true
    }

    async fn load_main_info(&self, id: &str) -> StorageResult<Option<MainInfo>> {
        let sql = self.sql.select_main();
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.fail("load_main_info", id, e))?;

        row.map(|row| -> Result<MainInfo, sqlx::Error> {
            Ok(MainInfo {
                current_turn_id: row.try_get(0)?,
                created_at: row.try_get(1)?,
                updated_at: row.try_get(2)?,
                framework_data: row.try_get(3)?,
            })
        })
        .transpose()
        .map_err(|e| self.fail("load_main_info", id, e))
    }

    async fn update_main_info(&self, id: &str, info: &MainInfo) -> StorageResult<()> {
        let sql = self.sql.upsert_main();
        sqlx::query(&sql)
            .bind(id)
            .bind(info.current_turn_id)
            .bind(info.created_at)
            .bind(info.updated_at)
            .bind(info.framework_data.clone())
            .execute(&self.pool)
            .await
            .map_err(|e| self.fail("update_main_info", id, e))?;
        Ok(())
    }

    async fn delete_main_info(&self, id: &str) -> StorageResult<()> {
        let sql = self.sql.delete_main();
        sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
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
        let sql = self.sql.select_latest(field, limit);
        let rows = sqlx::query(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.fail("load_field_latest", id, e))?;
        read_items(&rows, field).map_err(|e| self.fail("load_field_latest", id, e))
    }

    async fn load_field_keys(&self, id: &str, field: FieldName) -> StorageResult<BTreeSet<FieldKey>> {
        let sql = self.sql.select_keys(field);
        let rows = sqlx::query(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.fail("load_field_keys", id, e))?;
        rows.iter()
            .map(|row| read_key(row, field))
            .collect::<Result<_, _>>()
            .map_err(|e| self.fail("load_field_keys", id, e))
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
        let sql = self.sql.select_items(field, keys.len());
        let mut query = sqlx::query(&sql).bind(id);
        for key in keys {
            query = bind_key(query, key);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.fail("load_field_items", id, e))?;
        read_items(&rows, field).map_err(|e| self.fail("load_field_items", id, e))
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
        let upsert = self.sql.upsert_item(field);
        let delete = self.sql.delete_item(field);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| self.fail("update_field_items", id, e))?;
        for (key, value) in items {
            let query = match value {
                Some(bytes) => bind_key(sqlx::query(&upsert).bind(id), key).bind(bytes.clone()),
                None => bind_key(sqlx::query(&delete).bind(id), key),
            };
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| self.fail("update_field_items", id, e))?;
        }
        tx.commit()
            .await
            .map_err(|e| self.fail("update_field_items", id, e))?;

        debug!("Updated {} {} entries of {} in {}", items.len(), field, id, self.backend());
        Ok(())
    }

    async fn delete_context(&self, id: &str) -> StorageResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| self.fail("delete_context", id, e))?;
        for statement in self.sql.delete_context() {
            sqlx::query(&statement)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.fail("delete_context", id, e))?;
        }
        tx.commit()
            .await
            .map_err(|e| self.fail("delete_context", id, e))
    }

    async fn clear_all(&self) -> StorageResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| self.fail("clear_all", "*", e))?;
        for statement in self.sql.clear_all() {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.fail("clear_all", "*", e))?;
        }
        tx.commit().await.map_err(|e| self.fail("clear_all", "*", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("postgresql+asyncpg://u:p@db/ctx").unwrap(),
            ("postgres://u:p@db/ctx".to_string(), Dialect::Postgres)
        );
        assert_eq!(
            normalize_url("sqlite://data/ctx.db").unwrap().0,
            "sqlite://data/ctx.db?mode=rwc"
        );
        assert_eq!(
            normalize_url("sqlite+aiosqlite://ctx.db?cache=shared").unwrap().0,
            "sqlite://ctx.db?cache=shared&mode=rwc"
        );
        assert_eq!(normalize_url("sqlite://:memory:").unwrap().0, "sqlite://:memory:");
        assert_eq!(normalize_url("mysql+pymysql://db/ctx").unwrap().1, Dialect::MySql);
        assert!(normalize_url("redis://cache").is_err());
        assert!(normalize_url("no-scheme").is_err());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_sqlite_turn_columns_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let settings =
            StorageSettings::new(format!("sqlite://{}", dir.path().join("ctx.db").display()));
        let driver = SqlDriver::connect(&settings).await.unwrap();

        driver
            .update_field_items("u1", FieldName::Requests, &[(1.into(), Some(b"r1".to_vec()))])
            .await
            .unwrap();
        driver
            .update_field_items("u1", FieldName::Responses, &[(1.into(), Some(b"s1".to_vec()))])
            .await
            .unwrap();
        driver
            .update_field_items("u1", FieldName::Requests, &[(1.into(), None)])
            .await
            .unwrap();

        assert!(driver.load_field_keys("u1", FieldName::Requests).await.unwrap().is_empty());
        assert_eq!(
            driver.load_field_latest("u1", FieldName::Responses, Some(5)).await.unwrap(),
            vec![(FieldKey::Turn(1), b"s1".to_vec())]
        );
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_sqlite_rejects_unreachable_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no").join("such").join("dir").join("ctx.db");
        let settings = StorageSettings::new(format!("sqlite://{}", missing.display()));
        let err = SqlDriver::connect(&settings).await.err().unwrap();
        assert!(matches!(err, StorageError::CapabilityMissing { backend: "sqlite", .. }));
    }
}
