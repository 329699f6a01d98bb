// ============================================================================
// Context Storage Infrastructure - Distributed Table Driver
// File: crates/ctxstore-infrastructure/src/database/cockroach.rs
// ============================================================================
//! CockroachDB driver. Same tables as the relational driver, but every
//! primitive runs in its own explicit transaction and is retried when the
//! cluster reports a serialization conflict or the connection drops.

use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, error, info};

use ctxstore_core::domain::{FieldKey, FieldKind, FieldName, MainInfo};
use ctxstore_core::error::{StorageError, StorageResult};
use ctxstore_core::repositories::{DbDriver, FieldItems};
use ctxstore_shared::utils::{mask_credentials, split_scheme};
use ctxstore_shared::StorageSettings;

use super::connection::create_pg_pool;
use super::retry::{run_retrying, RetryPolicy};
use super::statements::{Dialect, Statements};

const BACKEND: &str = "cockroachdb";

pub struct CockroachDriver {
    pool: PgPool,
    sql: Statements,
    retry: RetryPolicy,
}

impl CockroachDriver {
    /// Connect and create the tables on first use of the cluster.
    pub async fn connect(settings: &StorageSettings) -> StorageResult<Self> {
        let url = normalize_url(&settings.connection)?;
        let sql = Statements::new(Dialect::Postgres, &settings.table_prefix)?;

        let pool = create_pg_pool(&url, &settings.pool).await.map_err(|e| {
            error!("Cannot connect to {}: {}", mask_credentials(&url), e);
            StorageError::capability_missing(
                BACKEND,
                format!("cannot connect to {}: {}", mask_credentials(&url), e),
            )
        })?;

        let driver = Self {
            pool,
            sql,
            retry: RetryPolicy::from(&settings.retry),
        };
        run_retrying(&driver.retry, BACKEND, "create_tables", "*", || driver.tx_create_tables())
            .await?;
        info!("Connected to CockroachDB context store at {}", mask_credentials(&url));
        Ok(driver)
    }

    async fn tx_create_tables(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for statement in self.sql.create_tables() {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await
    }

    async fn tx_load_main(&self, id: &str) -> Result<Option<MainInfo>, sqlx::Error> {
        let sql = self.sql.select_main();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *tx).await?;
        tx.commit().await?;

        row.map(|row| -> Result<MainInfo, sqlx::Error> {
            Ok(MainInfo {
                current_turn_id: row.try_get(0)?,
                created_at: row.try_get(1)?,
                updated_at: row.try_get(2)?,
                framework_data: row.try_get(3)?,
            })
        })
        .transpose()
    }

    async fn tx_update_main(&self, id: &str, info: &MainInfo) -> Result<(), sqlx::Error> {
        let sql = self.sql.upsert_main();
        let mut tx = self.pool.begin().await?;
        sqlx::query(&sql)
            .bind(id)
            .bind(info.current_turn_id)
            .bind(info.created_at)
            .bind(info.updated_at)
            .bind(info.framework_data.as_slice())
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    /// Run statements that each bind only the context id.
    async fn tx_execute_all(&self, statements: &[String], id: Option<&str>) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for statement in statements {
            let query = sqlx::query(statement);
            let query = match id {
                Some(id) => query.bind(id),
                None => query,
            };
            query.execute(&mut *tx).await?;
        }
        tx.commit().await
    }

    async fn tx_fetch(
        &self,
        sql: &str,
        id: &str,
        keys: &BTreeSet<FieldKey>,
    ) -> Result<Vec<PgRow>, sqlx::Error> {
        let mut query = sqlx::query(sql).bind(id);
        for key in keys {
            query = bind_key(query, key);
        }
        let mut tx = self.pool.begin().await?;
        let rows = query.fetch_all(&mut *tx).await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn tx_update_items(
        &self,
        id: &str,
        field: FieldName,
        items: &[(FieldKey, Option<Vec<u8>>)],
    ) -> Result<(), sqlx::Error> {
        let upsert = self.sql.upsert_item(field);
        let delete = self.sql.delete_item(field);

        let mut tx = self.pool.begin().await?;
        for (key, value) in items {
            let query = match value {
                Some(bytes) => bind_key(sqlx::query(&upsert).bind(id), key).bind(bytes.as_slice()),
                None => bind_key(sqlx::query(&delete).bind(id), key),
            };
            query.execute(&mut *tx).await?;
        }
        tx.commit().await
    }
}

/// `cockroachdb://` disables TLS, `cockroachdbs://` requires it; an explicit
/// `sslmode` in the address wins.
pub fn normalize_url(connection: &str) -> StorageResult<String> {
    let (scheme, address) = split_scheme(connection).ok_or_else(|| {
        StorageError::invalid_config(format!(
            "malformed connection string '{}'",
            mask_credentials(connection)
        ))
    })?;
    let sslmode = match scheme {
        "cockroachdb" => "disable",
        "cockroachdbs" => "require",
        other => {
            return Err(StorageError::invalid_config(format!(
                "'{}' is not a CockroachDB scheme",
                other
            )))
        }
    };

    let mut url = format!("postgres://{}", address);
    if !address.contains("sslmode=") {
        url.push(if address.contains('?') { '&' } else { '?' });
        url.push_str("sslmode=");
        url.push_str(sslmode);
    }
    Ok(url)
}

fn bind_key<'q>(
    query: Query<'q, Postgres, PgArguments>,
    key: &'q FieldKey,
) -> Query<'q, Postgres, PgArguments> {
    match key {
        FieldKey::Turn(turn) => query.bind(*turn),
        FieldKey::Name(name) => query.bind(name.as_str()),
    }
}

fn read_items(rows: &[PgRow], field: FieldName) -> Result<FieldItems, sqlx::Error> {
    rows.iter()
        .map(|row| {
            let key = match field.kind() {
                FieldKind::Turn => FieldKey::Turn(row.try_get(0)?),
                FieldKind::Keyed => FieldKey::Name(row.try_get(0)?),
            };
            Ok((key, row.try_get::<Vec<u8>, _>(1)?))
        })
        .collect()
}

#[async_trait]
impl DbDriver for CockroachDriver {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn is_concurrent(&self) -> bool {
        true
    }

    async fn load_main_info(&self, id: &str) -> StorageResult<Option<MainInfo>> {
        run_retrying(&self.retry, BACKEND, "load_main_info", id, || self.tx_load_main(id)).await
    }

    async fn update_main_info(&self, id: &str, info: &MainInfo) -> StorageResult<()> {
        run_retrying(&self.retry, BACKEND, "update_main_info", id, || {
            self.tx_update_main(id, info)
        })
        .await
    }

    async fn delete_main_info(&self, id: &str) -> StorageResult<()> {
        let statements = [self.sql.delete_main()];
        run_retrying(&self.retry, BACKEND, "delete_main_info", id, || {
            self.tx_execute_all(&statements, Some(id))
        })
        .await
    }

    async fn load_field_latest(
        &self,
        id: &str,
        field: FieldName,
        limit: Option<usize>,
    ) -> StorageResult<FieldItems> {
        let sql = self.sql.select_latest(field, limit);
        let none = BTreeSet::new();
        let rows = run_retrying(&self.retry, BACKEND, "load_field_latest", id, || {
            self.tx_fetch(&sql, id, &none)
        })
        .await?;
        read_items(&rows, field).map_err(|e| StorageError::backend(BACKEND, "load_field_latest", id, e))
    }

    async fn load_field_keys(&self, id: &str, field: FieldName) -> StorageResult<BTreeSet<FieldKey>> {
        let sql = self.sql.select_keys(field);
        let none = BTreeSet::new();
        let rows = run_retrying(&self.retry, BACKEND, "load_field_keys", id, || {
            self.tx_fetch(&sql, id, &none)
        })
        .await?;
        rows.iter()
            .map(|row| -> Result<FieldKey, sqlx::Error> {
                Ok(match field.kind() {
                    FieldKind::Turn => FieldKey::Turn(row.try_get(0)?),
                    FieldKind::Keyed => FieldKey::Name(row.try_get(0)?),
                })
            })
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(|e| StorageError::backend(BACKEND, "load_field_keys", id, e))
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
        let rows = run_retrying(&self.retry, BACKEND, "load_field_items", id, || {
            self.tx_fetch(&sql, id, keys)
        })
        .await?;
        read_items(&rows, field).map_err(|e| StorageError::backend(BACKEND, "load_field_items", id, e))
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
        run_retrying(&self.retry, BACKEND, "update_field_items", id, || {
            self.tx_update_items(id, field, items)
        })
        .await?;
        debug!("Updated {} {} entries of {} in {}", items.len(), field, id, BACKEND);
        Ok(())
    }

    async fn delete_context(&self, id: &str) -> StorageResult<()> {
        let statements = self.sql.delete_context();
        run_retrying(&self.retry, BACKEND, "delete_context", id, || {
            self.tx_execute_all(&statements, Some(id))
        })
        .await
    }

    async fn clear_all(&self) -> StorageResult<()> {
        let statements = self.sql.clear_all();
        run_retrying(&self.retry, BACKEND, "clear_all", "*", || {
            self.tx_execute_all(&statements, None)
        })
        .await
    }
}
