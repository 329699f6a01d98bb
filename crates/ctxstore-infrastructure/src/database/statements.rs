// ============================================================================
// Context Storage Infrastructure - SQL Statements
// File: crates/ctxstore-infrastructure/src/database/statements.rs
// Description: Per-dialect SQL for the main / turns / misc tables
// ============================================================================
//! Table layout, for a prefix `ctx`:
//!
//! ```text
//! ctx_main  (id PK, current_turn_id, created_at, updated_at, framework_data)
//! ctx_turns (id, turn_key, labels, requests, responses, PK (id, turn_key))
//! ctx_misc  (id, misc_key, misc_value, PK (id, misc_key))
//! ```
//!
//! A turn entry is deleted by setting its column to NULL; the row itself
//! only goes away with the whole context.

use ctxstore_core::domain::{FieldKind, FieldName};
use ctxstore_core::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
    MySql,
}

impl Dialect {
    /// Dialect for a connection-string scheme, ignoring any `+driver` suffix.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.split('+').next()? {
            "postgres" | "postgresql" => Some(Dialect::Postgres),
            "sqlite" => Some(Dialect::Sqlite),
            "mysql" => Some(Dialect::MySql),
            _ => None,
        }
    }

    /// Bind placeholder for the 1-based parameter `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::Sqlite => format!("?{}", n),
            Dialect::MySql => "?".to_string(),
        }
    }

    fn placeholders(&self, from: usize, count: usize) -> String {
        (from..from + count)
            .map(|n| self.placeholder(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn id_type(&self) -> &'static str {
        match self {
            Dialect::MySql => "VARCHAR(255)",
            _ => "TEXT",
        }
    }

    fn blob_type(&self) -> &'static str {
        match self {
            Dialect::Postgres => "BYTEA",
            Dialect::Sqlite => "BLOB",
            Dialect::MySql => "LONGBLOB",
        }
    }

    /// Conflict clause that copies `columns` from the proposed row.
    fn upsert(&self, conflict: &str, columns: &[&str]) -> String {
        match self {
            Dialect::MySql => format!(
                "ON DUPLICATE KEY UPDATE {}",
                columns
                    .iter()
                    .map(|c| format!("{c} = VALUES({c})"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            _ => format!(
                "ON CONFLICT ({}) DO UPDATE SET {}",
                conflict,
                columns
                    .iter()
                    .map(|c| format!("{c} = excluded.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

/// SQL text for one dialect and table prefix.
#[derive(Debug, Clone)]
pub struct Statements {
    dialect: Dialect,
    main: String,
    turns: String,
    misc: String,
}

impl Statements {
    pub fn new(dialect: Dialect, prefix: &str) -> StorageResult<Self> {
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StorageError::invalid_config(format!(
                "table prefix '{}' must be non-empty and contain only letters, digits and '_'",
                prefix
            )));
        }
        Ok(Self {
            dialect,
            main: format!("{}_main", prefix),
            turns: format!("{}_turns", prefix),
            misc: format!("{}_misc", prefix),
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn create_tables(&self) -> Vec<String> {
        let id = self.dialect.id_type();
        let blob = self.dialect.blob_type();
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (id {id} PRIMARY KEY, current_turn_id BIGINT NOT NULL, created_at BIGINT NOT NULL, updated_at BIGINT NOT NULL, framework_data {blob} NOT NULL)",
                self.main
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (id {id} NOT NULL, turn_key BIGINT NOT NULL, labels {blob}, requests {blob}, responses {blob}, PRIMARY KEY (id, turn_key))",
                self.turns
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (id {id} NOT NULL, misc_key {id} NOT NULL, misc_value {blob} NOT NULL, PRIMARY KEY (id, misc_key))",
                self.misc
            ),
        ]
    }

    pub fn select_main(&self) -> String {
        format!(
            "SELECT current_turn_id, created_at, updated_at, framework_data FROM {} WHERE id = {}",
            self.main,
            self.dialect.placeholder(1)
        )
    }

    /// Binds: id, current_turn_id, created_at, updated_at, framework_data.
    pub fn upsert_main(&self) -> String {
        format!(
            "INSERT INTO {} (id, current_turn_id, created_at, updated_at, framework_data) VALUES ({}) {}",
            self.main,
            self.dialect.placeholders(1, 5),
            self.dialect
                .upsert("id", &["current_turn_id", "updated_at", "framework_data"])
        )
    }

    pub fn delete_main(&self) -> String {
        format!("DELETE FROM {} WHERE id = {}", self.main, self.dialect.placeholder(1))
    }

    /// `(table, key column, value column)` of a field.
    fn location(&self, field: FieldName) -> (&str, &'static str, &'static str) {
        match field.kind() {
            FieldKind::Turn => (self.turns.as_str(), "turn_key", field.as_str()),
            FieldKind::Keyed => (self.misc.as_str(), "misc_key", "misc_value"),
        }
    }

    /// Binds: id. Rows are `(key, value)`, highest key first.
    pub fn select_latest(&self, field: FieldName, limit: Option<usize>) -> String {
        let (table, key, value) = self.location(field);
        let mut sql = format!(
            "SELECT {key}, {value} FROM {table} WHERE id = {} AND {value} IS NOT NULL ORDER BY {key} DESC",
            self.dialect.placeholder(1)
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        sql
    }

    /// Binds: id.
    pub fn select_keys(&self, field: FieldName) -> String {
        let (table, key, value) = self.location(field);
        format!(
            "SELECT {key} FROM {table} WHERE id = {} AND {value} IS NOT NULL",
            self.dialect.placeholder(1)
        )
    }

    /// Binds: id, then each of the `count` keys.
    pub fn select_items(&self, field: FieldName, count: usize) -> String {
        let (table, key, value) = self.location(field);
        format!(
            "SELECT {key}, {value} FROM {table} WHERE id = {} AND {value} IS NOT NULL AND {key} IN ({})",
            self.dialect.placeholder(1),
            self.dialect.placeholders(2, count)
        )
    }

    /// Binds: id, key, value.
    pub fn upsert_item(&self, field: FieldName) -> String {
        let (table, key, value) = self.location(field);
        format!(
            "INSERT INTO {table} (id, {key}, {value}) VALUES ({}) {}",
            self.dialect.placeholders(1, 3),
            self.dialect.upsert(&format!("id, {key}"), &[value])
        )
    }

    /// Binds: id, key.
    pub fn delete_item(&self, field: FieldName) -> String {
        let (table, key, value) = self.location(field);
        let (id, key_param) = (self.dialect.placeholder(1), self.dialect.placeholder(2));
        match field.kind() {
            FieldKind::Turn => format!(
                "UPDATE {table} SET {value} = NULL WHERE id = {id} AND {key} = {key_param}"
            ),
            FieldKind::Keyed => format!("DELETE FROM {table} WHERE id = {id} AND {key} = {key_param}"),
        }
    }

    /// Binds: id, for each statement.
    pub fn delete_context(&self) -> Vec<String> {
        let id = self.dialect.placeholder(1);
        [&self.turns, &self.misc, &self.main]
            .iter()
            .map(|table| format!("DELETE FROM {} WHERE id = {}", table, id))
            .collect()
    }

    pub fn clear_all(&self) -> Vec<String> {
        [&self.turns, &self.misc, &self.main]
            .iter()
            .map(|table| format!("DELETE FROM {}", table))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_scheme() {
        assert_eq!(Dialect::from_scheme("postgresql+asyncpg"), Some(Dialect::Postgres));
        assert_eq!(Dialect::from_scheme("sqlite+aiosqlite"), Some(Dialect::Sqlite));
        assert_eq!(Dialect::from_scheme("mysql"), Some(Dialect::MySql));
        assert_eq!(Dialect::from_scheme("redis"), None);
    }

    #[test]
    fn test_upsert_main_per_dialect() {
        let pg = Statements::new(Dialect::Postgres, "ctx").unwrap();
        assert_eq!(
            pg.upsert_main(),
            "INSERT INTO ctx_main (id, current_turn_id, created_at, updated_at, framework_data) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (id) DO UPDATE SET \
             current_turn_id = excluded.current_turn_id, updated_at = excluded.updated_at, \
             framework_data = excluded.framework_data"
        );

        let mysql = Statements::new(Dialect::MySql, "ctx").unwrap();
        assert!(mysql
            .upsert_main()
            .ends_with("ON DUPLICATE KEY UPDATE current_turn_id = VALUES(current_turn_id), updated_at = VALUES(updated_at), framework_data = VALUES(framework_data)"));
        assert!(mysql.upsert_main().contains("VALUES (?, ?, ?, ?, ?)"));
    }

    #[test]
    fn test_turn_field_uses_its_own_column() {
        let sql = Statements::new(Dialect::Sqlite, "bot").unwrap();
        assert_eq!(
            sql.select_latest(FieldName::Requests, Some(3)),
            "SELECT turn_key, requests FROM bot_turns WHERE id = ?1 AND requests IS NOT NULL ORDER BY turn_key DESC LIMIT 3"
        );
        assert_eq!(
            sql.upsert_item(FieldName::Labels),
            "INSERT INTO bot_turns (id, turn_key, labels) VALUES (?1, ?2, ?3) ON CONFLICT (id, turn_key) DO UPDATE SET labels = excluded.labels"
        );
        assert_eq!(
            sql.delete_item(FieldName::Responses),
            "UPDATE bot_turns SET responses = NULL WHERE id = ?1 AND turn_key = ?2"
        );
    }

    #[test]
    fn test_misc_items_and_in_list() {
        let sql = Statements::new(Dialect::Postgres, "ctx").unwrap();
        assert_eq!(
            sql.select_items(FieldName::Misc, 3),
            "SELECT misc_key, misc_value FROM ctx_misc WHERE id = $1 AND misc_value IS NOT NULL AND misc_key IN ($2, $3, $4)"
        );
        assert_eq!(
            sql.delete_item(FieldName::Misc),
            "DELETE FROM ctx_misc WHERE id = $1 AND misc_key = $2"
        );
    }

    #[test]
    fn test_ddl_types() {
        let mysql = Statements::new(Dialect::MySql, "ctx").unwrap().create_tables();
        assert!(mysql[0].contains("id VARCHAR(255) PRIMARY KEY"));
        assert!(mysql[1].contains("labels LONGBLOB"));
        let pg = Statements::new(Dialect::Postgres, "ctx").unwrap().create_tables();
        assert!(pg[2].contains("misc_value BYTEA NOT NULL"));
    }

    #[test]
    fn test_prefix_is_validated() {
        assert!(Statements::new(Dialect::Sqlite, "ctx; DROP TABLE x").is_err());
        assert!(Statements::new(Dialect::Sqlite, "").is_err());
        assert!(Statements::new(Dialect::Sqlite, "tenant_42").is_ok());
    }
}
