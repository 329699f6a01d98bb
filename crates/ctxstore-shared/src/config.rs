//! Configuration management

use std::collections::BTreeMap;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::constants::{
    CONFIG_FILE, DEFAULT_ACQUIRE_TIMEOUT_SECONDS, DEFAULT_MAX_CONNECTIONS, DEFAULT_RETRY_ATTEMPTS,
    DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_TABLE_PREFIX, ENV_PREFIX,
};
use crate::error::AppError;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageSettings {
    /// `<scheme>://<address>`
    #[serde(default)]
    pub connection: String,
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    /// Per logical field overrides, keyed by field name.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSettings>,
    #[serde(default)]
    pub framework_data: FrameworkDataSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

/// Raw, unvalidated policy for one logical field.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct FieldSettings {
    pub subscript: Option<SubscriptSetting>,
    pub read: Option<String>,
    pub write: Option<String>,
}

/// `"all"`, an integer (negative = first N, non-negative = last N) or an explicit key list.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum SubscriptSetting {
    Count(i64),
    Keys(Vec<KeySetting>),
    Keyword(String),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum KeySetting {
    Turn(i64),
    Name(String),
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct FrameworkDataSettings {
    pub write: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout_seconds: DEFAULT_ACQUIRE_TIMEOUT_SECONDS,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

fn default_table_prefix() -> String {
    DEFAULT_TABLE_PREFIX.to_string()
}

impl StorageSettings {
    /// Settings with every default applied, for the given connection string.
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            table_prefix: default_table_prefix(),
            fields: BTreeMap::new(),
            framework_data: FrameworkDataSettings::default(),
            pool: PoolSettings::default(),
            retry: RetrySettings::default(),
        }
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, field: FieldSettings) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    /// Load from `config/ctxstore.*` (optional) and `CTXSTORE__*` environment variables.
    pub fn load() -> Result<Self, AppError> {
        Self::load_with(None, &Overrides::default())
    }

    /// Load from an explicit file, still letting the environment override it.
    pub fn load_from(path: &str) -> Result<Self, AppError> {
        Self::load_with(Some(path), &Overrides::default())
    }

    /// Load with command-line values taking precedence over file and environment.
    pub fn load_with(path: Option<&str>, overrides: &Overrides) -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name(CONFIG_FILE).required(false),
        };
        let config = Config::builder()
            .set_default("table_prefix", DEFAULT_TABLE_PREFIX)?
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("connection", overrides.connection.clone())?
            .set_override_option("table_prefix", overrides.table_prefix.clone())?
            .build()?;
        let settings: Self = config.try_deserialize()?;
        if settings.connection.trim().is_empty() {
            return Err(AppError::MissingConnection);
        }
        Ok(settings)
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub connection: Option<String>,
    pub table_prefix: Option<String>,
}
