// ============================================================================
// Context Storage Infrastructure - Storage Factory
// File: crates/ctxstore-infrastructure/src/factory.rs
// Description: Connection-string scheme -> backend driver
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use ctxstore_core::error::{StorageError, StorageResult};
use ctxstore_core::repositories::DbDriver;
use ctxstore_core::schema::ContextSchema;
use ctxstore_core::services::ContextStorage;
use ctxstore_shared::utils::{mask_credentials, split_scheme};
use ctxstore_shared::StorageSettings;

use crate::blob::BlobDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFamily {
    FileBlob,
    Relational,
    DocumentStore,
    KeyValue,
    DistributedTable,
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendFamily::FileBlob => "file-blob",
            BackendFamily::Relational => "relational",
            BackendFamily::DocumentStore => "document-store",
            BackendFamily::KeyValue => "key-value",
            BackendFamily::DistributedTable => "distributed-table",
        })
    }
}

/// One entry of the capability registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub name: &'static str,
    pub family: BackendFamily,
    pub schemes: &'static [&'static str],
    /// Cargo feature that compiles the backend in.
    pub feature: &'static str,
    pub available: bool,
    /// Whether `<scheme>+<driver>` is accepted.
    pub accepts_driver_suffix: bool,
}

impl BackendDescriptor {
    fn matches(&self, scheme: &str) -> bool {
        if self.schemes.contains(&scheme) {
            return true;
        }
        self.accepts_driver_suffix
            && scheme
                .split_once('+')
                .is_some_and(|(base, driver)| !driver.is_empty() && self.schemes.contains(&base))
    }
}

fn registry() -> Vec<BackendDescriptor> {
    vec![
        BackendDescriptor {
            name: "memory",
            family: BackendFamily::FileBlob,
            schemes: &["memory"],
            feature: "(always)",
            available: true,
            accepts_driver_suffix: false,
        },
        BackendDescriptor {
            name: "json",
            family: BackendFamily::FileBlob,
            schemes: &["json"],
            feature: "json",
            available: cfg!(feature = "json"),
            accepts_driver_suffix: false,
        },
        BackendDescriptor {
            name: "sqlite",
            family: BackendFamily::Relational,
            schemes: &["sqlite"],
            feature: "sqlite",
            available: cfg!(feature = "sqlite"),
            accepts_driver_suffix: true,
        },
        BackendDescriptor {
            name: "postgres",
            family: BackendFamily::Relational,
            schemes: &["postgres", "postgresql"],
            feature: "postgres",
            available: cfg!(feature = "postgres"),
            accepts_driver_suffix: true,
        },
        BackendDescriptor {
            name: "mysql",
            family: BackendFamily::Relational,
            schemes: &["mysql"],
            feature: "mysql",
            available: cfg!(feature = "mysql"),
            accepts_driver_suffix: true,
        },
        BackendDescriptor {
            name: "mongodb",
            family: BackendFamily::DocumentStore,
            schemes: &["mongodb", "mongodb+srv"],
            feature: "mongodb",
            available: cfg!(feature = "mongodb"),
            accepts_driver_suffix: false,
        },
        BackendDescriptor {
            name: "redis",
            family: BackendFamily::KeyValue,
            schemes: &["redis", "rediss"],
            feature: "redis",
            available: cfg!(feature = "redis"),
            accepts_driver_suffix: false,
        },
        BackendDescriptor {
            name: "cockroachdb",
            family: BackendFamily::DistributedTable,
            schemes: &["cockroachdb", "cockroachdbs"],
            feature: "distributed",
            available: cfg!(feature = "distributed"),
            accepts_driver_suffix: false,
        },
    ]
}

/// Builds drivers and storage services from connection strings.
#[derive(Debug, Clone)]
pub struct StorageFactory {
    backends: Vec<BackendDescriptor>,
}

impl Default for StorageFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageFactory {
    pub fn new() -> Self {
        Self { backends: registry() }
    }

    pub fn backends(&self) -> &[BackendDescriptor] {
        &self.backends
    }

    pub fn supported_schemes(&self) -> Vec<&'static str> {
        self.backends
            .iter()
            .flat_map(|b| b.schemes.iter().copied())
            .collect()
    }

    /// Descriptor for a connection string, whether or not it is compiled in.
    pub fn resolve(&self, connection: &str) -> StorageResult<&BackendDescriptor> {
        let (scheme, _) = split_scheme(connection).ok_or_else(|| {
            StorageError::invalid_config(format!(
                "connection string '{}' must look like <scheme>://<address>",
                mask_credentials(connection)
            ))
        })?;
        self.backends
            .iter()
            .find(|b| b.matches(scheme))
            .ok_or_else(|| StorageError::UnsupportedScheme {
                scheme: scheme.to_string(),
                supported: self.supported_schemes().join(", "),
            })
    }

    /// Construct and ping the driver named by `settings.connection`.
    pub async fn connect(&self, settings: &StorageSettings) -> StorageResult<Arc<dyn DbDriver>> {
        let descriptor = self.resolve(&settings.connection)?;
        if !descriptor.available {
            warn!(
                "Backend {} requested but the '{}' feature is not compiled in",
                descriptor.name, descriptor.feature
            );
            return Err(StorageError::capability_missing(
                descriptor.name,
                format!(
                    "rebuild ctxstore-infrastructure with the '{}' feature",
                    descriptor.feature
                ),
            ));
        }

        info!(
            "Connecting {} backend ({}) at {}",
            descriptor.name,
            descriptor.family,
            mask_credentials(&settings.connection)
        );
        let driver = open_driver(descriptor.name, settings).await?;
        Ok(driver)
    }

    /// Driver plus the schema built from the same settings.
    pub async fn open(&self, settings: &StorageSettings) -> StorageResult<ContextStorage> {
        let schema = ContextSchema::from_settings(settings)?;
        let driver = self.connect(settings).await?;
        Ok(ContextStorage::new(driver, schema))
    }
}

async fn open_driver(name: &'static str, settings: &StorageSettings) -> StorageResult<Arc<dyn DbDriver>> {
    match name {
        "memory" => Ok(Arc::new(BlobDriver::memory())),
        #[cfg(feature = "json")]
        "json" => {
            let path = split_scheme(&settings.connection)
                .map(|(_, address)| address)
                .unwrap_or_default();
            Ok(Arc::new(BlobDriver::open_json(path).await?))
        }
        #[cfg(feature = "sql")]
        "sqlite" | "postgres" | "mysql" => {
            Ok(Arc::new(crate::database::SqlDriver::connect(settings).await?))
        }
        #[cfg(feature = "mongodb")]
        "mongodb" => Ok(Arc::new(crate::document::MongoDriver::connect(settings).await?)),
        #[cfg(feature = "redis")]
        "redis" => Ok(Arc::new(crate::cache::RedisDriver::connect(settings).await?)),
        #[cfg(feature = "distributed")]
        "cockroachdb" => Ok(Arc::new(crate::database::CockroachDriver::connect(settings).await?)),
        other => Err(StorageError::capability_missing(
            other,
            "backend is registered but has no constructor in this build",
        )),
    }
}
