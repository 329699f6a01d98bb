//! # Context Storage Core
//!
//! Domain entities, the context schema, the storage driver port and the
//! storage service that ties them together.

pub mod domain;
pub mod serializer;
pub mod schema;
pub mod repositories;
pub mod services;
pub mod error;

// Re-export domain entities
pub use domain::*;
pub use error::{StorageError, StorageResult};
pub use repositories::DbDriver;
pub use schema::{ContextSchema, WriteReport};
pub use serializer::{JsonSerializer, Serializer};
pub use services::{ContextStorage, KeyedLocks};
