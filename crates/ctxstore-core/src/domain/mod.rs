//! Domain entities

pub mod context;
pub mod field;
pub mod tracking;

pub use context::{next_timestamp, Context, MainInfo};
pub use field::{FieldConfig, FieldKey, FieldKind, FieldName, ReadPolicy, Subscript, WritePolicy};
pub use tracking::{Baseline, KnownKeys, SyncState};
