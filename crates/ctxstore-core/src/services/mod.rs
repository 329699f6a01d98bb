//! Domain services

pub mod context_storage;
pub mod locks;

pub use context_storage::ContextStorage;
pub use locks::{KeyedGuard, KeyedLocks};
