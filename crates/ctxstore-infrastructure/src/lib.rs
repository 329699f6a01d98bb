//! # Context Storage Infrastructure
//!
//! Backend drivers for the `DbDriver` port and the factory that picks one
//! from a connection string. Each backend family sits behind a cargo
//! feature; the in-memory driver is always available.

pub mod blob;
pub mod database;
pub mod factory;

#[cfg(feature = "redis")]
pub mod cache;
#[cfg(feature = "mongodb")]
pub mod document;

pub use blob::BlobDriver;
pub use factory::{BackendDescriptor, BackendFamily, StorageFactory};
