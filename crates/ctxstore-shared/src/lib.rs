//! # Context Storage Shared
//!
//! Configuration, telemetry and small helpers shared by the context storage crates.

pub mod constants;
pub mod utils;
pub mod telemetry;
pub mod config;
pub mod error;

pub use config::StorageSettings;
pub use error::AppError;
