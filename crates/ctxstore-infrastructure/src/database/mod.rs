//! Relational and distributed table families.

#[cfg(any(feature = "sql", feature = "distributed"))]
pub mod connection;
#[cfg(any(feature = "sql", feature = "distributed"))]
pub mod statements;

#[cfg(feature = "sql")]
pub mod sql_driver;

#[cfg(feature = "distributed")]
pub mod cockroach;
#[cfg(feature = "distributed")]
pub mod retry;

#[cfg(any(feature = "sql", feature = "distributed"))]
pub use statements::{Dialect, Statements};

#[cfg(feature = "sql")]
pub use sql_driver::SqlDriver;

#[cfg(feature = "distributed")]
pub use cockroach::CockroachDriver;
