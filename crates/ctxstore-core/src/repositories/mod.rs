//! Storage driver trait (port)

pub mod driver;

pub use driver::{DbDriver, FieldItems};

#[cfg(test)]
pub use driver::MockDbDriver;
