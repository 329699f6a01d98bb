//! Document-store family.

pub mod mongo;

pub use mongo::MongoDriver;
