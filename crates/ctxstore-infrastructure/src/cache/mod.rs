//! Key-value/hash family.

pub mod redis_driver;

pub use redis_driver::{KeyLayout, RedisDriver};
