//! Application-wide constants

pub const DEFAULT_TABLE_PREFIX: &str = "ctx";
pub const DEFAULT_TURN_SUBSCRIPT: i64 = 3;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECONDS: u64 = 3;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 50;
pub const ENV_PREFIX: &str = "CTXSTORE";
pub const CONFIG_FILE: &str = "config/ctxstore";
pub const DEFAULT_DOCUMENT_DATABASE: &str = "ctxstore";
