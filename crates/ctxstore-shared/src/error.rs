//! Application error types

use thiserror::Error;

/// Errors raised while assembling settings, before any backend is contacted.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("No connection string: pass --connection, set CTXSTORE__CONNECTION or add `connection` to the config file")]
    MissingConnection,
}
