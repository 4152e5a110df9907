//! Error taxonomy: configuration, connection, provisioning, and query failures.
//!
//! Only `ConfigError` (and listener/TLS setup failures surfaced as `io::Error`)
//! ever abort the process. Everything else is scoped to one tenant or one
//! (metric, tenant) pair and ends up as a log line plus missing observations.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::query::ColumnClass;

/// Invalid or unreadable configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Read { path: String, source: io::Error },

    #[error("invalid TOML in '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Failure to establish an authenticated session with a tenant database.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("server error during startup: {0}")]
    Server(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

/// Why a configured tenant never became ready.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("password unavailable: {0}")]
    Password(String),

    #[error("tls setup: {0}")]
    Tls(#[source] ConnectError),

    #[error("liveness check failed: {0}")]
    Ping(#[source] QueryError),

    #[error("usage/schema discovery failed: {0}")]
    Discovery(#[source] QueryError),
}

/// Failure while executing one statement or turning its rows into observations.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("connect: {0}")]
    Connect(#[from] ConnectError),

    #[error("server: {0}")]
    Server(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    #[error("connection pool closed")]
    PoolClosed,

    #[error("result has no columns")]
    NoColumns,

    #[error("first column '{column}' must be numeric, found {class}")]
    FirstColumnNotNumeric { column: String, class: ColumnClass },

    #[error("NULL value in row {row}, column '{column}'")]
    NullValue { row: usize, column: String },

    #[error("first column value '{value}' cannot be converted to f64")]
    InvalidFloat { value: String },

    #[error("label '{label}' appears more than once")]
    DuplicateLabel { label: String },
}

impl QueryError {
    /// True when the session that produced this error can no longer be reused.
    pub fn breaks_session(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Protocol(_))
    }
}
