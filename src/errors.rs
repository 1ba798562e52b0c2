//! Error types for the session pool

use std::time::Duration;
use thiserror::Error;

/// Errors returned by pool operations
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool is closed")]
    Closed,

    #[error("Timed out after {0:?} waiting for a free connection")]
    AcquireTimeout(Duration),

    #[error("Acquire was cancelled while waiting for a free connection")]
    AcquireCancelled,

    #[error("Failed to create connection: {0}")]
    ConnectionCreateFailed(#[source] ConnectionError),

    #[error("{failed} connection(s) failed to close during shutdown")]
    CloseFailed { failed: usize },

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Whether the caller may reasonably retry the operation
    ///
    /// Capacity errors are transient; a closed pool is terminal, and
    /// creation failures are left to the caller's own retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::AcquireTimeout(_) | PoolError::AcquireCancelled)
    }
}

/// Errors reported by a [`Connection`](crate::Connection) or its factory
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection to {0} failed")]
    Connect(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Command execution failed: {0}")]
    Execute(String),

    #[error("Connection is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PoolResult<T> = Result<T, PoolError>;
