//! Collaborator traits for remote command sessions
//!
//! The pool never speaks the wire protocol itself. It only needs something
//! that can open a session to the bound target, probe it, and close it.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::ConnectionError;

/// Captured result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: u32,
}

impl CommandOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// An opened, authenticated session able to run one command at a time
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Run a command and capture its output
    async fn execute(&self, command: &str) -> Result<CommandOutput, ConnectionError>;

    /// Report whether the session is still usable
    async fn health_check(&self) -> bool;

    /// Close the session
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Opens new sessions to the single target a pool is bound to
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: Connection;

    /// Establish and authenticate a new session
    async fn connect(&self) -> Result<Self::Conn, ConnectionError>;

    /// Human readable description of the target, used in log fields
    fn target(&self) -> String {
        "remote".to_string()
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a pooled connection, unique for the life of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
