//! # EsoxSolutions.SessionPool
//!
//! Bounded, thread-safe pool of expensive remote command sessions (SSH
//! sessions to one host) shared by many concurrent tasks.
//!
//! ## Features
//!
//! - Hard cap on borrowed sessions with FIFO backpressure for callers
//! - LIFO reuse of idle sessions so a few stay warm and cold ones age out
//! - Throttled health checks on borrow; unhealthy sessions are replaced
//! - Background eviction of sessions idle past their budget
//! - Acquire timeout and cancellation without leaking queued slots
//! - Graceful, idempotent shutdown
//! - Stats snapshot, Prometheus export and collector
//!
//! ## Quick Start
//!
//! ```rust
//! use async_trait::async_trait;
//! use esox_sessionpool::{
//!     CommandOutput, Connection, ConnectionError, ConnectionFactory, ConnectionPool, PoolConfig,
//! };
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Connection for Echo {
//!     async fn execute(&self, command: &str) -> Result<CommandOutput, ConnectionError> {
//!         Ok(CommandOutput { stdout: command.to_string(), ..Default::default() })
//!     }
//!     async fn health_check(&self) -> bool { true }
//!     async fn close(&self) -> Result<(), ConnectionError> { Ok(()) }
//! }
//!
//! struct EchoFactory;
//!
//! #[async_trait]
//! impl ConnectionFactory for EchoFactory {
//!     type Conn = Echo;
//!     async fn connect(&self) -> Result<Echo, ConnectionError> { Ok(Echo) }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), esox_sessionpool::PoolError> {
//! let pool = ConnectionPool::new(EchoFactory, PoolConfig::default())?;
//!
//! let conn = pool.acquire().await?;
//! let output = conn.execute("hostname").await.unwrap();
//! assert_eq!(output.stdout, "hostname");
//! pool.release(conn).await;
//!
//! assert_eq!(pool.stats().idle, 1);
//! pool.close().await?;
//! # Ok(())
//! # }
//! ```

mod pool;
mod config;
mod connection;
mod handle;
mod waiter;
mod metrics;
mod health;
mod eviction;
mod errors;

pub use pool::{ConnectionPool, PooledConnection};
pub use config::PoolConfig;
#[cfg(feature = "serde")]
pub use config::duration_secs;
pub use connection::{CommandOutput, Connection, ConnectionFactory, ConnectionId};
pub use metrics::{MetricsExporter, PoolStats};
#[cfg(feature = "prometheus")]
pub use metrics::StatsCollector;
pub use health::HealthStatus;
pub use errors::{ConnectionError, PoolError, PoolResult};

pub use tokio_util::sync::CancellationToken;
