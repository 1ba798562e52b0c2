//! Health checking of pooled connections and of the pool itself

use std::time::Duration;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::metrics::PoolStats;

/// When and how connections are probed on borrow
#[derive(Debug, Clone, Copy)]
pub(crate) struct HealthCheckPolicy {
    on_borrow: bool,
    interval: Duration,
    timeout: Duration,
}

impl HealthCheckPolicy {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            on_borrow: config.health_check_on_borrow,
            interval: config.health_check_interval,
            timeout: config.health_check_timeout,
        }
    }

    /// Whether a connection last probed at `last_checked` must be probed again
    ///
    /// Probes are throttled to one per `interval`; a zero interval probes on
    /// every borrow.
    pub fn needs_check(&self, last_checked: Instant, now: Instant) -> bool {
        self.on_borrow && now.saturating_duration_since(last_checked) >= self.interval
    }

    /// Probe a connection, treating a probe slower than the timeout as failed
    pub async fn probe<C: Connection>(&self, conn: &C) -> bool {
        tokio::time::timeout(self.timeout, conn.health_check())
            .await
            .unwrap_or(false)
    }
}

/// Health summary of a pool
///
/// # Examples
///
/// ```
/// use esox_sessionpool::{HealthStatus, PoolStats};
///
/// let stats = PoolStats { active: 1, idle: 2, max_active: 10, ..Default::default() };
/// let health = HealthStatus::from_stats(&stats);
/// assert!(health.is_healthy());
/// assert!((health.utilization - 0.1).abs() < f64::EPSILON);
/// ```
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Share of `max_active` currently borrowed (0.0 when unbounded)
    pub utilization: f64,

    pub idle_connections: usize,

    pub active_connections: usize,

    pub waiting_callers: usize,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    /// Derive the health summary from a stats snapshot
    pub fn from_stats(stats: &PoolStats) -> Self {
        let utilization = if stats.max_active > 0 {
            stats.active as f64 / stats.max_active as f64
        } else {
            0.0
        };

        let mut warnings = Vec::new();
        let mut is_healthy = !stats.closed;

        if stats.closed {
            warnings.push("Pool is closed".to_string());
        }

        if utilization > 0.9 {
            warnings.push(format!("High utilization: {:.1}%", utilization * 100.0));
            is_healthy = false;
        }

        // Callers queueing means the pool is saturated right now
        if stats.waiting > 0 {
            warnings.push(format!("{} caller(s) waiting for a connection", stats.waiting));
            is_healthy = false;
        }

        if stats.health_check_failures > 0 {
            warnings.push(format!(
                "{} connection(s) failed health checks",
                stats.health_check_failures
            ));
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            utilization,
            idle_connections: stats.idle,
            active_connections: stats.active,
            waiting_callers: stats.waiting,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}
