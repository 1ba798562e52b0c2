//! Pool configuration options

use crate::errors::{PoolError, PoolResult};
use std::time::Duration;

/// Configuration for session pool behavior
///
/// # Examples
///
/// ```
/// use esox_sessionpool::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::new()
///     .with_max_idle(2)
///     .with_max_active(8)
///     .with_acquire_wait_timeout(Duration::from_secs(5))
///     .with_idle_timeout(Duration::from_secs(120));
///
/// assert_eq!(config.max_idle, 2);
/// assert_eq!(config.max_active, 8);
/// assert!(config.health_check_on_borrow);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Idle connections retained when unused
    pub max_idle: usize,

    /// Hard cap on concurrently borrowed connections, 0 means unbounded
    pub max_active: usize,

    /// Idle connections unused for longer than this are closed by maintenance
    #[cfg_attr(feature = "serde", serde(with = "duration_secs"))]
    pub idle_timeout: Duration,

    /// Maximum time an acquire waits for capacity
    #[cfg_attr(feature = "serde", serde(with = "duration_secs"))]
    pub acquire_wait_timeout: Duration,

    /// Probe idle connections before handing them out
    pub health_check_on_borrow: bool,

    /// Minimum time between two probes of the same connection
    ///
    /// A connection probed more recently than this is handed out without a
    /// new probe, so it may be stale by up to this long.
    #[cfg_attr(feature = "serde", serde(with = "duration_secs"))]
    pub health_check_interval: Duration,

    /// A probe that takes longer than this counts as unhealthy
    #[cfg_attr(feature = "serde", serde(with = "duration_secs"))]
    pub health_check_timeout: Duration,

    /// Period of the idle eviction sweep
    #[cfg_attr(feature = "serde", serde(with = "duration_secs"))]
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 5,
            max_active: 10,
            idle_timeout: Duration::from_secs(300),
            acquire_wait_timeout: Duration::from_secs(30),
            health_check_on_borrow: true,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of idle connections retained
    pub fn with_max_idle(mut self, count: usize) -> Self {
        self.max_idle = count;
        self
    }

    /// Set the cap on borrowed connections (0 = unbounded)
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_sessionpool::PoolConfig;
    ///
    /// let config = PoolConfig::new().with_max_active(0);
    /// assert!(config.is_unbounded());
    /// ```
    pub fn with_max_active(mut self, count: usize) -> Self {
        self.max_active = count;
        self
    }

    /// Set the idle eviction timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set how long acquire waits for capacity
    pub fn with_acquire_wait_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_wait_timeout = timeout;
        self
    }

    /// Enable or disable probing on borrow
    pub fn with_health_check_on_borrow(mut self, enabled: bool) -> Self {
        self.health_check_on_borrow = enabled;
        self
    }

    /// Set the minimum interval between probes of one connection
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the probe timeout
    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    /// Set the maintenance sweep period
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Whether the number of borrowed connections is uncapped
    pub fn is_unbounded(&self) -> bool {
        self.max_active == 0
    }

    /// Check the values a pool cannot run with
    pub fn validate(&self) -> PoolResult<()> {
        if self.maintenance_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "maintenance_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helper storing a `Duration` as (fractional) seconds
#[cfg(feature = "serde")]
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
