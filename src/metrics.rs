//! Statistics collection and export for session pools

use std::collections::HashMap;
use std::time::Duration;

/// Point-in-time snapshot of a pool
///
/// # Examples
///
/// ```
/// use esox_sessionpool::PoolStats;
///
/// let stats = PoolStats { active: 2, idle: 1, total_created: 3, ..Default::default() };
/// let exported = stats.export();
/// assert_eq!(exported["active"], "2");
/// assert_eq!(exported["total_created"], "3");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolStats {
    /// Connections currently borrowed
    pub active: usize,

    /// Connections parked for reuse
    pub idle: usize,

    /// Callers queued for capacity
    pub waiting: usize,

    /// Cumulative time callers spent queued
    #[cfg_attr(feature = "serde", serde(with = "crate::config::duration_secs"))]
    pub total_wait_time: Duration,

    pub max_active: usize,

    pub max_idle: usize,

    pub total_created: u64,

    /// Connections closed by the pool for any reason
    pub total_closed: u64,

    pub total_acquired: u64,

    pub total_released: u64,

    /// Returned connections closed because idle was full
    pub closed_over_idle_cap: u64,

    /// Idle connections closed by maintenance
    pub evicted_idle: u64,

    pub health_check_failures: u64,

    pub create_failures: u64,

    pub acquire_timeouts: u64,

    pub acquire_cancellations: u64,

    pub closed: bool,
}

impl PoolStats {
    /// Export stats as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("active".to_string(), self.active.to_string());
        metrics.insert("idle".to_string(), self.idle.to_string());
        metrics.insert("waiting".to_string(), self.waiting.to_string());
        metrics.insert(
            "total_wait_time_ms".to_string(),
            self.total_wait_time.as_millis().to_string(),
        );
        metrics.insert("max_active".to_string(), self.max_active.to_string());
        metrics.insert("max_idle".to_string(), self.max_idle.to_string());
        metrics.insert("total_created".to_string(), self.total_created.to_string());
        metrics.insert("total_closed".to_string(), self.total_closed.to_string());
        metrics.insert("total_acquired".to_string(), self.total_acquired.to_string());
        metrics.insert("total_released".to_string(), self.total_released.to_string());
        metrics.insert(
            "closed_over_idle_cap".to_string(),
            self.closed_over_idle_cap.to_string(),
        );
        metrics.insert("evicted_idle".to_string(), self.evicted_idle.to_string());
        metrics.insert(
            "health_check_failures".to_string(),
            self.health_check_failures.to_string(),
        );
        metrics.insert("create_failures".to_string(), self.create_failures.to_string());
        metrics.insert("acquire_timeouts".to_string(), self.acquire_timeouts.to_string());
        metrics.insert(
            "acquire_cancellations".to_string(),
            self.acquire_cancellations.to_string(),
        );
        metrics
    }
}

type Extract = fn(&PoolStats) -> f64;

/// Every exported series: name, help, Prometheus type, value
const SERIES: [(&str, &str, &str, Extract); 12] = [
    ("sessionpool_connections_active", "Connections currently borrowed", "gauge", |s| s.active as f64),
    ("sessionpool_connections_idle", "Connections parked for reuse", "gauge", |s| s.idle as f64),
    ("sessionpool_waiters", "Callers queued for capacity", "gauge", |s| s.waiting as f64),
    ("sessionpool_wait_seconds_total", "Cumulative time callers spent queued", "counter", |s| {
        s.total_wait_time.as_secs_f64()
    }),
    ("sessionpool_connections_created_total", "Connections established", "counter", |s| s.total_created as f64),
    ("sessionpool_connections_closed_total", "Connections closed by the pool", "counter", |s| s.total_closed as f64),
    ("sessionpool_acquired_total", "Successful acquires", "counter", |s| s.total_acquired as f64),
    ("sessionpool_released_total", "Connections returned", "counter", |s| s.total_released as f64),
    ("sessionpool_evicted_idle_total", "Idle connections evicted by maintenance", "counter", |s| {
        s.evicted_idle as f64
    }),
    ("sessionpool_health_check_failures_total", "Failed health checks", "counter", |s| {
        s.health_check_failures as f64
    }),
    ("sessionpool_create_failures_total", "Failed connection attempts", "counter", |s| s.create_failures as f64),
    ("sessionpool_acquire_timeouts_total", "Acquires that timed out", "counter", |s| s.acquire_timeouts as f64),
];

/// Metrics exporter for Prometheus format
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export stats in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_sessionpool::{MetricsExporter, PoolStats};
    /// use std::collections::HashMap;
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("host".to_string(), "build-01".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&PoolStats::default(), "ssh", Some(&tags));
    /// assert!(output.contains("sessionpool_connections_active"));
    /// assert!(output.contains("host=\"build-01\""));
    /// ```
    pub fn export_prometheus(
        stats: &PoolStats,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let labels = Self::format_labels(pool_name, tags);
        let mut output = String::new();
        for (name, help, kind, extract) in SERIES {
            Self::push_metric(&mut output, name, help, kind, &labels, &extract(stats).to_string());
        }
        output
    }

    fn push_metric(output: &mut String, name: &str, help: &str, kind: &str, labels: &str, value: &str) {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} {}\n", name, kind));
        output.push_str(&format!("{}{{{}}} {}\n", name, labels, value));
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut sorted: Vec<_> = tags.iter().collect();
            sorted.sort();
            for (key, value) in sorted {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Internal cumulative counters, mutated only under the pool lock
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub total_wait_time: Duration,
    pub total_created: u64,
    pub total_closed: u64,
    pub total_acquired: u64,
    pub total_released: u64,
    pub closed_over_idle_cap: u64,
    pub evicted_idle: u64,
    pub health_check_failures: u64,
    pub create_failures: u64,
    pub acquire_timeouts: u64,
    pub acquire_cancellations: u64,
}

impl StatsCounters {
    pub fn record_wait(&mut self, waited: Duration) {
        self.total_wait_time += waited;
    }

    pub fn record_closed(&mut self, count: usize) {
        self.total_closed += count as u64;
    }

    /// Combine the counters with the live gauges into a snapshot
    pub fn snapshot(&self, active: usize, idle: usize, waiting: usize, max_active: usize, max_idle: usize, closed: bool) -> PoolStats {
        PoolStats {
            active,
            idle,
            waiting,
            total_wait_time: self.total_wait_time,
            max_active,
            max_idle,
            total_created: self.total_created,
            total_closed: self.total_closed,
            total_acquired: self.total_acquired,
            total_released: self.total_released,
            closed_over_idle_cap: self.closed_over_idle_cap,
            evicted_idle: self.evicted_idle,
            health_check_failures: self.health_check_failures,
            create_failures: self.create_failures,
            acquire_timeouts: self.acquire_timeouts,
            acquire_cancellations: self.acquire_cancellations,
            closed,
        }
    }
}

#[cfg(feature = "prometheus")]
pub use collector::StatsCollector;

#[cfg(feature = "prometheus")]
mod collector {
    use super::{Extract, PoolStats, SERIES};
    use prometheus::core::{Collector, Desc};
    use prometheus::proto::{Counter, Gauge, Metric, MetricFamily, MetricType};
    use std::collections::HashMap;

    struct Series {
        desc: Desc,
        kind: MetricType,
        extract: Extract,
    }

    /// Prometheus collector that snapshots a pool on every scrape
    ///
    /// Publishes the same series as [`MetricsExporter`](super::MetricsExporter).
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_sessionpool::{PoolStats, StatsCollector};
    ///
    /// let collector = StatsCollector::new("ssh", || PoolStats { idle: 4, ..Default::default() }).unwrap();
    /// let registry = prometheus::Registry::new();
    /// registry.register(Box::new(collector)).unwrap();
    ///
    /// let families = registry.gather();
    /// assert!(families.iter().any(|f| f.get_name() == "sessionpool_connections_idle"));
    /// ```
    pub struct StatsCollector {
        source: Box<dyn Fn() -> PoolStats + Send + Sync>,
        series: Vec<Series>,
    }

    impl StatsCollector {
        pub fn new<S>(pool_name: &str, source: S) -> prometheus::Result<Self>
        where
            S: Fn() -> PoolStats + Send + Sync + 'static,
        {
            let mut const_labels = HashMap::new();
            const_labels.insert("pool".to_string(), pool_name.to_string());

            let mut series = Vec::with_capacity(SERIES.len());
            for (name, help, kind, extract) in SERIES {
                let desc = Desc::new(name.to_string(), help.to_string(), Vec::new(), const_labels.clone())?;
                let kind = if kind == "counter" {
                    MetricType::COUNTER
                } else {
                    MetricType::GAUGE
                };
                series.push(Series { desc, kind, extract });
            }

            Ok(Self {
                source: Box::new(source),
                series,
            })
        }
    }

    impl Collector for StatsCollector {
        fn desc(&self) -> Vec<&Desc> {
            self.series.iter().map(|s| &s.desc).collect()
        }

        fn collect(&self) -> Vec<MetricFamily> {
            let stats = (self.source)();
            self.series
                .iter()
                .map(|series| {
                    let value = (series.extract)(&stats);
                    let mut metric = Metric::default();
                    metric.set_label(series.desc.const_label_pairs.clone().into());
                    if series.kind == MetricType::COUNTER {
                        let mut counter = Counter::default();
                        counter.set_value(value);
                        metric.set_counter(counter);
                    } else {
                        let mut gauge = Gauge::default();
                        gauge.set_value(value);
                        metric.set_gauge(gauge);
                    }

                    let mut family = MetricFamily::default();
                    family.set_name(series.desc.fq_name.clone());
                    family.set_help(series.desc.help.clone());
                    family.set_field_type(series.kind);
                    family.set_metric(vec![metric].into());
                    family
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_carries_counters() {
        let mut counters = StatsCounters::default();
        counters.total_created = 3;
        counters.record_closed(2);
        counters.record_wait(Duration::from_millis(40));
        counters.record_wait(Duration::from_millis(60));

        let stats = counters.snapshot(1, 0, 2, 4, 2, false);
        assert_eq!(stats.total_created, 3);
        assert_eq!(stats.total_closed, 2);
        assert_eq!(stats.total_wait_time, Duration::from_millis(100));
        assert_eq!(stats.waiting, 2);
        assert_eq!(stats.max_active, 4);
    }

    #[test]
    fn test_prometheus_labels_are_sorted() {
        let mut tags = HashMap::new();
        tags.insert("zone".to_string(), "b".to_string());
        tags.insert("env".to_string(), "prod".to_string());

        let output = MetricsExporter::export_prometheus(&PoolStats::default(), "ssh", Some(&tags));
        assert!(output.contains("sessionpool_waiters{pool=\"ssh\",env=\"prod\",zone=\"b\"} 0"));
        assert!(output.contains("# TYPE sessionpool_connections_created_total counter"));
    }

    #[cfg(feature = "prometheus")]
    #[test]
    fn test_collector_matches_text_export() {
        use prometheus::core::Collector;
        use prometheus::proto::MetricType;

        let stats = PoolStats {
            active: 2,
            total_created: 3,
            total_wait_time: Duration::from_millis(1500),
            ..Default::default()
        };
        let source = stats.clone();
        let collector = StatsCollector::new("ssh", move || source.clone()).unwrap();
        let families = collector.collect();
        let text = MetricsExporter::export_prometheus(&stats, "ssh", None);

        assert_eq!(families.len(), 12);
        for family in &families {
            let kind = if family.get_field_type() == MetricType::COUNTER { "counter" } else { "gauge" };
            assert!(text.contains(&format!("# TYPE {} {}", family.get_name(), kind)));
        }

        let wait = families
            .iter()
            .find(|f| f.get_name() == "sessionpool_wait_seconds_total")
            .unwrap();
        assert_eq!(wait.get_field_type(), MetricType::COUNTER);
        assert_eq!(wait.get_metric()[0].get_counter().get_value(), 1.5);
        assert!(text.contains("sessionpool_wait_seconds_total{pool=\"ssh\"} 1.5"));

        let active = families
            .iter()
            .find(|f| f.get_name() == "sessionpool_connections_active")
            .unwrap();
        assert_eq!(active.get_field_type(), MetricType::GAUGE);
        assert_eq!(active.get_metric()[0].get_gauge().get_value(), 2.0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_stats_serialize() {
        let stats = PoolStats {
            active: 1,
            total_wait_time: Duration::from_millis(250),
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["active"], 1);
        assert_eq!(json["total_wait_time"], 0.25);
    }
}
