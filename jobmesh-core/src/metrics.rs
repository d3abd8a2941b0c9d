//! Prometheus-style metrics for coordination activity
//!
//! Provides counters, gauges, and histograms. Rendering is text only; the
//! embedding service decides how to expose it.

use std::sync::atomic::{AtomicU64, AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: String,
    help: String,
}

impl Counter {
    /// Create a new counter
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: String,
    help: String,
}

impl Gauge {
    /// Create a new gauge
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Set value
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Histogram for latency measurements
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum: AtomicU64,
    count: AtomicU64,
    name: String,
    help: String,
}

impl Histogram {
    /// Create with default buckets
    pub fn new(name: &str, help: &str) -> Self {
        Self::with_buckets(
            name,
            help,
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
    }

    /// Create with custom buckets
    pub fn with_buckets(name: &str, help: &str, bounds: Vec<f64>) -> Self {
        let buckets = bounds
            .into_iter()
            .map(|b| (b, AtomicU64::new(0)))
            .collect();
        
        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Observe a value
    pub fn observe(&self, value: f64) {
        // Increment count
        self.count.fetch_add(1, Ordering::Relaxed);
        
        // Add to sum (as u64 micros for precision)
        let micros = (value * 1_000_000.0) as u64;
        self.sum.fetch_add(micros, Ordering::Relaxed);

        // Increment appropriate buckets
        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record an elapsed duration in seconds
    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    /// Elapsed time since `start`
    pub fn observe_since(&self, start: Instant) {
        self.observe_duration(start.elapsed());
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name, bound, count.load(Ordering::Relaxed)
            ));
        }

        let sum_secs = self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!(
            "{}_count {}\n",
            self.name,
            self.count.load(Ordering::Relaxed)
        ));

        output
    }
}

/// Standard coordination metrics, process-wide
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static LEADER_ELECTIONS_WON: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("jobmesh_leader_elections_won_total", "Elections won by this process")
    });

    pub static RESHARDING_PASSES: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("jobmesh_resharding_passes_total", "Resharding transactions committed")
    });

    pub static FAILOVER_ITEMS_FLAGGED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("jobmesh_failover_items_flagged_total", "Shard items queued for failover")
    });

    pub static FAILOVER_ITEMS_CLAIMED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("jobmesh_failover_items_claimed_total", "Failover items claimed locally")
    });

    pub static MISFIRES: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("jobmesh_misfires_total", "Fires deferred because items were still running")
    });

    pub static LIVE_INSTANCES: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("jobmesh_live_instances", "Instances seen by the last resharding pass")
    });

    pub static RESHARDING_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("jobmesh_resharding_duration_seconds", "Leader resharding latency")
    });
}

/// Render every standard metric in Prometheus text format
pub fn gather_system_metrics() -> String {
    let mut output = String::new();

    // Counters
    output.push_str(&standard::LEADER_ELECTIONS_WON.to_prometheus());
    output.push_str(&standard::RESHARDING_PASSES.to_prometheus());
    output.push_str(&standard::FAILOVER_ITEMS_FLAGGED.to_prometheus());
    output.push_str(&standard::FAILOVER_ITEMS_CLAIMED.to_prometheus());
    output.push_str(&standard::MISFIRES.to_prometheus());

    // Gauges
    output.push_str(&standard::LIVE_INSTANCES.to_prometheus());

    // Histograms
    output.push_str(&standard::RESHARDING_DURATION.to_prometheus());

    output
}
