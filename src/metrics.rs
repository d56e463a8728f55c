//! Exporter self-metrics
//!
//! Served on `/objserv_exporter_metrics`, separate from scrape output.
//!
//! # Metrics
//!
//! - `objserv_exporter_build_info{version,revision,branch}` - always 1
//! - `objserv_exporter_scrapes_total{target,status}` - scrapes by outcome
//! - `objserv_exporter_query_errors_total{target,query,kind}` - query and row errors
//! - `objserv_exporter_scrape_duration_seconds{target}` - histogram
//! - `objserv_exporter_pool_connections{target,state}` - open/idle pooled sessions
//! - `objserv_exporter_config_reloads_total` - successful reloads
//! - `objserv_exporter_config_last_reload_success_timestamp_seconds`

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::collector::{ScrapeResult, ScrapeStatus};
use crate::connection::PoolStats;
use crate::exposition::{MetricSample, MetricType, PrometheusFormatter};

/// Default histogram buckets for scrape duration (in seconds)
pub const DEFAULT_HISTOGRAM_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

const PREFIX: &str = "objserv_exporter";

/// Thread-safe counter using atomic operations
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe gauge; the f64 is stored as bits
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: f64) {
        self.value.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }

    /// Set the gauge to the current Unix timestamp
    pub fn set_to_current_time(&self) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.set(timestamp);
    }
}

/// Thread-safe histogram with cumulative buckets
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a histogram; a `+Inf` bucket is appended when missing
    pub fn new(buckets: &[f64]) -> Self {
        let mut sorted: Vec<f64> = buckets.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        if sorted.last().map(|v| !v.is_infinite()).unwrap_or(true) {
            sorted.push(f64::INFINITY);
        }

        let bucket_counts = (0..sorted.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets: sorted,
            bucket_counts,
            sum: AtomicU64::new(0.0_f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, v: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);

        loop {
            let current = self.sum.load(Ordering::Relaxed);
            let new = f64::from_bits(current) + v;
            if self
                .sum
                .compare_exchange_weak(current, new.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        for (i, &bound) in self.buckets.iter().enumerate() {
            if v <= bound {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Bucket upper bounds with their cumulative counts
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        self.buckets
            .iter()
            .zip(self.bucket_counts.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new(DEFAULT_HISTOGRAM_BUCKETS)
    }
}

/// Build metadata, fixed at compile time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: &'static str,
    pub revision: &'static str,
    pub branch: &'static str,
}

impl BuildInfo {
    /// Metadata of this binary; revision and branch come from the build environment
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            revision: option_env!("GIT_REVISION").unwrap_or("unknown"),
            branch: option_env!("GIT_BRANCH").unwrap_or("unknown"),
        }
    }
}

type ErrorKey = (String, String, &'static str);

/// Registry of the exporter's own metrics
///
/// Shared by every request handler. Label maps are ordered so output is stable.
#[derive(Debug)]
pub struct ExporterMetrics {
    build: BuildInfo,
    scrapes: RwLock<BTreeMap<(String, ScrapeStatus), Counter>>,
    query_errors: RwLock<BTreeMap<ErrorKey, Counter>>,
    durations: RwLock<BTreeMap<String, Histogram>>,
    pools: RwLock<Vec<(String, PoolStats)>>,
    config_reloads: Counter,
    last_reload_success: Gauge,
}

impl Default for ExporterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ExporterMetrics {
    /// Create the registry; the initial config load counts as the last successful reload
    pub fn new() -> Self {
        let metrics = Self {
            build: BuildInfo::current(),
            scrapes: RwLock::new(BTreeMap::new()),
            query_errors: RwLock::new(BTreeMap::new()),
            durations: RwLock::new(BTreeMap::new()),
            pools: RwLock::new(Vec::new()),
            config_reloads: Counter::new(),
            last_reload_success: Gauge::new(),
        };
        metrics.last_reload_success.set_to_current_time();
        metrics
    }

    pub fn build_info(&self) -> &BuildInfo {
        &self.build
    }

    /// Account for one finished scrape
    pub fn record_scrape(&self, result: &ScrapeResult) {
        write(&self.scrapes)
            .entry((result.target.clone(), result.status))
            .or_default()
            .inc();

        write(&self.durations)
            .entry(result.target.clone())
            .or_default()
            .observe(result.duration.as_secs_f64());

        let mut errors = write(&self.query_errors);
        if let Some(e) = &result.connection_error {
            errors
                .entry((result.target.clone(), String::new(), e.kind()))
                .or_default()
                .inc();
        }
        for (query, e) in result.errors() {
            errors
                .entry((result.target.clone(), query.to_string(), e.kind()))
                .or_default()
                .inc();
        }
    }

    /// Scrapes recorded for a target with the given status
    pub fn scrapes(&self, target: &str, status: ScrapeStatus) -> u64 {
        read(&self.scrapes)
            .get(&(target.to_string(), status))
            .map(Counter::get)
            .unwrap_or(0)
    }

    /// Errors recorded for a target/query/kind
    pub fn query_errors(&self, target: &str, query: &str, kind: &str) -> u64 {
        read(&self.query_errors)
            .iter()
            .filter(|((t, q, k), _)| t == target && q == query && *k == kind)
            .map(|(_, c)| c.get())
            .sum()
    }

    /// Replace the pool snapshot
    pub fn update_pools(&self, stats: Vec<(String, PoolStats)>) {
        *write(&self.pools) = stats;
    }

    /// Account for a successful configuration reload
    pub fn record_config_reload(&self) {
        self.config_reloads.inc();
        self.last_reload_success.set_to_current_time();
    }

    pub fn config_reloads(&self) -> u64 {
        self.config_reloads.get()
    }

    /// All self-metrics as samples
    pub fn samples(&self) -> Vec<MetricSample> {
        let mut samples = Vec::new();

        samples.push(
            MetricSample::new(format!("{}_build_info", PREFIX), 1.0)
                .with_help("Build information of objserv-exporter")
                .with_label("version", self.build.version)
                .with_label("revision", self.build.revision)
                .with_label("branch", self.build.branch),
        );

        for ((target, status), counter) in read(&self.scrapes).iter() {
            samples.push(
                MetricSample::new(format!("{}_scrapes_total", PREFIX), counter.get() as f64)
                    .with_type(MetricType::Counter)
                    .with_help("Scrapes by target and outcome")
                    .with_label("target", target.as_str())
                    .with_label("status", status.as_str()),
            );
        }

        for ((target, query, kind), counter) in read(&self.query_errors).iter() {
            samples.push(
                MetricSample::new(format!("{}_query_errors_total", PREFIX), counter.get() as f64)
                    .with_type(MetricType::Counter)
                    .with_help("Query and row errors by target, query and kind")
                    .with_label("target", target.as_str())
                    .with_label("query", query.as_str())
                    .with_label("kind", *kind),
            );
        }

        let name = format!("{}_scrape_duration_seconds", PREFIX);
        let help = "Scrape duration in seconds";
        for (target, histogram) in read(&self.durations).iter() {
            for (bound, count) in histogram.get_buckets() {
                let le = PrometheusFormatter::format_value(bound);
                samples.push(
                    MetricSample::new(format!("{}_bucket", name), count as f64)
                        .with_type(MetricType::Histogram)
                        .with_help(help)
                        .with_label("target", target.as_str())
                        .with_label("le", le),
                );
            }
            samples.push(
                MetricSample::new(format!("{}_sum", name), histogram.get_sum())
                    .with_type(MetricType::Histogram)
                    .with_help(help)
                    .with_label("target", target.as_str()),
            );
            samples.push(
                MetricSample::new(format!("{}_count", name), histogram.get_count() as f64)
                    .with_type(MetricType::Histogram)
                    .with_help(help)
                    .with_label("target", target.as_str()),
            );
        }

        for (target, stats) in read(&self.pools).iter() {
            for (state, value) in [("open", stats.open), ("idle", stats.idle)] {
                samples.push(
                    MetricSample::new(format!("{}_pool_connections", PREFIX), value as f64)
                        .with_help("Pooled ObjectServer sessions by state")
                        .with_label("target", target.as_str())
                        .with_label("state", state),
                );
            }
        }

        samples.push(
            MetricSample::new(
                format!("{}_config_reloads_total", PREFIX),
                self.config_reloads.get() as f64,
            )
            .with_type(MetricType::Counter)
            .with_help("Successful configuration reloads"),
        );
        samples.push(
            MetricSample::new(
                format!("{}_config_last_reload_success_timestamp_seconds", PREFIX),
                self.last_reload_success.get(),
            )
            .with_help("Time of the last successful configuration load"),
        );

        samples
    }

    /// Render all self-metrics in exposition format
    pub fn render(&self) -> String {
        PrometheusFormatter::new().format(&self.samples())
    }
}
