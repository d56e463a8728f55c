//! Metric sample and metric type definitions

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Prometheus metric type
///
/// Query results only ever map to counters or gauges; histograms are used
/// solely by the exporter's self-metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricType {
    /// Gauge metric - a value that can go up and down
    #[default]
    Gauge,
    /// Counter metric - a monotonically increasing value
    Counter,
    /// Histogram metric - observations counted in buckets
    Histogram,
}

impl MetricType {
    /// Returns the Prometheus type string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
            MetricType::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MetricType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MetricType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_lowercase().as_str() {
            "gauge" => Ok(MetricType::Gauge),
            "counter" => Ok(MetricType::Counter),
            other => Err(serde::de::Error::custom(format!(
                "unsupported metric type '{}', expected 'gauge' or 'counter'",
                other
            ))),
        }
    }
}

/// One data point produced by a scrape
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// Metric name
    pub name: String,
    /// Metric type
    pub metric_type: MetricType,
    /// Help text
    pub help: Option<String>,
    /// Labels in declared order
    pub labels: Vec<(String, String)>,
    /// Sample value
    pub value: f64,
    /// Collection time (milliseconds since epoch)
    pub timestamp_ms: i64,
}

impl MetricSample {
    /// Create a new gauge sample stamped with the current time
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            metric_type: MetricType::Gauge,
            help: None,
            labels: Vec::new(),
            value,
            timestamp_ms: now_millis(),
        }
    }

    /// Set the metric type
    pub fn with_type(mut self, metric_type: MetricType) -> Self {
        self.metric_type = metric_type;
        self
    }

    /// Set help text
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Append a label, keeping declaration order
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    /// Set timestamp
    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Look up a label value by name
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Series identity within one target: metric name plus label set
    pub fn series_id(&self) -> SeriesId {
        let mut labels = self.labels.clone();
        labels.sort();
        SeriesId {
            name: self.name.clone(),
            labels,
        }
    }
}

/// Identity of a time series inside one scrape
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesId {
    /// Metric name
    pub name: String,
    /// Sorted label pairs
    pub labels: Vec<(String, String)>,
}

impl SeriesId {
    /// Render only the label part, e.g. `{a="1",b="2"}`
    pub fn labels_string(&self) -> String {
        let pairs: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{{{}}}", pairs.join(","))
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.labels_string())
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
