//! Metric samples and Prometheus text exposition
//!
//! Samples are produced per scrape by the collection engine and rendered
//! here; nothing in this module is retained between scrapes.

pub mod formatter;
pub mod sample;

pub use formatter::{PrometheusFormatter, CONTENT_TYPE};
pub use sample::{MetricSample, MetricType, SeriesId};
