//! ObjectServer 메트릭 수집 모듈
//!
//! One scrape of one target runs through these pieces:
//!
//! - [`QueryRunner`] executes a configured query on a pooled connection
//! - [`RowMapper`] turns result rows into [`MetricSample`](crate::exposition::MetricSample)s
//! - [`CollectionEngine`] drives a whole scrape and adds `up`/`scrape_duration_seconds`
//! - [`TargetCollector`] resolves the requested target and hands results to the HTTP layer
//!
//! # Example
//!
//! ```ignore
//! use objserv_exporter::collector::{CollectionEngine, Collector, ScrapeRequest, TargetCollector};
//!
//! let engine = CollectionEngine::new(manager);
//! let collector = TargetCollector::new(config, engine, metrics);
//! let result = collector.collect(&ScrapeRequest::new().with_target("NCOMS")).await?;
//! ```

mod adapter;
mod engine;
mod mapper;
mod row;
mod runner;

pub use adapter::{
    render, scrape_timeout, Collector, MetricDescriptor, ScrapeRequest, TargetCollector,
};
pub use engine::{
    CollectionEngine, QueryReport, ScrapePhase, ScrapeResult, ScrapeStatus,
    SCRAPE_DURATION_METRIC, UP_METRIC,
};
pub use mapper::{MappedRows, RowMapper};
pub use row::{ColumnValue, RawRow};
pub use runner::{QueryRunner, Rows};
