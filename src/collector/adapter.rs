//! Collector adapter between HTTP scrapes and the collection engine

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::config::{ConfigHandle, GlobalConfig, MAX_TIMEOUT, TARGET_LABEL};
use crate::error::{AppError, AppResult};
use crate::exposition::{MetricType, PrometheusFormatter};
use crate::metrics::ExporterMetrics;

use super::engine::{CollectionEngine, ScrapeResult};

/// Static description of a metric
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    pub name: String,
    pub help: String,
    pub metric_type: MetricType,
}

/// One incoming scrape
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeRequest {
    /// Requested target; `None` selects the default target
    pub target: Option<String>,
    /// Time the caller is willing to wait, as announced by the scraper
    pub timeout: Option<Duration>,
}

impl ScrapeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Pull-metrics collector contract
#[async_trait]
pub trait Collector: Send + Sync {
    /// Metrics known before collection
    fn describe(&self) -> Vec<MetricDescriptor>;

    /// Run one scrape
    async fn collect(&self, request: &ScrapeRequest) -> AppResult<ScrapeResult>;
}

/// Collector scraping configured ObjectServer targets
pub struct TargetCollector {
    config: Arc<ConfigHandle>,
    engine: CollectionEngine,
    metrics: Arc<ExporterMetrics>,
}

impl TargetCollector {
    pub fn new(
        config: Arc<ConfigHandle>,
        engine: CollectionEngine,
        metrics: Arc<ExporterMetrics>,
    ) -> Self {
        Self {
            config,
            engine,
            metrics,
        }
    }

    pub fn engine(&self) -> &CollectionEngine {
        &self.engine
    }

    /// Scrape and render in exposition format
    ///
    /// Every sample carries the `target` label.
    pub async fn scrape(&self, request: &ScrapeRequest) -> AppResult<String> {
        let result = self.collect(request).await?;
        Ok(render(&result))
    }
}

/// Render a scrape result with its `target` label
pub fn render(result: &ScrapeResult) -> String {
    PrometheusFormatter::new()
        .with_const_label(TARGET_LABEL, result.target.as_str())
        .format(&result.samples)
}

/// Scrape budget: the scraper's timeout minus the safety offset, else the configured default
pub fn scrape_timeout(global: &GlobalConfig, requested: Option<Duration>) -> Duration {
    requested
        .and_then(|t| t.checked_sub(global.scrape_timeout_offset()))
        .filter(|t| !t.is_zero())
        .unwrap_or_else(|| global.scrape_timeout())
        .min(MAX_TIMEOUT)
}

#[async_trait]
impl Collector for TargetCollector {
    /// Always empty: sample names and label sets come from query results and
    /// are only known once a scrape ran.
    fn describe(&self) -> Vec<MetricDescriptor> {
        Vec::new()
    }

    #[instrument(skip_all, fields(target = request.target.as_deref().unwrap_or("<default>")))]
    async fn collect(&self, request: &ScrapeRequest) -> AppResult<ScrapeResult> {
        // Held for the whole scrape; a reload swaps in a new snapshot for later scrapes
        let config = self.config.snapshot();

        let name = match &request.target {
            Some(name) => name.as_str(),
            None => config.default_target().ok_or(AppError::MissingTarget)?,
        };
        let target = config
            .target(name)
            .ok_or_else(|| AppError::UnknownTarget(name.to_string()))?;

        let queries = config.queries_for(target);
        let timeout = scrape_timeout(&config.global, request.timeout);
        debug!(
            target = %target.name,
            queries = queries.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Starting scrape"
        );

        let result = self.engine.collect(target, &queries, timeout).await;

        self.metrics.record_scrape(&result);
        self.metrics.update_pools(self.engine.manager().stats());

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_timeout_from_request() {
        let global = GlobalConfig::default();
        assert_eq!(
            scrape_timeout(&global, Some(Duration::from_secs(4))),
            Duration::from_millis(3500)
        );
    }

    #[test]
    fn test_scrape_timeout_falls_back_to_default() {
        let global = GlobalConfig::default();
        assert_eq!(scrape_timeout(&global, None), global.scrape_timeout());
        // Offset larger than the announced timeout
        assert_eq!(
            scrape_timeout(&global, Some(Duration::from_millis(300))),
            global.scrape_timeout()
        );
    }

    #[test]
    fn test_scrape_timeout_is_capped() {
        let global = GlobalConfig::default();
        assert_eq!(scrape_timeout(&global, Some(Duration::MAX)), MAX_TIMEOUT);

        let global = GlobalConfig {
            scrape_timeout_ms: u64::MAX,
            ..GlobalConfig::default()
        };
        assert_eq!(scrape_timeout(&global, None), MAX_TIMEOUT);
    }

    #[test]
    fn test_request_builder() {
        let request = ScrapeRequest::new()
            .with_target("NCOMS")
            .with_timeout(Duration::from_secs(2));
        assert_eq!(request.target.as_deref(), Some("NCOMS"));
        assert_eq!(request.timeout, Some(Duration::from_secs(2)));
    }
}
