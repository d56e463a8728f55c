//! Configuration management for objserv-exporter
//!
//! Handles loading and validating configuration from YAML files, resolving
//! each target's query plan, and swapping the active configuration on reload.
//!
//! Target-level problems make a configuration invalid. Query-level problems
//! do not: a broken query definition is skipped with a warning when the
//! target's plan is resolved, so one bad entry cannot take the exporter down.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::exposition::MetricType;

/// Label added to every sample to identify the scraped target
pub const TARGET_LABEL: &str = "target";

/// Metric names produced by the engine itself for every scrape
pub const RESERVED_METRIC_NAMES: &[&str] = &["up", "scrape_duration_seconds"];

/// Upper bound of every configured or requested timeout
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Upper bound of `pool.max_size`
pub const MAX_POOL_SIZE: usize = 256;

static METRIC_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("invalid metric name regex"));

static LABEL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("invalid label name regex"));

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error reading the configuration file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing the configuration file
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation error
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// A single query definition is unusable
    #[error("Invalid query '{query}': {reason}")]
    InvalidQuery { query: String, reason: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Settings shared by all targets
    #[serde(default)]
    pub global: GlobalConfig,

    /// ObjectServer instances to scrape, in declaration order
    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    /// Query definitions, referenced by name from targets
    #[serde(default)]
    pub queries: Vec<QueryDefinition>,
}

/// Settings shared by all targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Scrape deadline used when the request does not carry one
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout_ms: u64,

    /// Safety margin subtracted from the Prometheus-supplied scrape timeout
    #[serde(default = "default_scrape_timeout_offset")]
    pub scrape_timeout_offset_ms: u64,

    /// Target scraped when the request names none
    #[serde(default)]
    pub default_target: Option<String>,
}

/// One ObjectServer instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Unique target name, rendered as the `target` label
    pub name: String,

    /// Base URL of the ObjectServer REST interface (e.g. http://omnibus:8080)
    pub url: String,

    /// Optional username for basic auth
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password for basic auth
    #[serde(default)]
    pub password: Option<String>,

    /// Connection pool sizing
    #[serde(default)]
    pub pool: PoolConfig,

    /// Maximum number of queries of one scrape running concurrently
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,

    /// Names of the queries to run; empty means every defined query
    #[serde(default)]
    pub queries: Vec<String>,
}

/// Connection pool sizing for a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of open connections
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,

    /// Upper bound on waiting for a connection, further capped by the scrape deadline
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// Idle connections older than this are closed instead of reused
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
}

/// A query and the rules mapping its rows to samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinition {
    /// Unique query name
    pub name: String,

    /// SQL text sent to the ObjectServer
    pub sql: String,

    /// Metric name of the produced samples
    pub metric: String,

    /// Metric type (gauge, counter)
    #[serde(rename = "type", default)]
    pub metric_type: MetricType,

    /// Optional help text
    #[serde(default)]
    pub help: Option<String>,

    /// Result columns used as labels, in output order
    #[serde(default)]
    pub labels: Vec<String>,

    /// Result column holding the sample value
    pub value: String,

    /// Constant labels added to every sample of this query
    #[serde(default)]
    pub static_labels: BTreeMap<String, String>,
}

// Default value functions
fn default_scrape_timeout() -> u64 {
    10_000
}

fn default_scrape_timeout_offset() -> u64 {
    500
}

fn default_fan_out() -> usize {
    1
}

fn default_pool_max_size() -> usize {
    2
}

fn default_acquire_timeout() -> u64 {
    5_000
}

fn default_idle_timeout() -> u64 {
    300_000
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            scrape_timeout_ms: default_scrape_timeout(),
            scrape_timeout_offset_ms: default_scrape_timeout_offset(),
            default_target: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            acquire_timeout_ms: default_acquire_timeout(),
            idle_timeout_ms: default_idle_timeout(),
        }
    }
}

impl GlobalConfig {
    /// Default scrape deadline
    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_millis(self.scrape_timeout_ms)
    }

    /// Margin subtracted from a Prometheus-supplied timeout
    pub fn scrape_timeout_offset(&self) -> Duration {
        Duration::from_millis(self.scrape_timeout_offset_ms)
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl TargetConfig {
    /// Create a target with default pool settings
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            username: None,
            password: None,
            pool: PoolConfig::default(),
            fan_out: default_fan_out(),
            queries: Vec::new(),
        }
    }
}

impl QueryDefinition {
    /// Create a gauge query with no labels
    pub fn new(
        name: impl Into<String>,
        sql: impl Into<String>,
        metric: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            metric: metric.into(),
            metric_type: MetricType::Gauge,
            help: None,
            labels: Vec::new(),
            value: value.into(),
            static_labels: BTreeMap::new(),
        }
    }

    /// Set the metric type
    pub fn with_type(mut self, metric_type: MetricType) -> Self {
        self.metric_type = metric_type;
        self
    }

    /// Append a label column
    pub fn with_label(mut self, column: impl Into<String>) -> Self {
        self.labels.push(column.into());
        self
    }

    /// Add a constant label
    pub fn with_static_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.static_labels.insert(key.into(), value.into());
        self
    }

    /// Set help text
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Check the definition can produce well-formed, unambiguous series
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidQuery {
            query: self.name.clone(),
            reason,
        };

        if self.sql.trim().is_empty() {
            return Err(invalid("sql must not be empty".to_string()));
        }
        if !METRIC_NAME_RE.is_match(&self.metric) {
            return Err(invalid(format!("invalid metric name '{}'", self.metric)));
        }
        if RESERVED_METRIC_NAMES.contains(&self.metric.as_str()) {
            return Err(invalid(format!("metric name '{}' is reserved", self.metric)));
        }
        if self.value.trim().is_empty() {
            return Err(invalid("value column must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for name in self.labels.iter().chain(self.static_labels.keys()) {
            if !LABEL_NAME_RE.is_match(name) || name.starts_with("__") {
                return Err(invalid(format!("invalid label name '{}'", name)));
            }
            if name == TARGET_LABEL {
                return Err(invalid(format!(
                    "label '{}' collides with the reserved target label",
                    name
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(invalid(format!("duplicate label '{}'", name)));
            }
        }

        if self.labels.iter().any(|l| l == &self.value) {
            return Err(invalid(format!(
                "column '{}' is used as both label and value",
                self.value
            )));
        }

        Ok(())
    }
}

fn check_timeout(field: &str, value_ms: u64) -> Result<(), ConfigError> {
    if Duration::from_millis(value_ms) > MAX_TIMEOUT {
        return Err(ConfigError::ValidationError(format!(
            "{} must not exceed {}ms",
            field,
            MAX_TIMEOUT.as_millis()
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate target-level settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one target must be configured".to_string(),
            ));
        }

        if self.global.scrape_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "global.scrape_timeout_ms must be greater than 0".to_string(),
            ));
        }
        check_timeout("global.scrape_timeout_ms", self.global.scrape_timeout_ms)?;
        check_timeout(
            "global.scrape_timeout_offset_ms",
            self.global.scrape_timeout_offset_ms,
        )?;

        let mut names = HashSet::new();
        for target in &self.targets {
            if target.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Target name must not be empty".to_string(),
                ));
            }
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate target name '{}'",
                    target.name
                )));
            }
            url::Url::parse(&target.url).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "Target '{}' has invalid url '{}': {}",
                    target.name, target.url, e
                ))
            })?;
            if target.pool.max_size == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Target '{}': pool.max_size must be greater than 0",
                    target.name
                )));
            }
            if target.pool.max_size > MAX_POOL_SIZE {
                return Err(ConfigError::ValidationError(format!(
                    "Target '{}': pool.max_size must not exceed {}",
                    target.name, MAX_POOL_SIZE
                )));
            }
            check_timeout(
                &format!("Target '{}': pool.acquire_timeout_ms", target.name),
                target.pool.acquire_timeout_ms,
            )?;
            if target.fan_out == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Target '{}': fan_out must be greater than 0",
                    target.name
                )));
            }
        }

        if let Some(default) = &self.global.default_target {
            if !names.contains(default.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "default_target '{}' is not a configured target",
                    default
                )));
            }
        }

        Ok(())
    }

    /// Look up a target by name
    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Name of the target scraped when a request names none
    ///
    /// Falls back to the only target when exactly one is configured.
    pub fn default_target(&self) -> Option<&str> {
        match &self.global.default_target {
            Some(name) => Some(name.as_str()),
            None if self.targets.len() == 1 => Some(self.targets[0].name.as_str()),
            None => None,
        }
    }

    /// Resolve the ordered, valid queries of a target
    ///
    /// Unknown references, duplicate definitions and invalid definitions are
    /// skipped with a warning.
    pub fn queries_for(&self, target: &TargetConfig) -> Vec<QueryDefinition> {
        let mut defined: Vec<&QueryDefinition> = Vec::new();
        for query in &self.queries {
            if defined.iter().any(|q| q.name == query.name) {
                warn!(query = %query.name, "Duplicate query definition; keeping the first one");
                continue;
            }
            defined.push(query);
        }

        let selected: Vec<&QueryDefinition> = if target.queries.is_empty() {
            defined
        } else {
            target
                .queries
                .iter()
                .filter_map(|name| {
                    let found = defined.iter().find(|q| &q.name == name).copied();
                    if found.is_none() {
                        warn!(target = %target.name, query = %name, "Unknown query reference; skipping");
                    }
                    found
                })
                .collect()
        };

        // One metric name renders under one TYPE line
        let mut types: HashMap<String, MetricType> = HashMap::new();
        selected
            .into_iter()
            .filter(|query| match query.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(target = %target.name, error = %e, "Skipping invalid query");
                    false
                }
            })
            .filter(|query| {
                let declared = *types
                    .entry(query.metric.clone())
                    .or_insert(query.metric_type);
                if declared != query.metric_type {
                    warn!(
                        target = %target.name,
                        query = %query.name,
                        metric = %query.metric,
                        "Metric already declared with type {}; skipping query",
                        declared.as_str()
                    );
                    return false;
                }
                true
            })
            .cloned()
            .collect()
    }

    /// Copy of the configuration with credentials masked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for target in &mut copy.targets {
            if target.password.is_some() {
                target.password = Some("<secret>".to_string());
            }
        }
        copy
    }
}

/// Shared handle on the active configuration
///
/// Readers take an `Arc` snapshot and keep using it for the whole scrape;
/// a reload swaps the pointer and never mutates a published snapshot.
#[derive(Debug)]
pub struct ConfigHandle {
    path: Option<PathBuf>,
    current: RwLock<Arc<Config>>,
}

impl ConfigHandle {
    /// Wrap an already-loaded configuration that cannot be reloaded
    pub fn new(config: Config) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Load the configuration file and remember its path for reloads
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Current configuration snapshot
    pub fn snapshot(&self) -> Arc<Config> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-read the configuration file and swap it in
    ///
    /// On error the active configuration is left untouched.
    pub fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        let path = self.path.as_ref().ok_or_else(|| {
            ConfigError::ValidationError("configuration was not loaded from a file".to_string())
        })?;
        let config = Arc::new(Config::load(path)?);
        self.replace(Arc::clone(&config));
        info!(path = %path.display(), targets = config.targets.len(), "Configuration reloaded");
        Ok(config)
    }

    /// Swap in a new configuration
    pub fn replace(&self, config: Arc<Config>) {
        match self.current.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}
