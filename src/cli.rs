//! CLI argument parsing for objserv-exporter
//!
//! This module provides the command-line interface using clap derive macros.
//!
//! # Options
//!
//! - `--config.file` / `-c`: Configuration file path (default: objserv_exporter.yml, env: OBJSERV_CONFIG, then CONFIG)
//! - `--web.listen-address`: Address to listen on (default: 0.0.0.0:9399, env: OBJSERV_LISTEN_ADDRESS)
//! - `--web.metrics-path`: Scrape endpoint path (default: /metrics, env: OBJSERV_METRICS_PATH)
//! - `--log-level` / `-l`: Log level (trace/debug/info/warn/error, env: OBJSERV_LOG_LEVEL)
//! - `--log-format`: Log output format (text/json, env: OBJSERV_LOG_FORMAT)
//! - `--validate`: Validate configuration and exit
//!
//! # Precedence
//!
//! CLI arguments win over environment variables, which win over defaults.
//! `RUST_LOG`, when set, replaces `--log-level` entirely.

use clap::{Parser, ValueEnum};
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Configuration file used when neither flag nor environment names one
pub const DEFAULT_CONFIG_FILE: &str = "objserv_exporter.yml";

/// Legacy environment variable still honoured for the configuration file
pub const LEGACY_CONFIG_ENV: &str = "CONFIG";

/// objserv-exporter - Prometheus exporter for ObjectServer
///
/// Runs configured SQL queries against ObjectServer targets on every
/// scrape and exports the results in Prometheus format.
#[derive(Parser, Debug)]
#[command(name = "objserv-exporter")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file [default: objserv_exporter.yml, fallback env: CONFIG]
    #[arg(
        short = 'c',
        long = "config.file",
        value_name = "FILE",
        env = "OBJSERV_CONFIG"
    )]
    pub config: Option<PathBuf>,

    /// Address to listen on for HTTP requests
    #[arg(
        long = "web.listen-address",
        value_name = "ADDRESS",
        default_value = "0.0.0.0:9399",
        env = "OBJSERV_LISTEN_ADDRESS"
    )]
    pub listen_address: SocketAddr,

    /// Path under which to expose scrape results
    #[arg(
        long = "web.metrics-path",
        value_name = "PATH",
        default_value = "/metrics",
        env = "OBJSERV_METRICS_PATH"
    )]
    pub metrics_path: String,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Log level
    #[arg(
        short,
        long,
        value_enum,
        default_value = "info",
        env = "OBJSERV_LOG_LEVEL"
    )]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "OBJSERV_LOG_FORMAT")]
    pub log_format: LogFormat,
}

impl Cli {
    /// Configuration file: flag, `OBJSERV_CONFIG`, `CONFIG`, then the default
    pub fn config_file(&self) -> PathBuf {
        self.config_file_or(std::env::var_os(LEGACY_CONFIG_ENV))
    }

    fn config_file_or(&self, legacy: Option<OsString>) -> PathBuf {
        self.config
            .clone()
            .or_else(|| legacy.filter(|v| !v.is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}

/// Log level options
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Trace level - most verbose
    Trace,
    /// Debug level
    Debug,
    /// Info level - default
    Info,
    /// Warn level
    Warn,
    /// Error level - least verbose
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Log output format
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}
