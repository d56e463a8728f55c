//! Prometheus Exposition Format output
//!
//! Renders [`MetricSample`]s into the text exposition format (version 0.0.4).
//!
//! ```text
//! # HELP <metric_name> <help_text>
//! # TYPE <metric_name> <type>
//! <metric_name>{<label1>="<value1>",<label2>="<value2>"} <value> [<timestamp>]
//! ```

use std::collections::HashMap;
use std::fmt::Write;

use super::sample::{MetricSample, MetricType};

/// Content type of the text exposition format
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Prometheus exposition format formatter
///
/// Constant labels (the scraped target, typically) are rendered before the
/// sample's own labels, which keep their declared order.
#[derive(Debug, Clone, Default)]
pub struct PrometheusFormatter {
    /// Include timestamp in output
    include_timestamp: bool,
    /// Labels prepended to every sample
    const_labels: Vec<(String, String)>,
}

impl PrometheusFormatter {
    /// Create a new formatter
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether to include timestamps in output
    pub fn with_timestamps(mut self, include: bool) -> Self {
        self.include_timestamp = include;
        self
    }

    /// Add a label rendered on every sample
    pub fn with_const_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.const_labels.push((key.into(), value.into()));
        self
    }

    /// Format samples into Prometheus exposition format
    ///
    /// HELP and TYPE lines are emitted once per metric name. Samples sharing
    /// a name are grouped at the position of the name's first occurrence;
    /// row order inside a group is preserved.
    pub fn format(&self, samples: &[MetricSample]) -> String {
        let mut output = String::with_capacity(samples.len() * 96);

        for (name, group) in Self::group_by_name(samples) {
            let head = group[0];
            if let Some(help) = &head.help {
                let _ = writeln!(output, "# HELP {} {}", name, Self::escape_help(help));
            }
            let _ = writeln!(output, "# TYPE {} {}", name, head.metric_type.as_str());

            for sample in group {
                self.write_sample_line(&mut output, sample);
            }
        }

        output
    }

    /// Group samples by family name, preserving order of first occurrence
    fn group_by_name(samples: &[MetricSample]) -> Vec<(&str, Vec<&MetricSample>)> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut groups: Vec<(&str, Vec<&MetricSample>)> = Vec::new();

        for sample in samples {
            let family = Self::family_name(sample);
            match index.get(family) {
                Some(&i) => groups[i].1.push(sample),
                None => {
                    index.insert(family, groups.len());
                    groups.push((family, vec![sample]));
                }
            }
        }

        groups
    }

    /// Histogram series share the HELP/TYPE header of their base name
    fn family_name(sample: &MetricSample) -> &str {
        if sample.metric_type == MetricType::Histogram {
            for suffix in ["_bucket", "_sum", "_count"] {
                if let Some(base) = sample.name.strip_suffix(suffix) {
                    return base;
                }
            }
        }
        &sample.name
    }

    fn write_sample_line(&self, output: &mut String, sample: &MetricSample) {
        output.push_str(&sample.name);

        let labels: Vec<&(String, String)> =
            self.const_labels.iter().chain(sample.labels.iter()).collect();
        if !labels.is_empty() {
            output.push('{');
            for (i, (k, v)) in labels.iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                let _ = write!(output, "{}=\"{}\"", k, Self::escape_label_value(v));
            }
            output.push('}');
        }

        output.push(' ');
        output.push_str(&Self::format_value(sample.value));

        if self.include_timestamp {
            let _ = write!(output, " {}", sample.timestamp_ms);
        }
        output.push('\n');
    }

    /// Format a numeric value for Prometheus
    ///
    /// - NaN → "NaN", ±Inf → "+Inf"/"-Inf"
    /// - Integral values are printed without a decimal point
    /// - Large/small floats use scientific notation
    pub(crate) fn format_value(value: f64) -> String {
        if value.is_nan() {
            "NaN".to_string()
        } else if value.is_infinite() {
            if value.is_sign_positive() {
                "+Inf".to_string()
            } else {
                "-Inf".to_string()
            }
        } else if value.fract() == 0.0 && value.abs() < 1e15 {
            format!("{}", value as i64)
        } else if value.abs() >= 1e15 || (value.abs() < 1e-3 && value != 0.0) {
            format!("{:e}", value)
        } else {
            format!("{}", value)
        }
    }

    /// Escape help text (backslash and newline)
    fn escape_help(help: &str) -> String {
        help.replace('\\', "\\\\").replace('\n', "\\n")
    }

    /// Escape label value (backslash, double-quote and newline)
    fn escape_label_value(value: &str) -> String {
        let mut escaped = String::with_capacity(value.len());
        for c in value.chars() {
            match c {
                '\\' => escaped.push_str("\\\\"),
                '"' => escaped.push_str("\\\""),
                '\n' => escaped.push_str("\\n"),
                _ => escaped.push(c),
            }
        }
        escaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_simple_metric() {
        let samples = vec![MetricSample::new("objserv_alerts", 42.0)
            .with_type(MetricType::Gauge)
            .with_help("Alerts in alerts.status")];

        let output = PrometheusFormatter::new().format(&samples);

        assert!(output.contains("# HELP objserv_alerts Alerts in alerts.status"));
        assert!(output.contains("# TYPE objserv_alerts gauge"));
        assert!(output.contains("objserv_alerts 42\n"));
    }

    #[test]
    fn test_const_label_comes_first() {
        let samples = vec![MetricSample::new("objserv_alerts", 3.0)
            .with_label("Severity", "5")
            .with_label("Node", "host1")];

        let output = PrometheusFormatter::new()
            .with_const_label("target", "NCOMS")
            .format(&samples);

        assert!(output.contains("objserv_alerts{target=\"NCOMS\",Severity=\"5\",Node=\"host1\"} 3"));
    }

    #[test]
    fn test_help_and_type_once_per_name() {
        let samples = vec![
            MetricSample::new("objserv_events_total", 10.0)
                .with_type(MetricType::Counter)
                .with_help("Events")
                .with_label("class", "a"),
            MetricSample::new("objserv_other", 1.0),
            MetricSample::new("objserv_events_total", 20.0)
                .with_type(MetricType::Counter)
                .with_help("Events")
                .with_label("class", "b"),
        ];

        let output = PrometheusFormatter::new().format(&samples);

        assert_eq!(output.matches("# HELP objserv_events_total").count(), 1);
        assert_eq!(output.matches("# TYPE objserv_events_total").count(), 1);
        let a = output.find("class=\"a\"").unwrap();
        let b = output.find("class=\"b\"").unwrap();
        let other = output.find("objserv_other 1").unwrap();
        assert!(a < b && b < other);
    }

    #[test]
    fn test_format_with_timestamp() {
        let samples = vec![MetricSample::new("m", 42.0).with_timestamp(1609459200000)];

        let with = PrometheusFormatter::new().with_timestamps(true).format(&samples);
        let without = PrometheusFormatter::new().format(&samples);

        assert!(with.contains("m 42 1609459200000\n"));
        assert!(without.contains("m 42\n"));
    }

    #[test]
    fn test_format_value() {
        assert_eq!(PrometheusFormatter::format_value(f64::NAN), "NaN");
        assert_eq!(PrometheusFormatter::format_value(f64::INFINITY), "+Inf");
        assert_eq!(PrometheusFormatter::format_value(f64::NEG_INFINITY), "-Inf");
        assert_eq!(PrometheusFormatter::format_value(-100.0), "-100");
        assert_eq!(PrometheusFormatter::format_value(0.5), "0.5");
        assert!(PrometheusFormatter::format_value(1.23e-6).contains('e'));
    }

    #[test]
    fn test_escape_label_value() {
        let samples = vec![MetricSample::new("m", 1.0).with_label("summary", "a\"b\\c\nd")];
        let output = PrometheusFormatter::new().format(&samples);
        assert!(output.contains(r#"m{summary="a\"b\\c\nd"} 1"#));
    }

    #[test]
    fn test_histogram_series_share_header() {
        let samples = vec![
            MetricSample::new("d_seconds_bucket", 1.0)
                .with_type(MetricType::Histogram)
                .with_help("Durations")
                .with_label("le", "+Inf"),
            MetricSample::new("d_seconds_sum", 0.5)
                .with_type(MetricType::Histogram)
                .with_help("Durations"),
            MetricSample::new("d_seconds_count", 1.0)
                .with_type(MetricType::Histogram)
                .with_help("Durations"),
        ];
        let output = PrometheusFormatter::new().format(&samples);

        assert_eq!(output.matches("# TYPE").count(), 1);
        assert!(output.starts_with("# HELP d_seconds Durations\n# TYPE d_seconds histogram\n"));
        assert!(output.contains("d_seconds_sum 0.5\n"));
    }

    #[test]
    fn test_format_empty() {
        assert!(PrometheusFormatter::new().format(&[]).is_empty());
    }
}
