//! Row to sample mapping
//!
//! A query definition names the label columns (in order) and the single value
//! column. Every row becomes at most one [`MetricSample`]:
//!
//! | value column        | outcome                             |
//! |---------------------|-------------------------------------|
//! | numeric / numeric text / boolean | sample                 |
//! | NULL                | row skipped, no error               |
//! | non-numeric text    | row dropped with `ValueCoercion`    |
//! | absent from the row | row dropped with `ValueCoercion`    |
//!
//! Label columns never drop a row: NULL or absent label values render as
//! the empty string so every sample of a query has the same label names.

use std::collections::HashSet;

use crate::config::QueryDefinition;
use crate::error::ScrapeError;
use crate::exposition::sample::now_millis;
use crate::exposition::{MetricSample, SeriesId};

use super::row::RawRow;

/// Result of mapping every row of one query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedRows {
    /// Samples in row order
    pub samples: Vec<MetricSample>,
    /// Row-level errors (dropped rows)
    pub errors: Vec<ScrapeError>,
    /// Rows seen
    pub rows: usize,
    /// Rows skipped because the value was NULL
    pub null_values: usize,
}

impl MappedRows {
    /// Query-level failure, if the query produced nothing from its rows
    ///
    /// An empty result set is a success. Rows that all failed or were all
    /// NULL make the query failed; the first row error is reported.
    pub fn failure(&self, query: &QueryDefinition) -> Option<ScrapeError> {
        if self.rows == 0 || !self.samples.is_empty() {
            return None;
        }
        Some(
            self.errors
                .first()
                .cloned()
                .unwrap_or_else(|| ScrapeError::ValueCoercion {
                    column: query.value.clone(),
                    value: "NULL".to_string(),
                }),
        )
    }
}

/// Converts raw rows into metric samples
#[derive(Debug, Clone, Copy)]
pub struct RowMapper {
    timestamp_ms: i64,
}

impl RowMapper {
    /// Mapper stamping samples with the current time
    pub fn new() -> Self {
        Self::with_timestamp(now_millis())
    }

    /// Mapper stamping samples with a fixed collection time
    pub fn with_timestamp(timestamp_ms: i64) -> Self {
        Self { timestamp_ms }
    }

    /// Map a single row
    ///
    /// `Ok(None)` means the value column is NULL and the row yields no sample.
    pub fn map(
        &self,
        row: &RawRow,
        query: &QueryDefinition,
    ) -> Result<Option<MetricSample>, ScrapeError> {
        let cell = row.get(&query.value).ok_or_else(|| ScrapeError::ValueCoercion {
            column: query.value.clone(),
            value: "<absent>".to_string(),
        })?;

        let value = match cell.to_f64() {
            None => return Ok(None),
            Some(Ok(v)) => v,
            Some(Err(())) => {
                return Err(ScrapeError::ValueCoercion {
                    column: query.value.clone(),
                    value: cell.describe(),
                })
            }
        };

        let mut labels = Vec::with_capacity(query.labels.len() + query.static_labels.len());
        for column in &query.labels {
            let label = row.get(column).map(|v| v.to_label()).unwrap_or_default();
            labels.push((column.clone(), label));
        }
        for (key, val) in &query.static_labels {
            labels.push((key.clone(), val.clone()));
        }

        Ok(Some(MetricSample {
            name: query.metric.clone(),
            metric_type: query.metric_type,
            help: query.help.clone(),
            labels,
            value,
            timestamp_ms: self.timestamp_ms,
        }))
    }

    /// Map all rows of a query, dropping duplicate series as they appear
    ///
    /// The first sample of a series is kept; later ones are recorded as
    /// `DuplicateSeries` and omitted.
    pub fn map_rows<I>(&self, rows: I, query: &QueryDefinition) -> MappedRows
    where
        I: IntoIterator<Item = RawRow>,
    {
        let mut mapped = MappedRows::default();
        let mut seen: HashSet<SeriesId> = HashSet::new();

        for row in rows {
            mapped.rows += 1;
            match self.map(&row, query) {
                Ok(Some(sample)) => {
                    let id = sample.series_id();
                    if seen.contains(&id) {
                        mapped.errors.push(ScrapeError::DuplicateSeries {
                            metric: id.name.clone(),
                            labels: id.labels_string(),
                        });
                    } else {
                        seen.insert(id);
                        mapped.samples.push(sample);
                    }
                }
                Ok(None) => mapped.null_values += 1,
                Err(e) => mapped.errors.push(e),
            }
        }

        mapped
    }
}

impl Default for RowMapper {
    fn default() -> Self {
        Self::new()
    }
}
