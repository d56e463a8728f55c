//! Query execution with a deadline

use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::config::QueryDefinition;
use crate::connection::{Connection, ResultSet};
use crate::error::ScrapeError;

use super::row::RawRow;

/// Rows produced by one query run
///
/// Finite and in server order. The connection interface delivers whole
/// result sets, so rows are already buffered when the iterator is handed out.
#[derive(Debug, Default)]
pub struct Rows {
    columns: Vec<String>,
    rows: std::vec::IntoIter<RawRow>,
}

impl Rows {
    /// Column names as reported by the server
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl From<ResultSet> for Rows {
    fn from(result: ResultSet) -> Self {
        Self {
            columns: result.columns,
            rows: result.rows.into_iter(),
        }
    }
}

impl Iterator for Rows {
    type Item = RawRow;

    fn next(&mut self) -> Option<RawRow> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for Rows {}

/// Runs one configured query on a connection
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryRunner;

impl QueryRunner {
    pub fn new() -> Self {
        Self
    }

    /// Execute `query` on `conn`, abandoning the call at `deadline`
    ///
    /// Failures come back classified: `Timeout` when the deadline passed,
    /// `Protocol` when the session broke, `Query` when the server refused the
    /// statement. Only the first two leave the connection unusable, except a
    /// `Timeout(Some(0))` returned for a deadline that had already passed:
    /// then the connection was never used.
    #[instrument(skip_all, fields(query = %query.name, conn_id = conn.id()))]
    pub async fn run(
        &self,
        conn: &mut dyn Connection,
        query: &QueryDefinition,
        deadline: Instant,
    ) -> Result<Rows, ScrapeError> {
        let started = Instant::now();
        if started >= deadline {
            return Err(ScrapeError::Timeout(Some(0)));
        }
        // Rounded up: a zero budget is reserved for queries never sent
        let budget_ms = ((deadline - started).as_millis() as u64).max(1);

        match tokio::time::timeout_at(deadline, conn.execute(&query.sql)).await {
            Ok(Ok(result)) => {
                debug!(
                    rows = result.rows.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Query completed"
                );
                Ok(Rows::from(result))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ScrapeError::timeout_with_duration(budget_ms)),
        }
    }
}
