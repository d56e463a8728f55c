//! Collection engine - one scrape of one target
//!
//! A scrape moves through `Idle → Connecting → Querying → Mapping → Done`.
//! Connecting checks a connection out of the target's pool; failing that,
//! the scrape ends immediately with `up 0`. Querying runs the target's
//! queries on up to `fan_out` connections. Mapping turns the buffered rows
//! into samples in configuration order. `up` and `scrape_duration_seconds`
//! are always appended last.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{QueryDefinition, TargetConfig};
use crate::connection::{deadline_after, ConnectionManager, PooledConnection};
use crate::error::ScrapeError;
use crate::exposition::sample::now_millis;
use crate::exposition::{MetricSample, SeriesId};

use super::mapper::RowMapper;
use super::runner::{QueryRunner, Rows};

/// Meta-metric: whether the target connection was usable
pub const UP_METRIC: &str = "up";

/// Meta-metric: scrape duration
pub const SCRAPE_DURATION_METRIC: &str = "scrape_duration_seconds";

/// Final outcome of a scrape
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScrapeStatus {
    /// Every query succeeded
    Success,
    /// Some queries failed
    Partial,
    /// No query succeeded, or no connection
    Failed,
}

impl ScrapeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeStatus::Success => "success",
            ScrapeStatus::Partial => "partial",
            ScrapeStatus::Failed => "failed",
        }
    }

    fn from_counts(total: usize, failed: usize) -> Self {
        if failed == 0 {
            ScrapeStatus::Success
        } else if failed < total {
            ScrapeStatus::Partial
        } else {
            ScrapeStatus::Failed
        }
    }
}

impl fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scrape state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapePhase {
    Idle,
    Connecting,
    Querying,
    Mapping,
    Done(ScrapeStatus),
}

impl ScrapePhase {
    /// Whether `next` is a legal successor of this phase
    pub fn can_advance_to(&self, next: ScrapePhase) -> bool {
        matches!(
            (self, next),
            (ScrapePhase::Idle, ScrapePhase::Connecting)
                | (ScrapePhase::Connecting, ScrapePhase::Querying)
                | (ScrapePhase::Connecting, ScrapePhase::Done(ScrapeStatus::Failed))
                | (ScrapePhase::Querying, ScrapePhase::Mapping)
                | (ScrapePhase::Mapping, ScrapePhase::Done(_))
        )
    }
}

/// Outcome of one query within a scrape
#[derive(Debug, Clone, PartialEq)]
pub struct QueryReport {
    /// Query name
    pub query: String,
    /// Samples contributed
    pub samples: usize,
    /// Rows dropped (coercion failures, duplicate series)
    pub row_errors: Vec<ScrapeError>,
    /// Set when the query failed as a whole
    pub failure: Option<ScrapeError>,
    /// Execution time, excluding mapping
    pub duration: Duration,
}

impl QueryReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Everything one scrape produced
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeResult {
    /// Target name
    pub target: String,
    /// Query samples in configuration order, then `up` and `scrape_duration_seconds`
    pub samples: Vec<MetricSample>,
    /// Final status
    pub status: ScrapeStatus,
    /// Whether a connection could be obtained
    pub up: bool,
    /// Time from entry to `Done`
    pub duration: Duration,
    /// Per-query outcomes in configuration order
    pub queries: Vec<QueryReport>,
    /// Why the scrape could not connect
    pub connection_error: Option<ScrapeError>,
}

impl ScrapeResult {
    /// Every error of the scrape with the name of the query it belongs to
    pub fn errors(&self) -> impl Iterator<Item = (&str, &ScrapeError)> {
        self.queries.iter().flat_map(|report| {
            report
                .failure
                .iter()
                .chain(report.row_errors.iter())
                .map(move |e| (report.query.as_str(), e))
        })
    }

    /// Look up a query report by name
    pub fn query(&self, name: &str) -> Option<&QueryReport> {
        self.queries.iter().find(|q| q.query == name)
    }
}

/// Runs scrapes against pooled connections
///
/// Cheap to clone; every clone shares the same [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct CollectionEngine {
    manager: Arc<ConnectionManager>,
    runner: QueryRunner,
}

impl CollectionEngine {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            runner: QueryRunner::new(),
        }
    }

    /// The connection registry used by this engine
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Scrape `target`, running `queries` within `timeout`
    ///
    /// Never fails: connection problems yield `up 0`, query problems are
    /// reported per query. The result always ends with exactly one `up` and
    /// one `scrape_duration_seconds` sample.
    #[instrument(skip_all, fields(target = %target.name))]
    pub async fn collect(
        &self,
        target: &TargetConfig,
        queries: &[QueryDefinition],
        timeout: Duration,
    ) -> ScrapeResult {
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        let mut phase = PhaseTracker::new(&target.name);

        phase.advance(ScrapePhase::Connecting);
        let budget = target.pool.acquire_timeout().min(timeout);
        let primary = match self.manager.acquire(target, budget).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(target = %target.name, error = %e, "Cannot scrape target");
                phase.advance(ScrapePhase::Done(ScrapeStatus::Failed));
                let duration = started.elapsed();
                return ScrapeResult {
                    target: target.name.clone(),
                    samples: meta_samples(false, duration, now_millis()),
                    status: ScrapeStatus::Failed,
                    up: false,
                    duration,
                    queries: Vec::new(),
                    connection_error: Some(e),
                };
            }
        };

        phase.advance(ScrapePhase::Querying);
        let executed = self.execute_all(target, primary, queries, deadline).await;

        phase.advance(ScrapePhase::Mapping);
        let mapper = RowMapper::new();
        let mut seen: HashSet<SeriesId> = HashSet::new();
        let mut samples = Vec::new();
        let mut reports = Vec::with_capacity(queries.len());

        for (query, executed) in queries.iter().zip(executed) {
            let mut report = QueryReport {
                query: query.name.clone(),
                samples: 0,
                row_errors: Vec::new(),
                failure: None,
                duration: executed.elapsed,
            };

            match executed.outcome {
                Ok(rows) => {
                    let mapped = mapper.map_rows(rows, query);
                    report.failure = mapped.failure(query);
                    report.row_errors = mapped.errors;
                    for sample in mapped.samples {
                        let id = sample.series_id();
                        if seen.contains(&id) {
                            report.row_errors.push(ScrapeError::DuplicateSeries {
                                metric: id.name.clone(),
                                labels: id.labels_string(),
                            });
                            continue;
                        }
                        seen.insert(id);
                        samples.push(sample);
                        report.samples += 1;
                    }
                }
                Err(e) => report.failure = Some(e),
            }

            if let Some(failure) = &report.failure {
                warn!(target = %target.name, query = %query.name, error = %failure, "Query failed");
            }
            for row_error in &report.row_errors {
                debug!(target = %target.name, query = %query.name, error = %row_error, "Row dropped");
            }
            reports.push(report);
        }

        let failed = reports.iter().filter(|r| !r.is_success()).count();
        let status = ScrapeStatus::from_counts(reports.len(), failed);
        phase.advance(ScrapePhase::Done(status));

        let duration = started.elapsed();
        samples.extend(meta_samples(true, duration, now_millis()));

        info!(
            target = %target.name,
            status = %status,
            samples = samples.len(),
            failed_queries = failed,
            duration_ms = duration.as_millis() as u64,
            "Scrape finished"
        );

        ScrapeResult {
            target: target.name.clone(),
            samples,
            status,
            up: true,
            duration,
            queries: reports,
            connection_error: None,
        }
    }

    /// Run every query, returning one execution per query in input order
    async fn execute_all(
        &self,
        target: &TargetConfig,
        primary: PooledConnection,
        queries: &[QueryDefinition],
        deadline: Instant,
    ) -> Vec<Executed> {
        if queries.is_empty() {
            self.manager.release(primary, true);
            return Vec::new();
        }

        let queue: JobQueue = Arc::new(Mutex::new(
            queries
                .iter()
                .enumerate()
                .map(|(index, query)| Job {
                    index,
                    query: Arc::new(query.clone()),
                })
                .collect(),
        ));
        let target = Arc::new(target.clone());
        let worker = |id: usize| Worker {
            id,
            manager: Arc::clone(&self.manager),
            target: Arc::clone(&target),
            runner: self.runner,
            queue: Arc::clone(&queue),
            deadline,
        };

        let mut workers = JoinSet::new();
        workers.spawn(worker(0).run(Some(primary)));

        // Extra workers only take connections that are free right now, so one
        // scrape never queues behind others for its fan-out.
        let wanted = target.fan_out.min(queries.len());
        for id in 1..wanted {
            let budget = acquire_budget(&target, deadline);
            match self.manager.try_acquire(&target, budget).await {
                Ok(Some(conn)) => {
                    workers.spawn(worker(id).run(Some(conn)));
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(target = %target.name, error = %e, "No extra connection for fan-out");
                    break;
                }
            }
        }
        trace!(target = %target.name, workers = workers.len(), "Query workers started");

        let mut slots: Vec<Option<Executed>> = (0..queries.len()).map(|_| None).collect();
        let mut exit_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(output) => {
                    for executed in output.executed {
                        let index = executed.index;
                        slots[index] = Some(executed);
                    }
                    if output.exit_error.is_some() {
                        exit_error = output.exit_error;
                    }
                }
                Err(e) => error!(target = %target.name, error = %e, "Query worker aborted"),
            }
        }

        // Left over only when every worker lost its connection
        let abandoned = exit_error
            .unwrap_or_else(|| ScrapeError::Protocol("query worker aborted".to_string()));
        for job in lock(&queue).drain(..) {
            slots[job.index] = Some(Executed::failed(job.index, abandoned.clone()));
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    Executed::failed(index, ScrapeError::Protocol("query worker aborted".to_string()))
                })
            })
            .collect()
    }
}

/// Logs and checks phase transitions
struct PhaseTracker<'a> {
    target: &'a str,
    phase: ScrapePhase,
}

impl<'a> PhaseTracker<'a> {
    fn new(target: &'a str) -> Self {
        Self {
            target,
            phase: ScrapePhase::Idle,
        }
    }

    fn advance(&mut self, next: ScrapePhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal scrape transition {:?} -> {:?}",
            self.phase,
            next
        );
        trace!(target = %self.target, from = ?self.phase, to = ?next, "Scrape phase");
        self.phase = next;
    }
}

struct Job {
    index: usize,
    query: Arc<QueryDefinition>,
}

type JobQueue = Arc<Mutex<VecDeque<Job>>>;

fn lock(queue: &JobQueue) -> MutexGuard<'_, VecDeque<Job>> {
    match queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Executed {
    index: usize,
    outcome: Result<Rows, ScrapeError>,
    elapsed: Duration,
}

impl Executed {
    fn failed(index: usize, error: ScrapeError) -> Self {
        Self {
            index,
            outcome: Err(error),
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct WorkerOutput {
    executed: Vec<Executed>,
    exit_error: Option<ScrapeError>,
}

/// Pulls queries off the shared queue and runs them on one connection at a time
struct Worker {
    id: usize,
    manager: Arc<ConnectionManager>,
    target: Arc<TargetConfig>,
    runner: QueryRunner,
    queue: JobQueue,
    deadline: Instant,
}

impl Worker {
    async fn run(self, mut conn: Option<PooledConnection>) -> WorkerOutput {
        let mut output = WorkerOutput::default();

        loop {
            let Some(job) = lock(&self.queue).pop_front() else {
                break;
            };
            let started = Instant::now();

            if started >= self.deadline {
                output.executed.push(Executed::failed(job.index, ScrapeError::Timeout(Some(0))));
                continue;
            }

            // A tainted connection was destroyed; continue on a fresh one
            let mut current = match conn.take() {
                Some(c) => c,
                None => {
                    let budget = acquire_budget(&self.target, self.deadline);
                    match self.manager.acquire(&self.target, budget).await {
                        Ok(c) => c,
                        Err(e) => {
                            debug!(worker = self.id, error = %e, "Worker could not replace its connection");
                            output.executed.push(Executed::failed(job.index, e.clone()));
                            output.exit_error = Some(e);
                            break;
                        }
                    }
                }
            };

            let outcome = self.runner.run(&mut *current, &job.query, self.deadline).await;
            match &outcome {
                Err(e) if e.is_connection_tainting() => {
                    debug!(worker = self.id, conn_id = current.id(), error = %e, "Connection tainted");
                    self.manager.release(current, false);
                }
                _ => conn = Some(current),
            }

            output.executed.push(Executed {
                index: job.index,
                outcome,
                elapsed: started.elapsed(),
            });
        }

        if let Some(c) = conn {
            self.manager.release(c, true);
        }
        output
    }
}

fn acquire_budget(target: &TargetConfig, deadline: Instant) -> Duration {
    target
        .pool
        .acquire_timeout()
        .min(deadline.saturating_duration_since(Instant::now()))
}

fn meta_samples(up: bool, duration: Duration, timestamp_ms: i64) -> Vec<MetricSample> {
    vec![
        MetricSample::new(UP_METRIC, if up { 1.0 } else { 0.0 })
            .with_help("Whether the ObjectServer target could be reached")
            .with_timestamp(timestamp_ms),
        MetricSample::new(SCRAPE_DURATION_METRIC, duration.as_secs_f64())
            .with_help("Duration of the scrape in seconds")
            .with_timestamp(timestamp_ms),
    ]
}
