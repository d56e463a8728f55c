//! Scripted ObjectServer stand-in for integration tests
//!
//! Replies are keyed by SQL text. Every open session is counted so tests
//! can check the pool never exceeds its cap.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use objserv_exporter::collector::{CollectionEngine, RawRow};
use objserv_exporter::config::{QueryDefinition, TargetConfig};
use objserv_exporter::connection::{Connection, ConnectionManager, Connector, ResultSet};
use objserv_exporter::error::ConnectionError;

/// What a statement answers
#[derive(Clone, Debug)]
pub enum Reply {
    Rows(Vec<RawRow>),
    Protocol(String),
    Query(String),
}

#[derive(Clone, Debug)]
struct Script {
    delay: Duration,
    reply: Reply,
}

/// Shared state of all mock sessions
#[derive(Default)]
pub struct MockBackend {
    scripts: Mutex<HashMap<String, Script>>,
    next_id: AtomicU64,
    pub connects: AtomicUsize,
    open: AtomicUsize,
    peak_open: AtomicUsize,
    busy: AtomicUsize,
    peak_busy: AtomicUsize,
    pub refuse: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `sql` with rows
    pub fn rows(&self, sql: &str, rows: Vec<RawRow>) {
        self.script(sql, Duration::ZERO, Reply::Rows(rows));
    }

    /// Answer `sql` after `delay`
    pub fn script(&self, sql: &str, delay: Duration, reply: Reply) {
        self.scripts
            .lock()
            .unwrap()
            .insert(sql.to_string(), Script { delay, reply });
    }

    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Most sessions ever open at the same time
    pub fn peak_open(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }

    /// Most statements ever running at the same time
    pub fn peak_busy(&self) -> usize {
        self.peak_busy.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

fn bump(current: &AtomicUsize, peak: &AtomicUsize) {
    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
    peak.fetch_max(now, Ordering::SeqCst);
}

/// Decrements the busy count even when the statement is abandoned
struct Busy<'a>(&'a AtomicUsize);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockConnector(pub Arc<MockBackend>);

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _target: &TargetConfig) -> Result<Box<dyn Connection>, ConnectionError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if self.0.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::Connect("connection refused".into()));
        }
        bump(&self.0.open, &self.0.peak_open);
        Ok(Box::new(MockConnection {
            id: self.0.next_id.fetch_add(1, Ordering::SeqCst),
            backend: Arc::clone(&self.0),
        }))
    }
}

struct MockConnection {
    id: u64,
    backend: Arc<MockBackend>,
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn execute(&mut self, sql: &str) -> Result<ResultSet, ConnectionError> {
        let script = self.backend.scripts.lock().unwrap().get(sql).cloned();
        let script = script.unwrap_or(Script {
            delay: Duration::ZERO,
            reply: Reply::Query(format!("unknown statement: {sql}")),
        });

        bump(&self.backend.busy, &self.backend.peak_busy);
        let busy = Busy(&self.backend.busy);
        tokio::time::sleep(script.delay).await;
        drop(busy);

        match script.reply {
            Reply::Rows(rows) => Ok(ResultSet {
                columns: rows
                    .first()
                    .map(|r| r.columns().iter().map(|(n, _)| n.clone()).collect())
                    .unwrap_or_default(),
                rows,
            }),
            Reply::Protocol(msg) => Err(ConnectionError::Protocol(msg)),
            Reply::Query(msg) => Err(ConnectionError::Query(msg)),
        }
    }

    async fn ping(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.backend.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Engine and manager backed by `backend`
pub fn engine(backend: &Arc<MockBackend>) -> (CollectionEngine, Arc<ConnectionManager>) {
    let manager = Arc::new(ConnectionManager::new(MockConnector(Arc::clone(backend))));
    (CollectionEngine::new(Arc::clone(&manager)), manager)
}

pub fn target(name: &str, max_size: usize, fan_out: usize) -> TargetConfig {
    let mut target = TargetConfig::new(name, "http://objectserver:8080");
    target.pool.max_size = max_size;
    target.fan_out = fan_out;
    target
}

/// Query `name` running `select <name>;`, labelled by `labelA`, valued by `value`
pub fn query(name: &str, metric: &str) -> QueryDefinition {
    QueryDefinition::new(name, sql(name), metric, "value").with_label("labelA")
}

pub fn sql(name: &str) -> String {
    format!("select {name};")
}

pub fn row(label: &str, value: &str) -> RawRow {
    RawRow::new().with("labelA", label).with("value", value)
}
