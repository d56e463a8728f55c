//! ObjectServer 연결 관리 모듈
//!
//! The engine talks to an ObjectServer through two small traits:
//! [`Connector`] opens sessions for a target, [`Connection`] runs SQL on one
//! session. [`ConnectionManager`] keeps one bounded pool of sessions per
//! target and hands them out exclusively.
//!
//! # Example
//!
//! ```ignore
//! use objserv_exporter::connection::{ConnectionManager, RestConnector};
//!
//! let manager = ConnectionManager::new(RestConnector::new());
//! let mut conn = manager.acquire(&target, Duration::from_secs(2)).await?;
//! let result = conn.execute("select count(*) from alerts.status;").await;
//! manager.release(conn, result.is_ok());
//! ```

mod pool;
mod rest;

use async_trait::async_trait;

use crate::collector::RawRow;
use crate::config::TargetConfig;
use crate::error::ConnectionError;

pub(crate) use pool::deadline_after;
pub use pool::{ConnectionManager, PoolStats, PooledConnection, CONNECT_ATTEMPTS};
pub use rest::{RestConnector, LIVENESS_SQL};

/// Rows returned by one statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Column names in result order
    pub columns: Vec<String>,
    /// Rows in server order
    pub rows: Vec<RawRow>,
}

/// A live session to one ObjectServer
///
/// Sessions are stateful and never shared: the holder of a
/// [`PooledConnection`] is the only one issuing statements on it.
#[async_trait]
pub trait Connection: Send {
    /// Identifier used in logs
    fn id(&self) -> u64;

    /// Execute a statement and return its rows
    async fn execute(&mut self, sql: &str) -> Result<ResultSet, ConnectionError>;

    /// Cheap round-trip proving the session is still usable
    async fn ping(&mut self) -> Result<(), ConnectionError>;
}

/// Opens sessions for a target
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new session
    async fn connect(&self, target: &TargetConfig)
        -> Result<Box<dyn Connection>, ConnectionError>;
}
