//! ObjectServer REST 인터페이스 커넥터
//!
//! Sessions speak to the ObjectServer HTTP interface:
//! `POST {url}/objectserver/restapi/sql/factory` with `{"sqlcmd": "..."}`.
//! Each session owns its own HTTP client with a single keep-alive
//! connection, so one session maps to one socket on the server side.
//!
//! The interface returns whole result sets; rows are buffered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use super::{Connection, Connector, ResultSet};
use crate::collector::{ColumnValue, RawRow};
use crate::config::TargetConfig;
use crate::error::ConnectionError;

/// Statement used as the liveness probe
pub const LIVENESS_SQL: &str = "select count(*) from catalog.tables;";

const SQL_FACTORY_PATH: &str = "/objectserver/restapi/sql/factory";

/// Longest server message carried into an error
const MAX_ERROR_BODY: usize = 256;

/// Opens REST sessions
#[derive(Debug)]
pub struct RestConnector {
    connect_timeout: Duration,
    next_id: AtomicU64,
}

impl RestConnector {
    /// 새 커넥터 생성
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            next_id: AtomicU64::new(1),
        }
    }

    /// TCP connect timeout of new sessions
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for RestConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for RestConnector {
    #[instrument(skip(self, target), fields(target = %target.name))]
    async fn connect(
        &self,
        target: &TargetConfig,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let client = ClientBuilder::new()
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| ConnectionError::Connect(format!("failed to build HTTP client: {}", e)))?;

        let mut session = RestSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            client,
            endpoint: format!("{}{}", target.url.trim_end_matches('/'), SQL_FACTORY_PATH),
            auth: target
                .username
                .clone()
                .map(|user| (user, target.password.clone().unwrap_or_default())),
        };

        // A session only counts as open once the server answered
        session.ping().await.map_err(|e| match e {
            connect @ ConnectionError::Connect(_) => connect,
            other => ConnectionError::Connect(other.to_string()),
        })?;

        debug!(conn_id = session.id, "REST session established");
        Ok(Box::new(session))
    }
}

/// One REST session
struct RestSession {
    id: u64,
    client: Client,
    endpoint: String,
    auth: Option<(String, String)>,
}

#[derive(Debug, Serialize)]
struct SqlCommand<'a> {
    sqlcmd: &'a str,
}

#[derive(Debug, Deserialize)]
struct SqlResponse {
    #[serde(default)]
    rowset: Option<RowSet>,
}

#[derive(Debug, Deserialize)]
struct RowSet {
    #[serde(default)]
    coldesc: Vec<ColumnDesc>,
    #[serde(default)]
    rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ColumnDesc {
    name: String,
}

#[async_trait]
impl Connection for RestSession {
    fn id(&self) -> u64 {
        self.id
    }

    #[instrument(skip(self, sql), fields(conn_id = self.id))]
    async fn execute(&mut self, sql: &str) -> Result<ResultSet, ConnectionError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .json(&SqlCommand { sqlcmd: sql });

        if let Some((username, password)) = &self.auth {
            req = req.basic_auth(username, Some(password));
        }

        let response = req.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_client_error() {
            return Err(ConnectionError::Query(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate(&body)
            )));
        }
        if !status.is_success() {
            return Err(ConnectionError::Protocol(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate(&body)
            )));
        }

        parse_result_set(&body)
    }

    async fn ping(&mut self) -> Result<(), ConnectionError> {
        self.execute(LIVENESS_SQL).await.map(|_| ())
    }
}

/// Decode a SQL factory response body
///
/// Column order follows `coldesc`; when it is absent the keys of the first
/// row are used. Cells missing from a row become NULL.
pub(crate) fn parse_result_set(body: &str) -> Result<ResultSet, ConnectionError> {
    if body.trim().is_empty() {
        return Ok(ResultSet::default());
    }

    let parsed: SqlResponse = serde_json::from_str(body)
        .map_err(|e| ConnectionError::Protocol(format!("malformed response: {}", e)))?;

    let Some(rowset) = parsed.rowset else {
        return Ok(ResultSet::default());
    };

    let columns: Vec<String> = if rowset.coldesc.is_empty() {
        rowset
            .rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    } else {
        rowset.coldesc.into_iter().map(|c| c.name).collect()
    };

    let rows = rowset
        .rows
        .iter()
        .map(|row| {
            let cells = columns
                .iter()
                .map(|name| {
                    let value = row.get(name).map(ColumnValue::from).unwrap_or(ColumnValue::Null);
                    (name.clone(), value)
                })
                .collect::<Vec<_>>();
            RawRow::from(cells)
        })
        .collect();

    Ok(ResultSet { columns, rows })
}

fn truncate(body: &str) -> &str {
    let body = body.trim();
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
