//! Control and query client for the streaming store.
//!
//! Statements travel as the body of a `POST` to the store's SQL endpoint.
//! Control statements (DDL) are executed with a request timeout and their
//! response is drained. Continuous queries are sent with
//! `FORMAT JSONEachRow` and no timeout; the response body is then read
//! lazily, one JSON row per line, for as long as the store keeps it open.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{QueryError, Result, StoreError};
use crate::line::DerivedMetric;

/// Executes control statements against the store.
///
/// Implemented by [`StoreClient`]; the stream provisioner is written
/// against this trait so it can be exercised without a store.
pub trait StoreControl {
    /// Executes one statement, discarding any result rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement is not accepted.
    fn execute(&self, sql: &str) -> Result<()>;
}

/// Blocking HTTP client for the store's SQL endpoint.
///
/// Every query worker builds its own client, so no connection is ever
/// shared between workers or with the ingester.
#[derive(Debug)]
pub struct StoreClient {
    url: String,
    headers: Vec<(String, String)>,
    http: reqwest::blocking::Client,
}

impl StoreClient {
    /// Creates a client for control statements with a request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ClientCreate`] if the HTTP client cannot be
    /// built.
    pub fn for_control(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::ClientCreate { source: e })?;
        Ok(Self {
            url: url.into(),
            headers: Vec::new(),
            http,
        })
    }

    /// Creates a client for continuous queries. Requests never time out,
    /// since a healthy continuous query never finishes.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ClientCreate`] if the HTTP client cannot be
    /// built.
    pub fn for_queries(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(None)
            .build()
            .map_err(|e| QueryError::ClientCreate { source: e })?;
        Ok(Self {
            url: url.into(),
            headers: Vec::new(),
            http,
        })
    }

    /// Adds an HTTP header sent with every statement.
    #[must_use]
    pub fn with_headers(mut self, headers: &[(String, String)]) -> Self {
        self.headers.extend(headers.iter().cloned());
        self
    }

    /// Returns the SQL endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Starts a continuous query and returns its lazily read rows.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Start`] if the request cannot be sent, or
    /// [`QueryError::Refused`] if the store answers with a non-2xx status.
    pub fn query(&self, sql: &str) -> Result<RowStream<BufReader<reqwest::blocking::Response>>> {
        let resp = self
            .post(format!("{sql} FORMAT JSONEachRow"))
            .send()
            .map_err(|e| QueryError::Start { source: e })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().unwrap_or_default();
            return Err(QueryError::Refused { status, body }.into());
        }

        Ok(RowStream::new(BufReader::new(resp)))
    }

    fn post(&self, body: String) -> reqwest::blocking::RequestBuilder {
        let mut request = self
            .http
            .post(&self.url)
            .header("Content-Type", "text/plain; charset=utf-8");
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        request.body(body)
    }
}

impl StoreControl for StoreClient {
    fn execute(&self, sql: &str) -> Result<()> {
        let resp = self
            .post(sql.to_string())
            .send()
            .map_err(|e| StoreError::RequestFailed { source: e })?;

        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        Ok(())
    }
}

/// Rows of a continuous query, decoded one line at a time.
///
/// Yields `None` once the underlying reader reaches end of stream; for a
/// continuous query that is itself a failure, which the caller reports.
#[derive(Debug)]
pub struct RowStream<R> {
    reader: R,
    line: String,
    rows: u64,
}

impl<R: BufRead> RowStream<R> {
    /// Wraps a reader producing one JSON row per line.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            rows: 0,
        }
    }

    /// Number of rows decoded so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

impl<R: BufRead> Iterator for RowStream<R> {
    type Item = Result<DerivedMetric>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {
                    let text = self.line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    self.rows += 1;
                    return Some(parse_row(text));
                }
                Err(e) => return Some(Err(QueryError::Transport { source: e }.into())),
            }
        }
    }
}

/// Wire shape of one result row.
#[derive(Deserialize)]
struct RawRow {
    measurement: String,
    #[serde(default)]
    tags: BTreeMap<String, Value>,
    #[serde(default)]
    fields: BTreeMap<String, Value>,
    timestamp: Value,
}

/// Decodes one `JSONEachRow` line into a derived metric.
///
/// Map values may be strings or numbers; the timestamp may be a number or
/// a numeric string. Tags and fields come out sorted by key.
///
/// # Errors
///
/// Returns [`QueryError::BadRow`] if the line is not a row of that shape.
pub fn parse_row(text: &str) -> Result<DerivedMetric> {
    let bad = |reason: String| QueryError::BadRow {
        row: text.to_string(),
        reason,
    };

    let raw: RawRow = serde_json::from_str(text).map_err(|e| bad(e.to_string()))?;
    if raw.measurement.is_empty() {
        return Err(bad("empty measurement".to_string()).into());
    }

    let timestamp = match &raw.timestamp {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| bad(format!("timestamp {} is not an integer", raw.timestamp)))?;

    let tags = flatten(raw.tags).map_err(&bad)?;
    let fields = flatten(raw.fields).map_err(&bad)?;
    if fields.is_empty() {
        return Err(bad("no fields".to_string()).into());
    }

    Ok(DerivedMetric {
        measurement: raw.measurement,
        tags,
        fields,
        timestamp,
    })
}

fn flatten(map: BTreeMap<String, Value>) -> std::result::Result<Vec<(String, String)>, String> {
    map.into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => Ok((k, s)),
            Value::Number(n) => Ok((k, n.to_string())),
            Value::Bool(b) => Ok((k, b.to_string())),
            other => Err(format!("value of '{k}' is not a scalar: {other}")),
        })
        .collect()
}
