//! HTTP ingestion client for the streaming store.
//!
//! Each flushed batch becomes one columnar JSON document posted to the
//! stream's ingestion endpoint:
//!
//! ```text
//! POST {base_url}/{stream}
//! {"columns": ["host", "core", "tags", "fields", "timestamp", "display_timestamp"],
//!  "data": [["a", "0", {"core": "0", "host": "a"}, {"usage": "5"},
//!            "1000000000", "1970-01-01 00:00:01.000000000"]]}
//! ```
//!
//! Any 2xx answer accepts the whole batch; anything else rejects the whole
//! batch.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use lineflow::batch::BatchAccumulator;
//! use lineflow::ingest::{IngestClient, IngestConfig};
//! use lineflow::schema::StreamConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = IngestConfig::new("http://localhost:3218/proton/v1/ingest/streams")
//!     .with_timeout(Duration::from_secs(5));
//! let client = IngestClient::new(config)?;
//!
//! let mut batches = BatchAccumulator::new(StreamConfig::default());
//! batches.append("cpu,host=a,cpu=cpu0 usage=5 1000000000".parse()?)?;
//! let report = batches.flush(&client);
//! println!("submitted {} row(s)", report.rows_submitted);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use serde_json::{Map, Value};

use crate::batch::PendingRow;
use crate::error::{IngestError, Result};

/// Destination for flushed batches.
///
/// Implemented by [`IngestClient`] for the real store; tests substitute
/// in-memory sinks.
pub trait IngestSink {
    /// Submits all rows of one stream's batch.
    ///
    /// `columns` names the values of every row in order: primary-key
    /// columns, then `tags`, `fields`, `timestamp`, `display_timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch was not accepted in full.
    fn submit(&self, stream: &str, columns: &[String], rows: &[PendingRow]) -> Result<()>;
}

/// Configuration for the ingestion endpoint.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Base URL; the stream name is appended as the last path segment.
    pub base_url: String,
    /// HTTP timeout for each request.
    pub timeout: Duration,
    /// Retries within a single submission before giving up.
    pub max_retries: u32,
    /// Initial backoff duration between retries (doubles each attempt).
    pub retry_backoff: Duration,
    /// Extra HTTP headers (e.g., for authentication).
    pub headers: Vec<(String, String)>,
}

impl IngestConfig {
    /// Creates a new config with defaults: 5s timeout, no retries within a
    /// flush, 100ms initial backoff.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(5),
            max_retries: 0,
            retry_backoff: Duration::from_millis(100),
            headers: Vec::new(),
        }
    }

    /// Adds an HTTP header (e.g., for authentication tokens).
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the HTTP timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns the ingestion URL for one stream.
    pub fn endpoint(&self, stream: &str) -> String {
        format!("{}/{stream}", self.base_url.trim_end_matches('/'))
    }
}

/// Blocking HTTP client posting batches to the store.
///
/// Holds one connection pool for the lifetime of the ingester; it is never
/// shared with query workers.
#[derive(Debug)]
pub struct IngestClient {
    config: IngestConfig,
    http: reqwest::blocking::Client,
}

impl IngestClient {
    /// Creates a client with the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::ClientCreate`] if the HTTP client cannot be
    /// built.
    pub fn new(config: IngestConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| IngestError::ClientCreate { source: e })?;
        Ok(Self { config, http })
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Sends one request, with no retry.
    fn send_once(&self, url: &str, body: &[u8]) -> std::result::Result<(), IngestError> {
        let mut request = self
            .http
            .post(url)
            .header("Content-Type", "application/json");

        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }

        match request.body(body.to_vec()).send() {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().unwrap_or_default();
                Err(IngestError::HttpStatus {
                    url: url.to_string(),
                    status,
                    body,
                })
            }
            Err(e) => Err(IngestError::RequestFailed {
                url: url.to_string(),
                source: e,
            }),
        }
    }
}

impl IngestSink for IngestClient {
    fn submit(&self, stream: &str, columns: &[String], rows: &[PendingRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let url = self.config.endpoint(stream);
        let body = encode_payload(stream, columns, rows)?;

        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            let err = match self.send_once(&url, &body) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if attempt >= self.config.max_retries {
                return Err(err.into());
            }
            tracing::debug!("retrying ingestion into '{stream}' (attempt {attempt}): {err}");
            std::thread::sleep(backoff);
            backoff *= 2;
            attempt += 1;
        }
    }
}

/// Builds the `{"columns": .., "data": ..}` document for one batch.
pub fn build_payload(columns: &[String], rows: &[PendingRow]) -> Value {
    let data: Vec<Value> = rows.iter().map(build_row).collect();
    serde_json::json!({
        "columns": columns,
        "data": data,
    })
}

/// Serializes the payload for one batch.
///
/// # Errors
///
/// Returns [`IngestError::Serialization`] if JSON encoding fails.
pub fn encode_payload(stream: &str, columns: &[String], rows: &[PendingRow]) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(&build_payload(columns, rows)).map_err(|e| {
        IngestError::Serialization {
            stream: stream.to_string(),
            source: e,
        }
    })?;
    Ok(body)
}

/// One row array: key values, tag map, field map, timestamp, display time.
fn build_row(row: &PendingRow) -> Value {
    let mut values = Vec::with_capacity(row.primary_key.len() + 4);
    values.extend(row.primary_key.iter().cloned().map(Value::String));
    values.push(Value::Object(to_object(&row.tags)));
    values.push(Value::Object(to_object(&row.fields)));
    values.push(Value::String(row.timestamp.clone()));
    values.push(Value::String(row.display_timestamp.clone()));
    Value::Array(values)
}

fn to_object(pairs: &[(String, String)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}
