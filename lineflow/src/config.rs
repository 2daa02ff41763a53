//! Pipeline configuration.
//!
//! Everything is optional: a missing file, or a file with missing keys,
//! falls back to a local store on its default ports, a one second flush
//! interval and the built-in Telegraf stream keys.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::ingest::IngestConfig;
use crate::schema::StreamConfig;

/// Default HTTP port of the store's ingestion API.
pub const DEFAULT_INGEST_PORT: u16 = 3218;
/// Default HTTP port of the store's SQL endpoint.
pub const DEFAULT_QUERY_PORT: u16 = 8123;
/// Path of the per-stream ingestion endpoints below the ingestion port.
pub const INGEST_PATH: &str = "/proton/v1/ingest/streams";

/// Store endpoints and HTTP behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    /// Base URL of the per-stream ingestion endpoints.
    pub ingest_url: String,
    /// URL of the SQL endpoint used for DDL and continuous queries.
    pub query_url: String,
    /// Request timeout for ingestion and DDL, in milliseconds.
    pub timeout_ms: u64,
    /// Retries within one ingestion request before the batch is retained.
    pub max_retries: u32,
    /// Extra HTTP headers sent with every request.
    pub headers: Vec<(String, String)>,
}

impl StoreSettings {
    /// Settings for a store on `host` at its default ports.
    pub fn for_host(host: &str) -> Self {
        Self {
            ingest_url: format!("http://{host}:{DEFAULT_INGEST_PORT}{INGEST_PATH}"),
            query_url: format!("http://{host}:{DEFAULT_QUERY_PORT}/"),
            ..Self::default()
        }
    }

    /// Request timeout for ingestion and DDL.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            ingest_url: format!("http://localhost:{DEFAULT_INGEST_PORT}{INGEST_PATH}"),
            query_url: format!("http://localhost:{DEFAULT_QUERY_PORT}/"),
            timeout_ms: 5_000,
            max_retries: 0,
            headers: Vec::new(),
        }
    }
}

/// Complete configuration of the ingester and query workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Store endpoints.
    pub store: StoreSettings,
    /// Flush period in milliseconds.
    pub flush_interval_ms: u64,
    /// Primary keys per measurement.
    pub streams: StreamConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            flush_interval_ms: 1_000,
            streams: StreamConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] if the file
    /// cannot be read or parsed, or a validation error (see
    /// [`PipelineConfig::validate`]).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, otherwise returns the defaults.
    ///
    /// # Errors
    ///
    /// See [`PipelineConfig::load`].
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Checks the flush interval and every stream definition.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroFlushInterval`] or the first invalid
    /// stream.
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::ZeroFlushInterval.into());
        }
        self.streams.validate()
    }

    /// Points both endpoints at `host` on the default ports.
    #[must_use]
    pub fn with_store_host(mut self, host: &str) -> Self {
        let StoreSettings {
            ingest_url,
            query_url,
            ..
        } = StoreSettings::for_host(host);
        self.store.ingest_url = ingest_url;
        self.store.query_url = query_url;
        self
    }

    /// Flush period.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Ingestion client settings derived from the store section.
    pub fn ingest_config(&self) -> IngestConfig {
        self.store.headers.iter().fold(
            IngestConfig::new(&self.store.ingest_url)
                .with_timeout(self.store.timeout())
                .with_max_retries(self.store.max_retries),
            |config, (name, value)| config.with_header(name, value),
        )
    }
}
