//! Error types for the lineflow ingester and query workers.

use thiserror::Error;

/// The main error type for all lineflow operations.
///
/// Per-record and per-flush variants (`MalformedRecord`, `Batch`, `Ingest`)
/// are recovered by the pipeline; `Query` variants are fatal to the worker
/// that produced them.
#[derive(Error, Debug)]
pub enum LineflowError {
    /// An input line could not be decoded.
    #[error("malformed record: {0}")]
    MalformedRecord(#[from] CodecError),

    /// A record could not be placed into a batch.
    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    /// Submitting a batch to the ingestion endpoint failed.
    #[error("ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    /// A control statement against the store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A continuous query terminated or produced an unusable row.
    #[error("query worker failure: {0}")]
    Query(#[from] QueryError),

    /// The pipeline configuration is invalid or unreadable.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Reading the input stream failed.
    #[error("input read failed: {0}")]
    Input(std::io::Error),
}

/// Errors raised while decoding a line-protocol record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The line did not split into measurement+tags, fields, and timestamp.
    #[error("expected 3 whitespace-separated tokens, found {found}")]
    WrongTokenCount {
        /// Number of tokens actually found.
        found: usize,
    },

    /// A backslash was the last character of the line.
    #[error("dangling escape at end of line")]
    DanglingEscape,

    /// A double quote was opened but never closed.
    #[error("unterminated quoted value")]
    UnterminatedQuote,

    /// The measurement name is empty.
    #[error("empty measurement name")]
    EmptyMeasurement,

    /// A tag or field element has no unescaped `=`.
    #[error("'{element}' is not a key=value pair")]
    MissingEquals {
        /// The offending element, unescaped.
        element: String,
    },

    /// A tag or field key is empty.
    #[error("empty key in '{element}'")]
    EmptyKey {
        /// The offending element, unescaped.
        element: String,
    },

    /// The same key appears twice in the tag set or field set.
    #[error("duplicate key '{key}'")]
    DuplicateKey {
        /// The repeated key.
        key: String,
    },

    /// A key is used both as a tag and as a field.
    #[error("key '{key}' is both a tag and a field")]
    TagFieldOverlap {
        /// The shared key.
        key: String,
    },

    /// The timestamp is not a signed 64-bit integer.
    #[error("invalid timestamp '{raw}'")]
    InvalidTimestamp {
        /// The raw timestamp token.
        raw: String,
    },

    /// The line is not valid UTF-8.
    #[error("line is not valid UTF-8 after byte {valid_up_to}")]
    InvalidUtf8 {
        /// Length of the valid prefix.
        valid_up_to: usize,
    },
}

/// Errors raised while appending a record to the batch accumulator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// The record lacks a tag required by its stream's primary key.
    #[error("record for '{measurement}' is missing primary key tag '{tag}'")]
    MissingPrimaryKeyTag {
        /// The record's measurement.
        measurement: String,
        /// The missing tag name.
        tag: String,
    },

    /// The record's measurement has no configured destination stream.
    #[error("no stream configured for measurement '{measurement}'")]
    UnknownMeasurement {
        /// The unconfigured measurement.
        measurement: String,
    },
}

/// Errors that can occur while posting a batch to the ingestion endpoint.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Failed to serialize the JSON payload.
    #[error("failed to serialize payload for '{stream}': {source}")]
    Serialization {
        /// The destination stream.
        stream: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to create HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// HTTP request failed after retries.
    #[error("HTTP request to '{url}' failed: {source}")]
    RequestFailed {
        /// The request URL.
        url: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Server returned non-2xx status after retries.
    #[error("'{url}' returned status {status}: {body}")]
    HttpStatus {
        /// The request URL.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },
}

/// Errors from the store's control (DDL) interface.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to create HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The statement could not be delivered.
    #[error("statement failed: {source}")]
    RequestFailed {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The store rejected the statement.
    #[error("store rejected statement with status {status}: {body}")]
    Rejected {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },
}

/// Failures of a continuous query worker.
#[derive(Error, Debug)]
pub enum QueryError {
    /// Failed to create HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The query could not be started.
    #[error("failed to start query: {source}")]
    Start {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The store refused the query.
    #[error("store refused query with status {status}: {body}")]
    Refused {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// Reading the result stream failed.
    #[error("result stream broke: {source}")]
    Transport {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A result row could not be decoded.
    #[error("undecodable row '{row}': {reason}")]
    BadRow {
        /// The raw row text.
        row: String,
        /// Why the row was rejected.
        reason: String,
    },

    /// The continuous query returned end-of-stream.
    #[error("continuous query ended after {rows} row(s)")]
    StreamEnded {
        /// Rows received before the end.
        rows: u64,
    },

    /// Writing a derived line to the output failed.
    #[error("failed to write output: {source}")]
    Output {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors in loading or validating the pipeline configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the config file.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: std::path::PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A stream's primary key definition is invalid.
    #[error("invalid primary key for stream '{stream}': {reason}")]
    InvalidPrimaryKey {
        /// The stream name.
        stream: String,
        /// Why the key is invalid.
        reason: String,
    },

    /// A stream name is unusable as an identifier.
    #[error("invalid stream name '{stream}'")]
    InvalidStreamName {
        /// The stream name.
        stream: String,
    },

    /// The flush interval is zero.
    #[error("flush interval must be greater than zero")]
    ZeroFlushInterval,
}

/// Type alias for `Result<T, LineflowError>`.
pub type Result<T> = std::result::Result<T, LineflowError>;
