//! Per-stream batch accumulation.
//!
//! The [`BatchAccumulator`] holds one ordered batch of pending rows per
//! measurement. Records are appended as they are decoded; [`flush`]
//! hands every non-empty batch to an [`IngestSink`] and clears it only
//! when the sink accepted it, so a failed submission is retried whole on
//! the next flush. Store-side upsert by primary key makes the repeat
//! harmless.
//!
//! [`flush`]: BatchAccumulator::flush

use std::collections::BTreeMap;

use chrono::DateTime;

use crate::error::Result;
use crate::ingest::IngestSink;
use crate::line::MetricRecord;
use crate::schema::StreamConfig;

/// Format of [`PendingRow::display_timestamp`]: UTC with nanosecond
/// fractional seconds.
const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// A record waiting to be submitted to its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRow {
    /// Primary-key tag values in configured order.
    pub primary_key: Vec<String>,
    /// All tags of the record.
    pub tags: Vec<(String, String)>,
    /// All fields of the record.
    pub fields: Vec<(String, String)>,
    /// The record's timestamp as a decimal nanosecond string.
    pub timestamp: String,
    /// The record's timestamp rendered as `YYYY-MM-DD HH:MM:SS.fffffffff` UTC.
    pub display_timestamp: String,
}

/// Outcome of one [`BatchAccumulator::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Streams whose batch was accepted and cleared.
    pub streams_submitted: usize,
    /// Rows accepted across all streams.
    pub rows_submitted: usize,
    /// Streams whose batch was rejected and kept for the next flush.
    pub streams_retained: usize,
    /// Rows kept for the next flush.
    pub rows_retained: usize,
}

/// Pending rows keyed by measurement.
///
/// Owned by a single thread; nothing here is synchronized.
#[derive(Debug)]
pub struct BatchAccumulator {
    config: StreamConfig,
    batches: BTreeMap<String, Vec<PendingRow>>,
}

impl BatchAccumulator {
    /// Creates an empty accumulator for the given streams.
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            batches: BTreeMap::new(),
        }
    }

    /// Returns the stream configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Appends a record to its measurement's batch.
    ///
    /// The primary key is resolved and the display timestamp rendered now,
    /// at batch time.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError`](crate::error::BatchError) if the measurement
    /// is not configured or a primary-key tag is missing. The record is
    /// dropped and no batch changes.
    pub fn append(&mut self, record: MetricRecord) -> Result<()> {
        let primary_key = self.config.primary_key_values(&record)?;
        let row = PendingRow {
            primary_key,
            timestamp: record.timestamp.to_string(),
            display_timestamp: display_timestamp(record.timestamp),
            tags: record.tags,
            fields: record.fields,
        };

        self.batches
            .entry(record.measurement)
            .or_default()
            .push(row);
        Ok(())
    }

    /// Submits every non-empty batch and clears the ones the sink accepted.
    ///
    /// Rejected batches stay in place, ahead of rows appended later. Each
    /// rejection is logged; this never fails as a whole.
    pub fn flush<S: IngestSink + ?Sized>(&mut self, sink: &S) -> FlushReport {
        let mut report = FlushReport::default();

        for (measurement, rows) in &mut self.batches {
            if rows.is_empty() {
                continue;
            }
            let Some(columns) = self.config.columns(measurement) else {
                continue;
            };

            match sink.submit(measurement, &columns, rows) {
                Ok(()) => {
                    tracing::debug!("submitted {} row(s) to '{measurement}'", rows.len());
                    report.streams_submitted += 1;
                    report.rows_submitted += rows.len();
                    rows.clear();
                }
                Err(e) => {
                    tracing::warn!(
                        "retaining {} row(s) for '{measurement}' until next flush: {e}",
                        rows.len()
                    );
                    report.streams_retained += 1;
                    report.rows_retained += rows.len();
                }
            }
        }

        report
    }

    /// Returns the pending rows of one measurement.
    pub fn pending(&self, measurement: &str) -> &[PendingRow] {
        self.batches
            .get(measurement)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Total pending rows across all measurements.
    pub fn pending_rows(&self) -> usize {
        self.batches.values().map(Vec::len).sum()
    }

    /// Returns `true` if no rows are pending.
    pub fn is_empty(&self) -> bool {
        self.batches.values().all(Vec::is_empty)
    }

    /// Measurements seen so far, including ones with empty batches.
    pub fn measurements(&self) -> impl Iterator<Item = &str> {
        self.batches.keys().map(String::as_str)
    }
}

/// Renders a nanosecond timestamp as `YYYY-MM-DD HH:MM:SS.fffffffff` UTC.
pub fn display_timestamp(timestamp_ns: i64) -> String {
    DateTime::from_timestamp_nanos(timestamp_ns)
        .format(DISPLAY_FORMAT)
        .to_string()
}
