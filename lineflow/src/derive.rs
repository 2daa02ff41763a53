//! Rate derivations over monotonically increasing counters.
//!
//! A [`Derivation`] names a counter-carrying source stream and the
//! counters to turn into per-second rates. Each `(derivation, dimension)`
//! pair becomes one continuous query built by [`build_query`], and the
//! same arithmetic is available in-process through [`RateTracker`].
//!
//! Within a partition (the source stream's primary-key columns), each
//! sample is paired with the one before it:
//!
//! ```text
//! rate = (value - previous value) / ((timestamp - previous timestamp) / 1e9)
//! ```
//!
//! Pairs with identical timestamps and pairs further apart than
//! [`MAX_RATE_GAP_SECS`] produce nothing.

use std::collections::HashMap;

use crate::line::{DerivedMetric, MetricRecord};
use crate::provision::quote_ident;
use crate::schema::StreamConfig;

/// Longest gap, in seconds, between two samples that still yields a rate.
pub const MAX_RATE_GAP_SECS: i64 = 86_400;

const MAX_RATE_GAP_NANOS: i64 = MAX_RATE_GAP_SECS * 1_000_000_000;

/// Tag added to every derived row to tell dimensions apart.
pub const DIRECTION_TAG: &str = "direction";

const NANOS_PER_SEC: f64 = 1e9;

/// One counter of a derivation and the label it is published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimension {
    /// Value of the `direction` tag on derived rows.
    pub label: &'static str,
    /// Field of the source record holding the counter.
    pub counter: &'static str,
}

/// A rate metric derived from counters of one source stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Derivation {
    /// Measurement name of derived rows.
    pub metric: &'static str,
    /// Stream the counters are read from.
    pub source: &'static str,
    /// Field name of the rate on derived rows.
    pub unit: &'static str,
    /// Counters turned into rates.
    pub dimensions: &'static [Dimension],
}

const fn dim(label: &'static str, counter: &'static str) -> Dimension {
    Dimension { label, counter }
}

/// Built-in derivations for Telegraf's energy, network and disk inputs.
pub const DERIVATIONS: &[Derivation] = &[
    Derivation {
        metric: "power",
        source: "energy",
        unit: "watts",
        dimensions: &[dim("total", "joules")],
    },
    Derivation {
        metric: "network_throughput",
        source: "net",
        unit: "bytes_per_second",
        dimensions: &[dim("receive", "bytes_recv"), dim("transmit", "bytes_sent")],
    },
    Derivation {
        metric: "network_packets",
        source: "net",
        unit: "packets_per_second",
        dimensions: &[
            dim("receive", "packets_recv"),
            dim("transmit", "packets_sent"),
        ],
    },
    Derivation {
        metric: "disk_throughput",
        source: "diskio",
        unit: "bytes_per_second",
        dimensions: &[dim("read", "read_bytes"), dim("write", "write_bytes")],
    },
    Derivation {
        metric: "disk_operations",
        source: "diskio",
        unit: "operations_per_second",
        dimensions: &[dim("read", "reads"), dim("write", "writes")],
    },
];

/// A named continuous query, ready to hand to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuousQuery {
    /// Worker name, `<metric>.<label>`.
    pub name: String,
    /// SQL text, without an output format clause.
    pub sql: String,
}

/// Builds the continuous query for one dimension of a derivation.
///
/// `partition` is the source stream's primary key; samples are only
/// paired within the same key.
pub fn build_query(derivation: &Derivation, dimension: &Dimension, partition: &[String]) -> String {
    let partition: Vec<String> = partition.iter().map(|k| quote_ident(k)).collect();

    format!(
        "SELECT '{metric}' AS measurement, \
         map_update(source_tags, map('{DIRECTION_TAG}', '{label}')) AS tags, \
         map('{unit}', to_string((value - prev_value) / ((timestamp - prev_timestamp) / 1e9))) AS fields, \
         timestamp \
         FROM (\
         SELECT tags AS source_tags, timestamp, \
         to_float64(fields['{counter}']) AS value, \
         lag(value) AS prev_value, \
         lag(timestamp) AS prev_timestamp \
         FROM {source} \
         WHERE map_contains(fields, '{counter}') \
         PARTITION BY {partition}\
         ) \
         WHERE prev_timestamp != 0 \
         AND timestamp != prev_timestamp \
         AND (timestamp - prev_timestamp) <= {MAX_RATE_GAP_NANOS}",
        metric = derivation.metric,
        label = dimension.label,
        unit = derivation.unit,
        counter = dimension.counter,
        source = quote_ident(derivation.source),
        partition = partition.join(", "),
    )
}

/// Expands a derivation table into continuous queries.
///
/// Derivations whose source stream is not configured are skipped with a
/// warning, since there would be nothing to read.
pub fn continuous_queries(table: &[Derivation], streams: &StreamConfig) -> Vec<ContinuousQuery> {
    let mut queries = Vec::new();
    for derivation in table {
        let Some(partition) = streams.primary_key(derivation.source) else {
            tracing::warn!(
                "skipping '{}': source stream '{}' is not configured",
                derivation.metric,
                derivation.source
            );
            continue;
        };
        for dimension in derivation.dimensions {
            queries.push(ContinuousQuery {
                name: format!("{}.{}", derivation.metric, dimension.label),
                sql: build_query(derivation, dimension, partition),
            });
        }
    }
    queries
}

/// A counter reading at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Counter value.
    pub value: f64,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Per-second rate between two consecutive samples.
///
/// Returns `None` if the timestamps are equal or more than
/// [`MAX_RATE_GAP_SECS`] apart.
#[allow(clippy::cast_precision_loss)]
pub fn rate(previous: Sample, current: Sample) -> Option<f64> {
    let elapsed_ns = current.timestamp.checked_sub(previous.timestamp)?;
    if elapsed_ns == 0 || elapsed_ns > MAX_RATE_GAP_NANOS {
        return None;
    }
    let elapsed_secs = elapsed_ns as f64 / NANOS_PER_SEC;
    Some((current.value - previous.value) / elapsed_secs)
}

/// In-process counterpart of the continuous queries.
///
/// Remembers the last sample per derivation dimension and partition, and
/// turns each new sample into a derived row shaped like the ones the
/// store produces.
#[derive(Debug)]
pub struct RateTracker {
    table: &'static [Derivation],
    streams: StreamConfig,
    last: HashMap<(usize, usize, Vec<String>), Sample>,
}

impl RateTracker {
    /// Creates a tracker for `table`, partitioning by `streams`' keys.
    pub fn new(table: &'static [Derivation], streams: StreamConfig) -> Self {
        Self {
            table,
            streams,
            last: HashMap::new(),
        }
    }

    /// Feeds one source record and returns the rows it derives.
    ///
    /// Records of unconfigured streams, records missing a key tag, and
    /// counters that are not numbers derive nothing; each record still
    /// replaces the remembered sample for the counters it does carry.
    pub fn observe(&mut self, record: &MetricRecord) -> Vec<DerivedMetric> {
        let mut derived = Vec::new();
        let Ok(partition) = self.streams.primary_key_values(record) else {
            return derived;
        };

        for (d, derivation) in self.table.iter().enumerate() {
            if derivation.source != record.measurement {
                continue;
            }
            for (i, dimension) in derivation.dimensions.iter().enumerate() {
                let Some(value) = record
                    .field(dimension.counter)
                    .and_then(|v| v.trim_end_matches(['i', 'u']).parse::<f64>().ok())
                else {
                    continue;
                };
                let current = Sample {
                    value,
                    timestamp: record.timestamp,
                };

                let previous = self.last.insert((d, i, partition.clone()), current);
                if let Some(per_sec) = previous.and_then(|p| rate(p, current)) {
                    derived.push(derived_row(derivation, dimension, record, per_sec));
                }
            }
        }
        derived
    }

    /// Number of partitions with a remembered sample.
    pub fn tracked(&self) -> usize {
        self.last.len()
    }
}

fn derived_row(
    derivation: &Derivation,
    dimension: &Dimension,
    source: &MetricRecord,
    per_sec: f64,
) -> DerivedMetric {
    let mut tags: Vec<(String, String)> = source
        .tags
        .iter()
        .filter(|(k, _)| k != DIRECTION_TAG)
        .cloned()
        .collect();
    tags.push((DIRECTION_TAG.to_string(), dimension.label.to_string()));

    DerivedMetric {
        measurement: derivation.metric.to_string(),
        tags,
        fields: vec![(derivation.unit.to_string(), per_sec.to_string())],
        timestamp: source.timestamp,
    }
}
