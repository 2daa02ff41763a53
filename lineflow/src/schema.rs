//! Stream configuration and primary-key resolution.
//!
//! A [`StreamConfig`] maps each measurement to the ordered list of tag
//! names that form its primary key in the store. The order is significant:
//! it fixes both the column order of the stream schema and the value order
//! in every ingested row.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, ConfigError, LineflowError, Result};
use crate::line::MetricRecord;

/// Column holding the record's tag map.
pub const TAGS_COLUMN: &str = "tags";
/// Column holding the record's field map.
pub const FIELDS_COLUMN: &str = "fields";
/// Column holding the nanosecond timestamp.
pub const TIMESTAMP_COLUMN: &str = "timestamp";
/// Column holding the human-readable UTC timestamp.
pub const DISPLAY_TIMESTAMP_COLUMN: &str = "display_timestamp";

/// Columns every stream carries after its primary-key columns, in order.
pub const VALUE_COLUMNS: [&str; 4] = [
    TAGS_COLUMN,
    FIELDS_COLUMN,
    TIMESTAMP_COLUMN,
    DISPLAY_TIMESTAMP_COLUMN,
];

/// Per-measurement primary-key configuration.
///
/// Loaded once at startup and immutable afterwards. Iteration order is the
/// lexical order of measurement names.
///
/// # Example
///
/// ```rust
/// use lineflow::line::MetricRecord;
/// use lineflow::schema::StreamConfig;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = StreamConfig::new([("cpu", vec!["host", "core"])])?;
/// let record = MetricRecord::new("cpu", 1)
///     .with_tag("core", "0")
///     .with_tag("host", "a")
///     .with_field("usage", "5");
///
/// assert_eq!(config.primary_key_values(&record)?, vec!["a", "0"]);
/// assert_eq!(
///     config.columns("cpu").unwrap(),
///     vec!["host", "core", "tags", "fields", "timestamp", "display_timestamp"],
/// );
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamConfig {
    streams: BTreeMap<String, Vec<String>>,
}

impl StreamConfig {
    /// Builds and validates a configuration from `(measurement, key tags)`
    /// pairs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a stream name or key definition is
    /// invalid (see [`StreamConfig::validate`]).
    pub fn new<I, M, K, T>(streams: I) -> Result<Self>
    where
        I: IntoIterator<Item = (M, K)>,
        M: Into<String>,
        K: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let config = Self {
            streams: streams
                .into_iter()
                .map(|(m, keys)| (m.into(), keys.into_iter().map(Into::into).collect()))
                .collect(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Primary keys for the measurements Telegraf's default inputs emit,
    /// including the counter sources of the built-in derivations.
    pub fn telegraf_defaults() -> Self {
        let streams = [
            ("cpu", &["host", "cpu"][..]),
            ("mem", &["host"][..]),
            ("energy", &["host", "meter"][..]),
            ("net", &["host", "interface"][..]),
            ("diskio", &["host", "name"][..]),
        ];
        Self {
            streams: streams
                .into_iter()
                .map(|(m, keys)| (m.to_string(), keys.iter().map(ToString::to_string).collect()))
                .collect(),
        }
    }

    /// Validates stream names and primary-key definitions.
    ///
    /// Stream names must be non-empty and free of whitespace, `/` and
    /// backquotes, since they appear in URLs and quoted identifiers. Each
    /// primary key must name at least one tag, without repeats, and must
    /// not collide with the value columns.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidStreamName`] or
    /// [`ConfigError::InvalidPrimaryKey`].
    pub fn validate(&self) -> Result<()> {
        for (stream, keys) in &self.streams {
            if stream.is_empty()
                || stream
                    .chars()
                    .any(|c| c.is_whitespace() || c == '/' || c == '`')
            {
                return Err(ConfigError::InvalidStreamName {
                    stream: stream.clone(),
                }
                .into());
            }

            let invalid = |reason: String| ConfigError::InvalidPrimaryKey {
                stream: stream.clone(),
                reason,
            };

            if keys.is_empty() {
                return Err(invalid("at least one key tag is required".to_string()).into());
            }

            for (i, key) in keys.iter().enumerate() {
                if key.is_empty() {
                    return Err(invalid("empty tag name".to_string()).into());
                }
                if key.contains('`') {
                    return Err(invalid(format!("tag name '{key}' contains a backquote")).into());
                }
                if VALUE_COLUMNS.contains(&key.as_str()) {
                    return Err(invalid(format!("tag name '{key}' is a reserved column")).into());
                }
                if keys[..i].contains(key) {
                    return Err(invalid(format!("tag name '{key}' repeats")).into());
                }
            }
        }
        Ok(())
    }

    /// Returns the ordered key tags for a measurement, if configured.
    pub fn primary_key(&self, measurement: &str) -> Option<&[String]> {
        self.streams.get(measurement).map(Vec::as_slice)
    }

    /// Resolves a record's primary-key values in configured order.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::UnknownMeasurement`] if the measurement has no
    /// stream, or [`BatchError::MissingPrimaryKeyTag`] naming the first key
    /// tag absent from the record.
    pub fn primary_key_values(&self, record: &MetricRecord) -> Result<Vec<String>> {
        let keys =
            self.primary_key(&record.measurement)
                .ok_or_else(|| BatchError::UnknownMeasurement {
                    measurement: record.measurement.clone(),
                })?;

        keys.iter()
            .map(|key| {
                record
                    .tag(key)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        LineflowError::from(BatchError::MissingPrimaryKeyTag {
                            measurement: record.measurement.clone(),
                            tag: key.clone(),
                        })
                    })
            })
            .collect()
    }

    /// Returns the destination columns for a measurement: key tags, then
    /// [`VALUE_COLUMNS`].
    pub fn columns(&self, measurement: &str) -> Option<Vec<String>> {
        let keys = self.primary_key(measurement)?;
        let mut columns = Vec::with_capacity(keys.len() + VALUE_COLUMNS.len());
        columns.extend(keys.iter().cloned());
        columns.extend(VALUE_COLUMNS.iter().map(ToString::to_string));
        Some(columns)
    }

    /// Iterates `(measurement, key tags)` in measurement order.
    pub fn streams(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.streams
            .iter()
            .map(|(m, keys)| (m.as_str(), keys.as_slice()))
    }

    /// Returns `true` if the measurement has a configured stream.
    pub fn contains(&self, measurement: &str) -> bool {
        self.streams.contains_key(measurement)
    }

    /// Number of configured streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Returns `true` if no streams are configured.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::telegraf_defaults()
    }
}
