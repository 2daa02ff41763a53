//! Line-protocol codec.
//!
//! Records have the shape
//!
//! ```text
//! measurement,tag1=v1,tag2=v2 field1=v1,field2=v2 1700000000000000000
//! ```
//!
//! A backslash escapes the character after it, so whitespace, `,`, `=`
//! and `"` can appear inside names and values. Double-quoted regions are
//! never split; the quotes stay part of the value. Encoding escapes every
//! delimiter, so `decode(&encode(&r)) == r` for any valid record.
//!
//! # Example
//!
//! ```rust
//! use lineflow::line::{decode, encode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let record = decode("cpu,host=a,core=0 usage=5 1000000000")?;
//! assert_eq!(record.measurement, "cpu");
//! assert_eq!(record.tag("core"), Some("0"));
//! assert_eq!(encode(&record), "cpu,host=a,core=0 usage=5 1000000000");
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{CodecError, LineflowError, Result};

/// A single metric record: measurement, tags, fields, and a nanosecond
/// timestamp.
///
/// Tags and fields keep their insertion order so that re-encoding is
/// deterministic. Keys are unique within each set and the two sets never
/// share a key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetricRecord {
    /// Measurement (stream) name. Never empty for decoded records.
    pub measurement: String,
    /// Tag key/value pairs in input order.
    pub tags: Vec<(String, String)>,
    /// Field key/value pairs in input order. Values are kept as text.
    pub fields: Vec<(String, String)>,
    /// Timestamp in nanoseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A metric produced by a continuous query. Same shape and codec as an
/// input record.
pub type DerivedMetric = MetricRecord;

impl MetricRecord {
    /// Creates a record with no tags or fields.
    pub fn new(measurement: impl Into<String>, timestamp: i64) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp,
        }
    }

    /// Appends a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Appends a field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Looks up a tag value by key.
    pub fn tag(&self, key: &str) -> Option<&str> {
        lookup(&self.tags, key)
    }

    /// Looks up a field value by key.
    pub fn field(&self, key: &str) -> Option<&str> {
        lookup(&self.fields, key)
    }
}

impl FromStr for MetricRecord {
    type Err = LineflowError;

    fn from_str(s: &str) -> Result<Self> {
        decode(s)
    }
}

impl fmt::Display for MetricRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Decodes one line of line protocol.
///
/// A trailing `\n` or `\r\n` is ignored.
///
/// # Errors
///
/// Returns [`LineflowError::MalformedRecord`] when the line does not have
/// exactly three tokens, an element is not `key=value`, a key repeats or is
/// shared between tags and fields, escaping or quoting is unbalanced, or
/// the timestamp is not an integer.
pub fn decode(line: &str) -> Result<MetricRecord> {
    let line = line.trim_end_matches(['\n', '\r']);

    let tokens: Vec<&str> = split_unescaped(line, char::is_whitespace)?
        .into_iter()
        .filter(|t| !t.is_empty())
        .collect();
    let [identity, fields_str, timestamp] = tokens[..] else {
        return Err(CodecError::WrongTokenCount {
            found: tokens.len(),
        }
        .into());
    };

    let mut identity = split_unescaped(identity, |c| c == ',')?.into_iter();
    let measurement = unescape(identity.next().unwrap_or_default());
    if measurement.is_empty() {
        return Err(CodecError::EmptyMeasurement.into());
    }

    let tags = identity.map(parse_pair).collect::<Result<Vec<_>>>()?;
    let fields = split_unescaped(fields_str, |c| c == ',')?
        .into_iter()
        .map(parse_pair)
        .collect::<Result<Vec<_>>>()?;

    check_keys(&tags, &fields)?;

    let timestamp = timestamp
        .parse::<i64>()
        .map_err(|_| CodecError::InvalidTimestamp {
            raw: timestamp.to_string(),
        })?;

    Ok(MetricRecord {
        measurement,
        tags,
        fields,
        timestamp,
    })
}

/// Encodes a record as one line of line protocol, without a newline.
///
/// Tags and fields are both joined with `,`. A record without fields
/// encodes to a line that [`decode`] rejects. The output never contains a
/// line break: `\n` and `\r` in names or values become spaces.
pub fn encode(record: &MetricRecord) -> String {
    let mut out = String::with_capacity(64);
    escape_into(&mut out, &record.measurement);
    for (key, value) in &record.tags {
        out.push(',');
        escape_into(&mut out, key);
        out.push('=');
        escape_into(&mut out, value);
    }
    out.push(' ');
    for (i, (key, value)) in record.fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        escape_into(&mut out, key);
        out.push('=');
        escape_into(&mut out, value);
    }
    out.push(' ');
    out.push_str(&record.timestamp.to_string());
    out
}

/// Splits `input` at every separator that is neither escaped nor quoted.
///
/// Returned slices are still escaped.
fn split_unescaped(input: &str, is_sep: impl Fn(char) -> bool) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let mut quoted = false;

    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => quoted = !quoted,
            c if !quoted && is_sep(c) => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }

    if escaped {
        return Err(CodecError::DanglingEscape.into());
    }
    if quoted {
        return Err(CodecError::UnterminatedQuote.into());
    }
    parts.push(&input[start..]);
    Ok(parts)
}

/// Splits an escaped `key=value` element at the first unescaped, unquoted `=`.
fn parse_pair(element: &str) -> Result<(String, String)> {
    let mut escaped = false;
    let mut quoted = false;
    let mut split_at = None;

    for (i, c) in element.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => quoted = !quoted,
            '=' if !quoted => {
                split_at = Some(i);
                break;
            }
            _ => {}
        }
    }

    let Some(i) = split_at else {
        return Err(CodecError::MissingEquals {
            element: unescape(element),
        }
        .into());
    };

    let key = unescape(&element[..i]);
    if key.is_empty() {
        return Err(CodecError::EmptyKey {
            element: unescape(element),
        }
        .into());
    }
    Ok((key, unescape(&element[i + 1..])))
}

/// Rejects duplicate keys within tags or fields, and keys shared by both.
fn check_keys(tags: &[(String, String)], fields: &[(String, String)]) -> Result<()> {
    let mut tag_keys = HashSet::with_capacity(tags.len());
    for (key, _) in tags {
        if !tag_keys.insert(key.as_str()) {
            return Err(CodecError::DuplicateKey { key: key.clone() }.into());
        }
    }

    let mut field_keys = HashSet::with_capacity(fields.len());
    for (key, _) in fields {
        if !field_keys.insert(key.as_str()) {
            return Err(CodecError::DuplicateKey { key: key.clone() }.into());
        }
        if tag_keys.contains(key.as_str()) {
            return Err(CodecError::TagFieldOverlap { key: key.clone() }.into());
        }
    }
    Ok(())
}

/// Removes one level of backslash escaping. Quotes are kept.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Escapes `s` for line protocol.
///
/// Line breaks cannot be escaped within a line, so `\n` and `\r` are
/// written as an escaped space.
fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\n' | '\r' => out.push_str("\\ "),
            c if matches!(c, '\\' | ',' | '=' | '"') || c.is_whitespace() => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec_err(line: &str) -> CodecError {
        match decode(line) {
            Err(LineflowError::MalformedRecord(e)) => e,
            other => panic!("expected malformed record for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_basic() {
        let record = decode("cpu,host=a,core=0 usage=5,idle=95 1000000000\n").unwrap();

        assert_eq!(record.measurement, "cpu");
        assert_eq!(
            record.tags,
            vec![
                ("host".to_string(), "a".to_string()),
                ("core".to_string(), "0".to_string()),
            ]
        );
        assert_eq!(record.field("usage"), Some("5"));
        assert_eq!(record.field("idle"), Some("95"));
        assert_eq!(record.timestamp, 1_000_000_000);
    }

    #[test]
    fn test_decode_without_tags() {
        let record = decode("mem used=1024 42").unwrap();
        assert_eq!(record.measurement, "mem");
        assert!(record.tags.is_empty());
        assert_eq!(record.field("used"), Some("1024"));
    }

    #[test]
    fn test_decode_escaped_whitespace_and_commas() {
        let record = decode(r"disk,path=/mnt/my\ disk,label=a\,b free=1 7").unwrap();
        assert_eq!(record.tag("path"), Some("/mnt/my disk"));
        assert_eq!(record.tag("label"), Some("a,b"));
    }

    #[test]
    fn test_decode_quoted_field_keeps_spaces() {
        let record = decode(r#"syslog,host=a message="disk is full",code=3 9"#).unwrap();
        assert_eq!(record.field("message"), Some("\"disk is full\""));
        assert_eq!(record.field("code"), Some("3"));
    }

    #[test]
    fn test_decode_collapses_whitespace_runs() {
        let record = decode("cpu,host=a  usage=5   12").unwrap();
        assert_eq!(record.timestamp, 12);
    }

    #[test]
    fn test_value_may_contain_equals_after_first() {
        let record = decode("q,expr=a=b v=1 1").unwrap();
        assert_eq!(record.tag("expr"), Some("a=b"));
    }

    #[test]
    fn test_wrong_token_count() {
        assert_eq!(
            codec_err("cpu,host=a usage=5"),
            CodecError::WrongTokenCount { found: 2 }
        );
        assert_eq!(
            codec_err("cpu usage=5 1 extra"),
            CodecError::WrongTokenCount { found: 4 }
        );
        assert_eq!(codec_err(""), CodecError::WrongTokenCount { found: 0 });
    }

    #[test]
    fn test_malformed_pairs() {
        assert_eq!(
            codec_err("cpu,host usage=5 1"),
            CodecError::MissingEquals {
                element: "host".to_string()
            }
        );
        assert_eq!(
            codec_err("cpu,=a usage=5 1"),
            CodecError::EmptyKey {
                element: "=a".to_string()
            }
        );
        assert_eq!(
            codec_err("cpu usage=5, 1"),
            CodecError::MissingEquals {
                element: String::new()
            }
        );
    }

    #[test]
    fn test_key_uniqueness() {
        assert_eq!(
            codec_err("cpu,host=a,host=b usage=5 1"),
            CodecError::DuplicateKey {
                key: "host".to_string()
            }
        );
        assert_eq!(
            codec_err("cpu,host=a host=b 1"),
            CodecError::TagFieldOverlap {
                key: "host".to_string()
            }
        );
    }

    #[test]
    fn test_bad_escaping_and_quotes() {
        assert_eq!(codec_err(r"cpu usage=5 1\"), CodecError::DanglingEscape);
        assert_eq!(
            codec_err(r#"cpu msg="open 1"#),
            CodecError::UnterminatedQuote
        );
    }

    #[test]
    fn test_empty_measurement_and_bad_timestamp() {
        assert_eq!(codec_err(",host=a v=1 1"), CodecError::EmptyMeasurement);
        assert_eq!(
            codec_err("cpu v=1 12abc"),
            CodecError::InvalidTimestamp {
                raw: "12abc".to_string()
            }
        );
    }

    #[test]
    fn test_encode_joins_fields_with_commas() {
        let record = MetricRecord::new("cpu", 5)
            .with_tag("host", "a")
            .with_field("user", "1")
            .with_field("system", "2");
        assert_eq!(encode(&record), "cpu,host=a user=1,system=2 5");
    }

    #[test]
    fn test_encode_escapes_delimiters() {
        let record = MetricRecord::new("my metric", -3)
            .with_tag("path", "C:\\x y")
            .with_field("msg", "a=b,\"c\"");
        assert_eq!(
            encode(&record),
            r#"my\ metric,path=C:\\x\ y msg=a\=b\,\"c\" -3"#
        );
    }

    #[test]
    fn test_encode_never_breaks_the_line() {
        let record = MetricRecord::new("log\nline", 9)
            .with_tag("host", "a\r\nb")
            .with_field("msg", "first\nsecond");

        let line = encode(&record);
        assert_eq!(line, r"log\ line,host=a\ \ b msg=first\ second 9");
        assert!(!line.contains(['\n', '\r']));

        let decoded = decode(&line).unwrap();
        assert_eq!(decoded.measurement, "log line");
        assert_eq!(decoded.tags, vec![("host".to_string(), "a  b".to_string())]);
    }

    #[test]
    fn test_timestamp_is_normalized() {
        let record = decode("cpu usage=5 0001000").unwrap();
        assert_eq!(record.timestamp, 1000);
        assert_eq!(encode(&record), "cpu usage=5 1000");
    }

    #[test]
    fn test_roundtrip_with_awkward_values() {
        let record = MetricRecord::new("net io", 1_700_000_000_123_456_789)
            .with_tag("interface", "eth 0")
            .with_tag("note", "a,b=c\\d")
            .with_field("bytes_recv", "123")
            .with_field("status", "\"up, mostly\"")
            .with_field("tabbed", "x\ty");

        let line = encode(&record);
        assert_eq!(decode(&line).unwrap(), record);
        assert_eq!(line.parse::<MetricRecord>().unwrap(), record);
        assert_eq!(record.to_string(), line);
    }
}
