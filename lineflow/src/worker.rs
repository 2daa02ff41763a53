//! Continuous query workers.
//!
//! A [`QueryWorker`] owns one continuous query for the life of the
//! process. It opens its own store connection, starts the query and
//! writes every row it yields to the shared output as line protocol. A
//! continuous query has no normal end: [`QueryWorker::run`] only ever
//! returns an error, which the supervisor treats as fatal.

use crate::derive::ContinuousQuery;
use crate::error::{QueryError, Result};
use crate::line::DerivedMetric;
use crate::output::SyncOutput;
use crate::store::StoreClient;

/// A worker bound to one continuous query.
#[derive(Debug)]
pub struct QueryWorker {
    query: ContinuousQuery,
    query_url: String,
    headers: Vec<(String, String)>,
    output: SyncOutput,
}

impl QueryWorker {
    /// Creates a worker that will send `query` to the store at `query_url`.
    pub fn new(query: ContinuousQuery, query_url: impl Into<String>, output: SyncOutput) -> Self {
        Self {
            query,
            query_url: query_url.into(),
            headers: Vec::new(),
            output,
        }
    }

    /// Adds HTTP headers sent with the query.
    #[must_use]
    pub fn with_headers(mut self, headers: &[(String, String)]) -> Self {
        self.headers.extend(headers.iter().cloned());
        self
    }

    /// The worker's name, also used as its thread name.
    pub fn name(&self) -> &str {
        &self.query.name
    }

    /// Runs the query until it fails.
    ///
    /// # Errors
    ///
    /// Always returns an error: a [`QueryError`] if the query cannot start,
    /// a row cannot be read or decoded, the output cannot be written, or
    /// the store ends the result stream.
    pub fn run(self) -> Result<()> {
        let client = StoreClient::for_queries(&self.query_url)?.with_headers(&self.headers);
        tracing::info!("starting continuous query '{}'", self.query.name);
        tracing::debug!("{}: {}", self.query.name, self.query.sql);

        let rows = client.query(&self.query.sql)?;
        forward_rows(rows, &self.output)
    }
}

/// Writes every row to `output` until the rows run out or one fails.
///
/// # Errors
///
/// Returns the first row error, [`QueryError::Output`] if writing fails,
/// or [`QueryError::StreamEnded`] once the rows are exhausted.
pub fn forward_rows<I>(rows: I, output: &SyncOutput) -> Result<()>
where
    I: IntoIterator<Item = Result<DerivedMetric>>,
{
    let mut forwarded = 0;
    for row in rows {
        let row = row?;
        output
            .emit_record(&row)
            .map_err(|e| QueryError::Output { source: e })?;
        forwarded += 1;
    }
    Err(QueryError::StreamEnded { rows: forwarded }.into())
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::LineflowError;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn derived(value: &str, ts: i64) -> DerivedMetric {
        DerivedMetric::new("power", ts)
            .with_tag("host", "a")
            .with_tag("direction", "total")
            .with_field("watts", value)
    }

    #[test]
    fn test_forward_rows_then_stream_ended() {
        let buffer = SharedBuffer::default();
        let output = SyncOutput::new(buffer.clone());

        let err = forward_rows(vec![Ok(derived("3.6", 10)), Ok(derived("4", 20))], &output)
            .unwrap_err();

        assert!(matches!(
            err,
            LineflowError::Query(QueryError::StreamEnded { rows: 2 })
        ));
        assert_eq!(
            buffer.contents(),
            "power,host=a,direction=total watts=3.6 10\npower,host=a,direction=total watts=4 20\n"
        );
    }

    #[test]
    fn test_forward_rows_stops_at_bad_row() {
        let buffer = SharedBuffer::default();
        let output = SyncOutput::new(buffer.clone());

        let rows = vec![
            Ok(derived("1", 1)),
            Err(QueryError::BadRow {
                row: "{}".to_string(),
                reason: "missing field `measurement`".to_string(),
            }
            .into()),
            Ok(derived("2", 2)),
        ];
        let err = forward_rows(rows, &output).unwrap_err();

        assert!(matches!(
            err,
            LineflowError::Query(QueryError::BadRow { .. })
        ));
        assert_eq!(buffer.contents().lines().count(), 1);
    }

    #[test]
    fn test_worker_fails_when_store_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let query = ContinuousQuery {
            name: "power.total".to_string(),
            sql: "SELECT 1".to_string(),
        };
        let worker = QueryWorker::new(
            query,
            format!("http://{addr}/"),
            SyncOutput::new(io::sink()),
        );
        assert_eq!(worker.name(), "power.total");

        let err = worker.run().unwrap_err();
        assert!(matches!(
            err,
            LineflowError::Query(QueryError::Start { .. })
        ));
    }
}
