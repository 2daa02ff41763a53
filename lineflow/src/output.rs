//! Line-atomic shared output.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use crate::line::{MetricRecord, encode};

/// A writer shared by every query worker.
///
/// Each [`emit`](SyncOutput::emit) writes one whole line and flushes it
/// while holding the lock, so lines from different threads never
/// interleave. Clones share the same writer and lock.
#[derive(Clone)]
pub struct SyncOutput {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SyncOutput {
    /// Wraps a writer.
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Shares the process's standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Writes `line` followed by a newline, then flushes.
    ///
    /// # Errors
    ///
    /// Returns the writer's I/O error.
    pub fn emit(&self, line: &str) -> io::Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');

        // A writer that panicked mid-line is still usable for whole lines.
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        sink.write_all(buf.as_bytes())?;
        sink.flush()
    }

    /// Encodes a record in line protocol and emits it.
    ///
    /// # Errors
    ///
    /// Returns the writer's I/O error.
    pub fn emit_record(&self, record: &MetricRecord) -> io::Result<()> {
        self.emit(&encode(record))
    }
}

impl fmt::Debug for SyncOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOutput").finish_non_exhaustive()
    }
}
