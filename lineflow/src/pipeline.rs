//! The ingestion loop: decode, accumulate, flush on a fixed cadence.
//!
//! A reader thread forwards raw input lines, as bytes, over a channel. The
//! [`Ingester`] owns the [`BatchAccumulator`] and waits on that channel
//! with a deadline at the next flush instant, so appends and flushes
//! happen on one thread and the flush cadence does not depend on how fast
//! input arrives.

use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::batch::{BatchAccumulator, FlushReport};
use crate::error::{CodecError, LineflowError, Result};
use crate::ingest::IngestSink;
use crate::line::decode;
use crate::schema::StreamConfig;

/// Default flush period.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Counters kept across the life of an [`Ingester`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Lines appended to a batch.
    pub accepted: u64,
    /// Lines dropped as malformed or unbatchable.
    pub rejected: u64,
    /// Flushes performed.
    pub flushes: u64,
    /// Rows the sink accepted.
    pub rows_submitted: u64,
}

/// Owns the batches and drives them into an [`IngestSink`].
#[derive(Debug)]
pub struct Ingester<S> {
    accumulator: BatchAccumulator,
    sink: S,
    interval: Duration,
    stats: IngestStats,
}

impl<S: IngestSink> Ingester<S> {
    /// Creates an ingester flushing into `sink` every `interval`.
    pub fn new(streams: StreamConfig, sink: S, interval: Duration) -> Self {
        Self {
            accumulator: BatchAccumulator::new(streams),
            sink,
            interval,
            stats: IngestStats::default(),
        }
    }

    /// The pending batches.
    pub fn accumulator(&self) -> &BatchAccumulator {
        &self.accumulator
    }

    /// The sink batches are flushed into.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Counters so far.
    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Decodes one input line and appends it to its batch.
    ///
    /// Blank lines and `#` comments are ignored.
    ///
    /// # Errors
    ///
    /// Returns the decode or batching error; the line is dropped and no
    /// batch changes.
    pub fn ingest_line(&mut self, line: &str) -> Result<()> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(());
        }

        let outcome = decode(line).and_then(|record| self.accumulator.append(record));
        if outcome.is_ok() {
            self.stats.accepted += 1;
        } else {
            self.stats.rejected += 1;
        }
        outcome
    }

    /// Like [`ingest_line`](Self::ingest_line), for a line not yet known
    /// to be UTF-8.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidUtf8`] as a malformed record if the
    /// bytes are not UTF-8, otherwise whatever `ingest_line` returns.
    pub fn ingest_bytes(&mut self, line: &[u8]) -> Result<()> {
        match std::str::from_utf8(line) {
            Ok(text) => self.ingest_line(text),
            Err(e) => {
                self.stats.rejected += 1;
                Err(CodecError::InvalidUtf8 {
                    valid_up_to: e.valid_up_to(),
                }
                .into())
            }
        }
    }

    /// Submits every pending batch now.
    pub fn flush(&mut self) -> FlushReport {
        let report = self.accumulator.flush(&self.sink);
        self.stats.flushes += 1;
        self.stats.rows_submitted += report.rows_submitted as u64;
        report
    }

    /// Consumes lines until the input ends, flushing every interval, then
    /// flushes one last time.
    ///
    /// Bad lines, including lines that are not UTF-8, are logged and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`LineflowError::Input`] if reading the input failed. The
    /// final flush still happens first.
    pub fn run(&mut self, lines: &Receiver<io::Result<Vec<u8>>>) -> Result<()> {
        let mut next_flush = Instant::now() + self.interval;
        let mut read_error = None;

        loop {
            let now = Instant::now();
            if now >= next_flush {
                self.flush();
                next_flush += self.interval;
                let now = Instant::now();
                if next_flush <= now {
                    // A slow flush overran one or more periods; skip them.
                    next_flush = now + self.interval;
                }
                continue;
            }

            match lines.recv_timeout(next_flush - now) {
                Ok(Ok(line)) => {
                    if let Err(e) = self.ingest_bytes(&line) {
                        tracing::warn!("dropping record: {e}");
                    }
                }
                Ok(Err(e)) => {
                    read_error = Some(e);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let report = self.flush();
        if report.rows_retained > 0 {
            tracing::warn!(
                "input ended with {} undelivered row(s) in {} stream(s)",
                report.rows_retained,
                report.streams_retained
            );
        }
        let stats = self.stats;
        tracing::info!(
            "input ended: {} accepted, {} rejected, {} row(s) submitted in {} flush(es)",
            stats.accepted,
            stats.rejected,
            stats.rows_submitted,
            stats.flushes
        );

        match read_error {
            Some(e) => Err(LineflowError::Input(e)),
            None => Ok(()),
        }
    }
}

/// Forwards the lines of `reader` over a channel from a new thread.
///
/// Lines are sent as raw bytes without the trailing `\n` or `\r\n`, so
/// a line that is not UTF-8 reaches the ingester as a bad record instead
/// of ending the input. The channel closes at end of input, or right
/// after forwarding the first read error.
///
/// # Errors
///
/// Returns an error if the OS refuses to create the thread.
pub fn spawn_line_reader<R>(mut reader: R) -> io::Result<Receiver<io::Result<Vec<u8>>>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("line-reader".to_string())
        .spawn(move || {
            loop {
                let mut line = Vec::new();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => return,
                    Ok(_) => {
                        if line.last() == Some(&b'\n') {
                            line.pop();
                            if line.last() == Some(&b'\r') {
                                line.pop();
                            }
                        }
                        if tx.send(Ok(line)).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                }
            }
        })?;
    Ok(rx)
}
