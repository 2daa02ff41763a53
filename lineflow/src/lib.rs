//! # lineflow
//!
//! Line-protocol metrics pipeline for a streaming SQL store.
//!
//! lineflow reads Telegraf-style line protocol, batches records per
//! measurement into primary-keyed, upserting streams, and flushes the
//! batches to the store's HTTP ingestion API on a fixed cadence. Alongside
//! ingestion, a fixed set of continuous queries turn monotonically
//! increasing counters (energy, network, disk) into per-second rates, and
//! the rows they yield are written back out as line protocol.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::io::BufReader;
//! use lineflow::{Ingester, IngestClient, PipelineConfig};
//! use lineflow::pipeline::spawn_line_reader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default();
//! let client = IngestClient::new(config.ingest_config())?;
//!
//! let lines = spawn_line_reader(BufReader::new(std::io::stdin()))?;
//! let mut ingester = Ingester::new(config.streams.clone(), client, config.flush_interval());
//! ingester.run(&lines)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Ingester`]: owns the batches, flushes them on a deadline loop
//! - [`StreamConfig`]: primary-key tags per measurement
//! - [`QueryWorker`]: one continuous query on its own thread
//! - [`SyncOutput`]: line-atomic output shared by the workers
//!
//! ## Modules
//!
//! - [`line`]: line-protocol decoding and encoding
//! - [`schema`]: stream configuration and primary-key resolution
//! - [`batch`]: per-stream batch accumulation and flushing
//! - [`ingest`]: HTTP ingestion client
//! - [`store`]: SQL control and continuous query client
//! - [`provision`]: destination stream DDL
//! - [`derive`]: rate derivations, their queries, and a local tracker
//! - [`worker`]: continuous query workers
//! - [`output`]: synchronized output
//! - [`pipeline`]: the ingestion loop and input reader
//! - [`supervisor`]: component threads and exit reporting
//! - [`config`]: file and default configuration
//! - [`error`]: error types

pub mod batch;
pub mod config;
pub mod derive;
pub mod error;
pub mod ingest;
pub mod line;
pub mod output;
pub mod pipeline;
pub mod provision;
pub mod schema;
pub mod store;
pub mod supervisor;
pub mod worker;

// Re-export primary API types at crate root for convenience.
pub use batch::{BatchAccumulator, FlushReport};
pub use config::PipelineConfig;
pub use derive::{ContinuousQuery, DERIVATIONS, RateTracker};
pub use error::{LineflowError, Result};
pub use ingest::{IngestClient, IngestConfig, IngestSink};
pub use line::{DerivedMetric, MetricRecord};
pub use output::SyncOutput;
pub use pipeline::Ingester;
pub use schema::StreamConfig;
pub use store::{StoreClient, StoreControl};
pub use supervisor::Supervisor;
pub use worker::QueryWorker;
