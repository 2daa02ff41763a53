//! CLI for the lineflow ingester and continuous query workers.
//!
//! `lineflow run` is the long-running pipeline: it recreates the
//! destination streams, starts one worker thread per continuous query,
//! ingests line protocol from stdin and exits when the first component
//! ends. The other commands run a single stage, mostly for inspection.

use std::error::Error;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use lineflow::batch::PendingRow;
use lineflow::ingest::build_payload;
use lineflow::pipeline::spawn_line_reader;
use lineflow::provision::recreate_streams;
use lineflow::supervisor::ExitOutcome;
use lineflow::{
    BatchAccumulator, DERIVATIONS, IngestClient, IngestSink, Ingester, PipelineConfig,
    QueryWorker, RateTracker, StoreClient, Supervisor, SyncOutput, derive, line,
};
use tracing_subscriber::EnvFilter;

/// lineflow: line-protocol ingestion and rate derivation for a streaming store.
#[derive(Parser)]
#[command(name = "lineflow", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Provision streams, start the query workers and ingest stdin.
    Run {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Drop and recreate the destination streams, then exit.
    Provision {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print every continuous query with its worker name.
    Queries {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Validate line protocol from stdin and print the payloads that would
    /// be ingested, without contacting the store.
    Check {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Derive rates from line protocol on stdin locally, without a store.
    Derive {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Configuration file and endpoint overrides shared by all commands.
#[derive(Args)]
struct ConfigArgs {
    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Store host; sets both endpoints on their default ports.
    #[arg(long)]
    store_host: Option<String>,

    /// Base URL of the ingestion endpoints (overrides --store-host).
    #[arg(long)]
    ingest_url: Option<String>,

    /// URL of the SQL endpoint (overrides --store-host).
    #[arg(long)]
    query_url: Option<String>,
}

impl ConfigArgs {
    fn resolve(self) -> lineflow::Result<PipelineConfig> {
        let mut config = PipelineConfig::load_or_default(self.config.as_deref())?;
        if let Some(host) = self.store_host {
            config = config.with_store_host(&host);
        }
        if let Some(url) = self.ingest_url {
            config.store.ingest_url = url;
        }
        if let Some(url) = self.query_url {
            config.store.query_url = url;
        }
        Ok(config)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config } => config.resolve().map_err(Into::into).and_then(cmd_run),
        Commands::Provision { config } => {
            config.resolve().map_err(Into::into).and_then(cmd_provision)
        }
        Commands::Queries { config } => config.resolve().map_err(Into::into).and_then(cmd_queries),
        Commands::Check { config } => config.resolve().map_err(Into::into).and_then(cmd_check),
        Commands::Derive { config } => config.resolve().map_err(Into::into).and_then(cmd_derive),
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn control_client(config: &PipelineConfig) -> lineflow::Result<StoreClient> {
    Ok(
        StoreClient::for_control(&config.store.query_url, config.store.timeout())?
            .with_headers(&config.store.headers),
    )
}

/// Implements `lineflow run`.
fn cmd_run(config: PipelineConfig) -> Result<(), Box<dyn Error>> {
    let created = recreate_streams(&control_client(&config)?, &config.streams)?;
    tracing::info!("provisioned {created} stream(s)");

    let output = SyncOutput::stdout();
    let mut supervisor = Supervisor::new();

    for query in derive::continuous_queries(DERIVATIONS, &config.streams) {
        let worker = QueryWorker::new(query, &config.store.query_url, output.clone())
            .with_headers(&config.store.headers);
        supervisor.spawn(worker.name().to_string(), move || worker.run())?;
    }

    let client = IngestClient::new(config.ingest_config())?;
    let interval = config.flush_interval();
    let lines = spawn_line_reader(BufReader::new(io::stdin()))?;
    let mut ingester = Ingester::new(config.streams, client, interval);
    supervisor.spawn("ingester", move || ingester.run(&lines))?;

    tracing::info!("running {} component(s)", supervisor.len());

    // Reaching the end of stdin only stops the ingester; the query workers
    // keep forwarding rows until one of them fails.
    let Some(exit) = supervisor.wait_for_failure() else {
        tracing::info!("all components finished");
        return Ok(());
    };
    match exit.outcome {
        ExitOutcome::Finished => Ok(()),
        ExitOutcome::Failed(e) => Err(format!("{} failed: {e}", exit.component).into()),
        ExitOutcome::Panicked(msg) => Err(format!("{} panicked: {msg}", exit.component).into()),
    }
}

/// Implements `lineflow provision`.
fn cmd_provision(config: PipelineConfig) -> Result<(), Box<dyn Error>> {
    let created = recreate_streams(&control_client(&config)?, &config.streams)?;
    println!("Recreated {created} stream(s) at {}", config.store.query_url);
    Ok(())
}

/// Implements `lineflow queries`.
fn cmd_queries(config: PipelineConfig) -> Result<(), Box<dyn Error>> {
    for query in derive::continuous_queries(DERIVATIONS, &config.streams) {
        println!("-- {}", query.name);
        println!("{};", query.sql);
        println!();
    }
    Ok(())
}

/// Prints each batch as the JSON document the ingestion client would post.
struct PrintSink;

impl IngestSink for PrintSink {
    fn submit(&self, stream: &str, columns: &[String], rows: &[PendingRow]) -> lineflow::Result<()> {
        let document = serde_json::json!({
            "stream": stream,
            "payload": build_payload(columns, rows),
        });
        match serde_json::to_string_pretty(&document) {
            Ok(text) => println!("{text}"),
            Err(e) => tracing::warn!("cannot render payload for '{stream}': {e}"),
        }
        Ok(())
    }
}

/// Implements `lineflow check`.
fn cmd_check(config: PipelineConfig) -> Result<(), Box<dyn Error>> {
    let mut batches = BatchAccumulator::new(config.streams);
    let mut rejected = 0usize;

    for (n, text) in io::stdin().lock().lines().enumerate() {
        let text = text?;
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Err(e) = line::decode(&text).and_then(|record| batches.append(record)) {
            tracing::warn!("line {}: {e}", n + 1);
            rejected += 1;
        }
    }

    let accepted = batches.pending_rows();
    batches.flush(&PrintSink);
    tracing::info!("{accepted} record(s) accepted, {rejected} rejected");

    if rejected > 0 {
        return Err(format!("{rejected} line(s) rejected").into());
    }
    Ok(())
}

/// Implements `lineflow derive`.
fn cmd_derive(config: PipelineConfig) -> Result<(), Box<dyn Error>> {
    let output = SyncOutput::stdout();
    let mut tracker = RateTracker::new(DERIVATIONS, config.streams);

    for text in io::stdin().lock().lines() {
        let text = text?;
        if text.trim().is_empty() {
            continue;
        }
        match line::decode(&text) {
            Ok(record) => {
                for derived in tracker.observe(&record) {
                    output.emit_record(&derived)?;
                }
            }
            Err(e) => tracing::warn!("dropping record: {e}"),
        }
    }
    Ok(())
}
