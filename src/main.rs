//! Zone Firewall CLI.

use anyhow::Result;
use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use zentinel_agent_zone_firewall::audit::spawn_file_writer;
use zentinel_agent_zone_firewall::clock::SystemClock;
use zentinel_agent_zone_firewall::source::{ColumnMapping, CsvRecordSource};
use zentinel_agent_zone_firewall::{Config, DecisionEvent, Firewall, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "zentinel-zone-firewall")]
#[command(about = "Zone firewall for Zentinel - classify traffic records against allow/block lists and per-zone rules")]
#[command(version)]
struct Args {
    /// Path to configuration file (built-in defaults when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Traffic records to process
    #[arg(short, long, default_value = "test-dataset.csv")]
    input: PathBuf,

    /// Audit log file (overrides audit.path from the configuration)
    #[arg(short, long)]
    audit_log: Option<PathBuf>,

    /// Remove IP from the block list once the input is processed (repeatable)
    #[arg(long, value_name = "IP")]
    unblock: Vec<String>,

    /// Print each decision as a JSON line on stdout
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let config = match &args.config {
        Some(path) => {
            info!(config = %path.display(), "Loading configuration");
            Config::load(path)?
        }
        None => {
            info!("Using built-in configuration");
            Config::default()
        }
    };

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    // Open the source before anything is audited; a missing file is fatal.
    let source = CsvRecordSource::open(&args.input, ColumnMapping::from(&config.input))?;

    let audit_path = args.audit_log.clone().unwrap_or_else(|| config.audit.path.clone());
    info!(input = %args.input.display(), audit = %audit_path.display(), "Processing traffic records");
    let (audit, writer) = spawn_file_writer(audit_path);

    let firewall = Firewall::new(&config, Arc::new(SystemClock), Arc::new(audit))?;

    let (summary, failure) = {
        let mut pipeline = Pipeline::new(&firewall, source);
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut print = args.json;
        for event in pipeline.by_ref() {
            if print && !print_event(&mut out, &event)? {
                // Reader went away; keep classifying without output.
                debug!("stdout closed, no longer printing decisions");
                print = false;
            }
        }
        if print {
            ignore_broken_pipe(out.flush())?;
        }
        (pipeline.summary().clone(), pipeline.failure().map(|e| e.to_string()))
    };

    for ip in &args.unblock {
        firewall.remove_from_block_list(ip);
    }

    info!(
        records = summary.records,
        threats = summary.threats,
        blocked = ?firewall.blocked_ips(),
        "Run complete"
    );

    // Dropping the firewall releases the last audit sender so the writer can drain.
    drop(firewall);
    writer.await?;

    if let Some(error) = failure {
        anyhow::bail!("input processing aborted: {}", error);
    }

    Ok(())
}

/// Write `event` as one JSON line. Returns false once the reader has gone away.
fn print_event(out: &mut impl Write, event: &DecisionEvent) -> Result<bool> {
    let line = serde_json::to_string(event)?;
    match writeln!(out, "{}", line) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn ignore_broken_pipe(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}
