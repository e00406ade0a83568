//! tandem-probe: poke at a shared Tandem database from the command line.
//!
//! Every invocation acts as one process participating in the protocol, so a
//! few probes in separate terminals are enough to watch changes propagate.
//! Results are printed to stdout as JSON lines; logs go to stderr.
//!
//! ## Subcommands
//!
//! - `signature`: print the database's current signature
//! - `exec`: run SQL as a write (commits, then publishes)
//! - `publish`: announce a change without writing
//! - `signals`: list pending change signals
//! - `watch`: run the watcher and print every applied foreign change

mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tandem_core::queue::DeliveryPayload;
use tandem_core::{
    load_config, signature, ChangeWatcher, ForeignChange, SessionId, SyncContext, SyncError,
    SyncObserver, SyncStatus,
};

#[derive(Parser)]
#[command(name = "tandem-probe")]
#[command(about = "Diagnostics for Tandem change signals and cache coherence")]
#[command(version)]
struct Cli {
    /// Shared SQLite database
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Sync config file (defaults to ~/.tandem/sync.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Session id to act as (defaults to a fresh one)
    #[arg(long, global = true)]
    session: Option<String>,

    /// Write logs to a daily-rolling file in this directory instead of stderr
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current database signature
    Signature,

    /// Execute SQL as one write, then publish the change
    Exec {
        #[arg(long)]
        sql: String,
    },

    /// Publish a change signal for the current database state
    Publish,

    /// List pending change signals
    Signals,

    /// Run the change watcher
    Watch {
        /// How long to watch; 0 runs a single tick
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

struct JsonLines;

impl SyncObserver for JsonLines {
    fn on_data_changed(&self, changes: &[ForeignChange]) {
        emit(json!({ "event": "data_changed", "changes": changes }));
    }

    fn on_status(&self, status: SyncStatus) {
        emit(json!({ "event": "status", "detail": status }));
    }
}

fn emit(value: serde_json::Value) {
    println!("{value}");
}

fn main() {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.log_dir.as_deref());

    if let Err(err) = run(cli) {
        tracing::error!(error = %err, "tandem-probe failed");
        eprintln!("tandem-probe: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let db = cli.db.ok_or_else(|| "--db is required".to_string())?;
    let open = || -> Result<Arc<SyncContext>, String> {
        let mut builder = SyncContext::builder(&db)
            .config(load_config(cli.config.clone())?)
            .observer(Arc::new(JsonLines));
        if let Some(session) = &cli.session {
            builder = builder.session(SessionId::new(session.as_str())?);
        }
        Ok(Arc::new(builder.build()?))
    };

    match cli.command {
        Commands::Signature => {
            let signature = signature::compute(&db)?;
            emit(json!({ "path": db.display().to_string(), "signature": signature }));
        }
        Commands::Exec { sql } => {
            let ctx = open()?;
            ctx.router().with_write(|conn| {
                conn.execute_batch(&sql)
                    .map_err(|err| SyncError::sqlite("executing probe SQL", err))
            })?;
            emit(json!({ "event": "exec", "session_id": ctx.session() }));
        }
        Commands::Publish => {
            let outcome = open()?.publish_change()?;
            emit(json!({ "event": "published", "outcome": outcome }));
        }
        Commands::Signals => {
            let ctx = open()?;
            for delivery in ctx.queue().drain()? {
                let line = match &delivery.payload {
                    DeliveryPayload::Signal(signal) => {
                        let own = &signal.origin == ctx.session();
                        json!({
                            "file": delivery.key,
                            "origin": signal.origin,
                            "timestamp_ms": signal.timestamp_ms,
                            "signature": signal.signature,
                            "own": own,
                        })
                    }
                    DeliveryPayload::Malformed { reason } => json!({
                        "file": delivery.key,
                        "malformed": reason,
                    }),
                };
                emit(line);
            }
        }
        Commands::Watch { seconds } => {
            let ctx = open()?;
            if seconds == 0 {
                let report = ctx.watcher().tick();
                emit(json!({ "event": "tick", "report": report }));
                return Ok(());
            }
            let handle = ChangeWatcher::spawn(ctx)?;
            thread::sleep(Duration::from_secs(seconds));
            handle.stop();
        }
    }

    Ok(())
}
