//! docgraph CLI tool
//!
//! Command-line interface for running document-event reconciliation with docgraph-sync.
//!
//! ## Commands
//!
//! - `process`: Run one event processing pass
//! - `snapshot`: Run one snapshot pass
//! - `serve`: Run the listener, processing and snapshot workers until Ctrl-C
//! - `failures`: List dead-lettered events
//! - `requeue`: Move dead-lettered events back onto the queue

use clap::{Parser, Subcommand};
use docgraph_sync::{
    config::{ConfigProvider, SyncConfig, TomlConfigProvider, DEFAULT_CONFIG_FILE},
    db::{db_init, DbConnection},
    processor::{EventProcessor, PassOutcome},
    service::SyncService,
    snapshot::{SnapshotOutcome, SnapshotWorker},
    tokenizer::Tokenizer,
    SyncError,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

#[derive(Parser)]
#[command(name = "docgraph")]
#[command(author, version, about = "Reconcile document change events into the node/space graph", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drain the event queue once
    Process {
        /// Fail on the first reconciliation error
        #[arg(long)]
        strict: bool,
    },

    /// Version recently changed documents once
    Snapshot,

    /// Run all workers until interrupted
    Serve,

    /// List events that failed reconciliation
    Failures,

    /// Replay failed events through the queue
    Requeue,
}

fn load_config(path: Option<PathBuf>) -> Result<SyncConfig, SyncError> {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    TomlConfigProvider::new(path).get_config()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    match cli.command {
        Commands::Serve => serve(config),
        command => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run_once(command, config))?;
            Ok(())
        }
    }
}

fn serve(config: SyncConfig) -> Result<(), Box<dyn std::error::Error>> {
    let service = SyncService::new(config)?;
    service.start()?;
    println!(
        "Serving {}. Press Ctrl-C to stop.",
        service.config().database_path.display()
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })?;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    service.shutdown();
    println!("Shutdown complete");
    Ok(())
}

async fn run_once(command: Commands, mut config: SyncConfig) -> Result<(), SyncError> {
    let db = DbConnection(db_init(&config.database_path).await?);
    match command {
        Commands::Process { strict } => {
            config.strict |= strict;
            let tokenizer = Arc::new(Tokenizer::for_model(&config.tokenizer_model)?);
            let processor = EventProcessor::new(db.clone(), tokenizer, config.processor_options());
            match tokio::time::timeout(config.pass_timeout(), processor.process_pending()).await?? {
                PassOutcome::Contended => println!("Another pass is running; nothing done."),
                PassOutcome::Completed(stats) => {
                    println!("\n=== Pass Results ===");
                    println!("Claimed: {}", stats.claimed);
                    println!("Applied: {}", stats.applied);
                    println!("Ignored: {}", stats.ignored);
                    println!("Failed: {}", stats.failed);
                    println!("Skipped: {}", stats.skipped);
                }
            }
        }
        Commands::Snapshot => {
            let worker = SnapshotWorker::new(db.clone(), config.snapshot_options());
            match tokio::time::timeout(config.snapshot_timeout(), worker.run()).await?? {
                SnapshotOutcome::Contended => {
                    println!("Another snapshot pass is running; nothing done.")
                }
                SnapshotOutcome::Completed(stats) => {
                    println!("\n=== Snapshot Results ===");
                    println!("New versions: {}", stats.created);
                    println!("Unchanged: {}", stats.unchanged);
                    println!("Initial versions: {}", stats.initial);
                    println!("Invalid: {}", stats.invalid);
                }
            }
        }
        Commands::Failures => {
            let failures = db.failed_events().await?;
            if failures.is_empty() {
                println!("No failed events.");
            }
            for failure in failures {
                println!(
                    "#{} {} {} {} (queued {}, failed {}): {}",
                    failure.event_id,
                    failure.document_type,
                    failure.action,
                    failure.public_id,
                    failure.event_created_at,
                    failure.failed_at,
                    failure.error
                );
            }
        }
        Commands::Requeue => {
            let moved = db.requeue_failed_events().await?;
            println!("Requeued {moved} events.");
        }
        Commands::Serve => {
            return Err(SyncError::Custom("serve runs on its own runtime".to_string()));
        }
    }
    db.pool().close().await;
    Ok(())
}
