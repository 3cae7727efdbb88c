use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use photoconv::cli::{Cli, Commands};
use photoconv::database::{JobLedger, SqliteLedger};
use photoconv::engine::{self, RunSummary};
use photoconv::worker::format_bytes;
use photoconv::{Result, logging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Convert(args) => {
            let config = args.into_config()?;
            let cancel = CancellationToken::new();
            spawn_signal_handler(cancel.clone());

            let summary = engine::run(config, cancel).await?;
            print_summary(&summary);
            Ok(if summary.stats.failed > 0 { 1 } else { 0 })
        }
        Commands::Stats { db } => {
            let ledger = SqliteLedger::open(&db).await?;
            let stats = ledger.stats().await?;
            ledger.close().await;

            println!("Ledger statistics:");
            println!("  total:       {}", stats.total);
            println!("  ok:          {}", stats.ok);
            println!("  failed:      {}", stats.failed);
            println!("  in progress: {}", stats.in_progress);
            Ok(0)
        }
        Commands::Version => {
            println!("photoconv {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

/// Cancel the run on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("shutdown requested, stopping the run");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

fn print_summary(summary: &RunSummary) {
    let stats = &summary.stats;
    println!("Done.");
    println!("  processed: {}", stats.processed);
    println!("  skipped:   {}", stats.skipped);
    println!("  failed:    {}", stats.failed);

    if stats.input_bytes > 0 {
        println!("  input:     {}", format_bytes(stats.input_bytes));
        println!("  output:    {}", format_bytes(stats.output_bytes));
        let saved = stats.saved_bytes();
        if saved >= 0 {
            println!(
                "  saved:     {} ({:.1}%)",
                format_bytes(saved as u64),
                stats.saved_percent()
            );
        } else {
            println!(
                "  grew:      {} (+{:.1}%)",
                format_bytes(saved.unsigned_abs()),
                -stats.saved_percent()
            );
        }
    }
}
