//! Run orchestration.
//!
//! Wires the components for one conversion run: recovery sweep, feeder,
//! worker pool. The ledger is opened once and shared; recovery completes
//! before the feeder starts.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::converter::Converter;
use crate::database::{JobLedger, SqliteLedger};
use crate::scanner::Scanner;
use crate::worker::{StatsSnapshot, WorkerPool};
use crate::Result;

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    /// Rows reclassified by the startup recovery sweep.
    pub recovered: u64,
    /// Final worker counters.
    pub stats: StatsSnapshot,
}

/// Execute one conversion run to completion (or cancellation).
pub async fn run(config: EngineConfig, cancel: CancellationToken) -> Result<RunSummary> {
    let config = Arc::new(config);

    let converter = Arc::new(Converter::new(config.clone()));
    if !config.dry_run {
        converter.health_check().await?;
    }

    let ledger = Arc::new(SqliteLedger::open(&config.db_path).await?);

    // Recovery must finish before any descriptor is emitted.
    let recovered = ledger.sweep_in_progress().await?;
    if recovered > 0 {
        info!("{recovered} interrupted tasks cleaned");
    }

    let scanner = Scanner::new(config.clone());
    let (files_rx, mut walk_err_rx) = scanner.start(cancel.clone());

    let pool = WorkerPool::new(
        config.clone(),
        ledger.clone() as Arc<dyn JobLedger>,
        converter,
    );
    let stats = pool.run(files_rx, cancel.clone()).await;

    ledger.close().await;

    // The walker has finished once the descriptor channel drained; a fatal
    // error (unreadable root) aborts the run.
    if let Some(e) = walk_err_rx.recv().await {
        return Err(e);
    }

    Ok(RunSummary { recovered, stats })
}
