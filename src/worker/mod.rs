//! Worker pool.
//!
//! Fixed-size pool of workers pulling source descriptors from the feeder
//! channel. Per file: optional content hash, admission, atomic conversion,
//! ledger finalize. All counters are lock-free atomics; the pool returns one
//! consistent snapshot on completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, Mode, OutputShape};
use crate::converter::Converter;
use crate::database::ledger::CONTENT_DUPLICATE_ERROR;
use crate::database::models::{SkipReason, SourceMeta, StartOutcome};
use crate::database::JobLedger;
use crate::hasher;
use crate::scanner::SourceFile;
use crate::{Error, Result};

/// Estimated peak memory per conversion as a multiple of source size.
const MEMORY_ESTIMATE_FACTOR: u64 = 3;

/// Run counters.
#[derive(Default)]
pub struct WorkerStats {
    total: AtomicU64,
    processed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    input_bytes: AtomicU64,
    output_bytes: AtomicU64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            input_bytes: self.input_bytes.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
}

impl StatsSnapshot {
    pub fn saved_bytes(&self) -> i64 {
        self.input_bytes as i64 - self.output_bytes as i64
    }

    pub fn saved_percent(&self) -> f64 {
        if self.input_bytes == 0 {
            return 0.0;
        }
        self.saved_bytes() as f64 / self.input_bytes as f64 * 100.0
    }
}

/// Human-readable byte count (1024-based units).
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!(
        "{:.1} {}B",
        bytes as f64 / div as f64,
        ['K', 'M', 'G', 'T', 'P', 'E'][exp]
    )
}

/// Optional memory budget for in-flight conversions.
///
/// Workers reserve an estimated multiple of the source size before invoking
/// the converter and release it afterwards; reservation waits when the budget
/// is exhausted. Permits are MiB-granular.
pub struct MemoryLimiter {
    semaphore: Option<Arc<Semaphore>>,
    budget_mib: u64,
}

/// Held while a conversion is in flight; dropping releases the budget.
#[derive(Debug)]
pub struct MemoryReservation {
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl MemoryLimiter {
    pub fn new(max_memory_mb: u64) -> Self {
        if max_memory_mb == 0 {
            return Self {
                semaphore: None,
                budget_mib: 0,
            };
        }
        let budget_mib = max_memory_mb.min(u32::MAX as u64);
        Self {
            semaphore: Some(Arc::new(Semaphore::new(budget_mib as usize))),
            budget_mib,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.semaphore.is_some()
    }

    /// Reserve budget for one conversion, waiting if necessary.
    pub async fn reserve(
        &self,
        file_size: u64,
        cancel: &CancellationToken,
    ) -> Result<MemoryReservation> {
        let Some(semaphore) = &self.semaphore else {
            return Ok(MemoryReservation { _permit: None });
        };

        let estimate_mib = file_size
            .saturating_mul(MEMORY_ESTIMATE_FACTOR)
            .div_ceil(1024 * 1024)
            .clamp(1, self.budget_mib) as u32;

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            permit = semaphore.clone().acquire_many_owned(estimate_mib) => {
                let permit = permit.map_err(|_| Error::Cancelled)?;
                Ok(MemoryReservation { _permit: Some(permit) })
            }
        }
    }
}

struct Shared {
    config: Arc<EngineConfig>,
    ledger: Arc<dyn JobLedger>,
    converter: Arc<Converter>,
    shape: OutputShape,
    limiter: MemoryLimiter,
    stats: WorkerStats,
}

/// Fixed-size worker pool.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(
        config: Arc<EngineConfig>,
        ledger: Arc<dyn JobLedger>,
        converter: Arc<Converter>,
    ) -> Self {
        let shape = OutputShape::from_options(&config.output);
        let limiter = MemoryLimiter::new(config.max_memory_mb);
        Self {
            shared: Arc::new(Shared {
                config,
                ledger,
                converter,
                shape,
                limiter,
                stats: WorkerStats::default(),
            }),
        }
    }

    /// Drain the descriptor channel with the configured number of workers and
    /// return the final counter snapshot.
    pub async fn run(
        &self,
        rx: mpsc::Receiver<SourceFile>,
        cancel: CancellationToken,
    ) -> StatsSnapshot {
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();

        info!("starting {} workers", self.shared.config.workers);
        for id in 0..self.shared.config.workers {
            let shared = self.shared.clone();
            let rx = rx.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                debug!("worker {id} started");
                loop {
                    let file = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            file = guard.recv() => file,
                        }
                    };
                    let Some(file) = file else { break };
                    process_file(&shared, file, &cancel).await;
                }
                debug!("worker {id} stopped");
            });
        }

        while workers.join_next().await.is_some() {}
        self.shared.stats.snapshot()
    }
}

async fn process_file(shared: &Shared, mut file: SourceFile, cancel: &CancellationToken) {
    let stats = &shared.stats;
    stats.total.fetch_add(1, Ordering::Relaxed);

    let dedup = shared.config.mode == Mode::Dedup;
    if dedup {
        match hasher::sha256_file(&file.path).await {
            Ok(digest) => file.content_sha256 = Some(digest),
            Err(e) => {
                warn!("{}: {e}", file.path.display());
                stats.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    let meta = SourceMeta {
        path: file.path.to_string_lossy().into_owned(),
        size: file.size as i64,
        mtime: file.mtime,
        content_sha256: file.content_sha256.clone(),
    };

    let outcome = match shared.ledger.try_start(&meta, &shared.shape, dedup).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("admission failed for {}: {e}", file.rel_path.display());
            stats.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let job_id = match outcome {
        StartOutcome::Skipped { reason, .. } => {
            if reason == SkipReason::Unknown {
                warn!("skipped {} (unknown reason)", file.rel_path.display());
            } else {
                debug!("skipped {} ({reason})", file.rel_path.display());
            }
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        StartOutcome::Started { job_id } => job_id,
    };

    let dst = shared.converter.dst_path(&file);
    let dst_str = dst.to_string_lossy().into_owned();

    if shared.config.dry_run {
        info!(
            "[dry-run] {} -> {}",
            file.rel_path.display(),
            dst.display()
        );
        if let Err(e) = shared.ledger.finalize_ok(job_id, &dst_str).await {
            warn!("finalize failed for {}: {e}", file.rel_path.display());
        }
        stats.processed.fetch_add(1, Ordering::Relaxed);
        return;
    }

    // Cancellation while waiting or converting leaves the row in_progress;
    // the next run's recovery sweep reclassifies it.
    let _reservation = match shared.limiter.reserve(file.size, cancel).await {
        Ok(reservation) => reservation,
        Err(_) => return,
    };

    match shared.converter.convert(&file.path, &dst, cancel).await {
        Ok(outcome) => match shared.ledger.finalize_ok(job_id, &dst_str).await {
            Ok(()) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
                stats.input_bytes.fetch_add(file.size, Ordering::Relaxed);
                if let Ok(metadata) = tokio::fs::metadata(&dst).await {
                    stats.output_bytes.fetch_add(metadata.len(), Ordering::Relaxed);
                }
                info!(
                    "{} -> {} ({:.2}s)",
                    file.rel_path.display(),
                    dst.display(),
                    outcome.duration.as_secs_f64()
                );
            }
            Err(e) if e.is_unique_violation() => {
                debug!(
                    "{} lost the dedup finalize race",
                    file.rel_path.display()
                );
                if let Err(e) = shared
                    .ledger
                    .finalize_failed(job_id, CONTENT_DUPLICATE_ERROR)
                    .await
                {
                    warn!("finalize failed for {}: {e}", file.rel_path.display());
                }
                stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("finalize failed for {}: {e}", file.rel_path.display());
                stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        },
        Err(Error::Cancelled) => {
            debug!("conversion cancelled for {}", file.rel_path.display());
        }
        Err(e) => {
            warn!("{}: {e}", file.rel_path.display());
            if let Err(e) = shared.ledger.finalize_failed(job_id, &e.to_string()).await {
                warn!("finalize failed for {}: {e}", file.rel_path.display());
            }
            stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
