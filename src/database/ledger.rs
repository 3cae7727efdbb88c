//! The job ledger.
//!
//! Durable record of every (source identity, output shape) pair. Two unique
//! indices carry the engine's idempotence guarantees: `ux_jobs_src` makes the
//! admission insert a race that exactly one worker wins per identity tuple,
//! and the partial `ux_jobs_dedup` index keeps one successful artifact per
//! (content, shape) in dedup mode.

use async_trait::async_trait;
use sqlx::Row;
use std::path::Path;

use super::models::{JobRow, JobStatus, LedgerStats, SkipReason, SourceMeta, StartOutcome};
use super::{DbPool, time};
use crate::config::OutputShape;
use crate::Result;

/// Error text recorded when the recovery sweep reclassifies a row.
pub const INTERRUPTED_ERROR: &str = "interrupted on previous run";

/// Error text recorded when a row loses the content-dedup race.
pub const CONTENT_DUPLICATE_ERROR: &str = "content duplicate";

/// Ledger operations used by the worker pool and the recovery step.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Admission protocol: decide the fate of one source file atomically with
    /// respect to concurrent workers and prior runs.
    async fn try_start(
        &self,
        src: &SourceMeta,
        shape: &OutputShape,
        dedup_mode: bool,
    ) -> Result<StartOutcome>;

    /// Mark a job successful. Surfaces a typed unique-violation error when the
    /// row loses the content-dedup index race; callers downgrade the job to
    /// failed in that case.
    async fn finalize_ok(&self, job_id: i64, dst_path: &str) -> Result<()>;

    /// Mark a job failed with a short reason.
    async fn finalize_failed(&self, job_id: i64, error: &str) -> Result<()>;

    /// Recovery sweep: reclassify rows left `in_progress` by a prior process.
    /// Returns the number of rows transitioned.
    async fn sweep_in_progress(&self) -> Result<u64>;

    /// Totals by status.
    async fn stats(&self) -> Result<LedgerStats>;
}

/// SQLite-backed ledger.
pub struct SqliteLedger {
    pool: DbPool,
}

impl SqliteLedger {
    /// Open (or create) the ledger at `path` and apply migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = super::init_pool(path).await?;
        super::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Look up the row matching a source identity tuple.
    async fn find_by_identity(
        &self,
        src: &SourceMeta,
        shape: &OutputShape,
    ) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE src_path = ? AND src_size = ? AND src_mtime = ?
              AND out_format = ? AND out_params_hash = ?
            LIMIT 1
            "#,
        )
        .bind(&src.path)
        .bind(src.size)
        .bind(src.mtime)
        .bind(shape.format.as_str())
        .bind(&shape.params_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Look up the destination of a successful row with the same content and
    /// shape, if any.
    async fn find_duplicate(&self, content_sha256: &str, shape: &OutputShape) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT dst_path FROM jobs
            WHERE content_sha256 = ? AND out_format = ? AND out_params_hash = ?
              AND status = 'ok'
            LIMIT 1
            "#,
        )
        .bind(content_sha256)
        .bind(shape.format.as_str())
        .bind(&shape.params_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>("dst_path")))
    }

    async fn insert_in_progress(
        &self,
        src: &SourceMeta,
        shape: &OutputShape,
        content_sha256: Option<&str>,
    ) -> std::result::Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (src_path, src_size, src_mtime, out_format, out_params,
                              out_params_hash, content_sha256, status, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&src.path)
        .bind(src.size)
        .bind(src.mtime)
        .bind(shape.format.as_str())
        .bind(&shape.params)
        .bind(&shape.params_hash)
        .bind(content_sha256)
        .bind(JobStatus::InProgress.as_str())
        .bind(time::now_secs())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn delete_row(&self, job_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobLedger for SqliteLedger {
    async fn try_start(
        &self,
        src: &SourceMeta,
        shape: &OutputShape,
        dedup_mode: bool,
    ) -> Result<StartOutcome> {
        let content = if dedup_mode {
            src.content_sha256.as_deref()
        } else {
            None
        };

        // A failed row for the same identity is deleted and the insert retried
        // exactly once.
        for _attempt in 0..2 {
            match self.insert_in_progress(src, shape, content).await {
                Ok(job_id) => {
                    // The identity insert is won. In dedup mode another source
                    // with the same bytes may already have produced this
                    // shape; retire this row instead of converting again.
                    if let Some(hash) = content
                        && let Some(dst) = self.find_duplicate(hash, shape).await?
                    {
                        self.finalize_failed(job_id, CONTENT_DUPLICATE_ERROR).await?;
                        return Ok(StartOutcome::Skipped {
                            reason: SkipReason::ContentDuplicate,
                            existing_dst: Some(dst),
                        });
                    }
                    return Ok(StartOutcome::Started { job_id });
                }
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    match self.find_by_identity(src, shape).await? {
                        Some(row) => match JobStatus::parse(&row.status) {
                            Some(JobStatus::Ok) => {
                                return Ok(StartOutcome::Skipped {
                                    reason: SkipReason::AlreadyDone,
                                    existing_dst: row.dst_path,
                                });
                            }
                            Some(JobStatus::InProgress) => {
                                return Ok(StartOutcome::Skipped {
                                    reason: SkipReason::InFlight,
                                    existing_dst: None,
                                });
                            }
                            Some(JobStatus::Failed) => {
                                // Retry-on-next-run: replace the failed row.
                                self.delete_row(row.id).await?;
                                continue;
                            }
                            None => {
                                return Ok(StartOutcome::Skipped {
                                    reason: SkipReason::Unknown,
                                    existing_dst: None,
                                });
                            }
                        },
                        None => {
                            if let Some(hash) = content
                                && let Some(dst) = self.find_duplicate(hash, shape).await?
                            {
                                return Ok(StartOutcome::Skipped {
                                    reason: SkipReason::ContentDuplicate,
                                    existing_dst: Some(dst),
                                });
                            }
                            return Ok(StartOutcome::Skipped {
                                reason: SkipReason::Unknown,
                                existing_dst: None,
                            });
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        // The failed row reappeared after the single delete-and-retry.
        Ok(StartOutcome::Skipped {
            reason: SkipReason::Unknown,
            existing_dst: None,
        })
    }

    async fn finalize_ok(&self, job_id: i64, dst_path: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?, dst_path = ?, finished_at = ? WHERE id = ?")
            .bind(JobStatus::Ok.as_str())
            .bind(dst_path)
            .bind(time::now_secs())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finalize_failed(&self, job_id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?, error = ?, finished_at = ? WHERE id = ?")
            .bind(JobStatus::Failed.as_str())
            .bind(error)
            .bind(time::now_secs())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep_in_progress(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE jobs SET status = ?, error = ? WHERE status = ?")
            .bind(JobStatus::Failed.as_str())
            .bind(INTERRUPTED_ERROR)
            .bind(JobStatus::InProgress.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = LedgerStats::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            stats.total += n;
            match JobStatus::parse(&status) {
                Some(JobStatus::Ok) => stats.ok += n,
                Some(JobStatus::Failed) => stats.failed += n,
                Some(JobStatus::InProgress) => stats.in_progress += n,
                None => {}
            }
        }
        Ok(stats)
    }
}
