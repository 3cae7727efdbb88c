//! Ledger models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Job status values as stored in the `jobs.status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Ok,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "ok" => Some(Self::Ok),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger row: an attempt (or completed outcome) to produce one artifact
/// for one (source identity, output shape) pair.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub src_path: String,
    pub src_size: i64,
    pub src_mtime: i64,
    pub out_format: String,
    pub out_params: String,
    pub out_params_hash: String,
    pub content_sha256: Option<String>,
    pub dst_path: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// Source file identity presented to the admission protocol.
#[derive(Debug, Clone)]
pub struct SourceMeta {
    /// Absolute path of the source file.
    pub path: String,
    /// Source byte length.
    pub size: i64,
    /// Source modification time, whole seconds.
    pub mtime: i64,
    /// Content digest; present only in dedup mode.
    pub content_sha256: Option<String>,
}

/// Why a file was not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A row for this identity already completed successfully.
    AlreadyDone,
    /// A row for this identity is currently in progress.
    InFlight,
    /// A different file with the same content already produced this shape.
    ContentDuplicate,
    /// Defensive fallback; observable in logs, never fatal.
    Unknown,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::AlreadyDone => "already done",
            Self::InFlight => "in flight",
            Self::ContentDuplicate => "content duplicate",
            Self::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// The caller won the insert race and owns the job.
    Started { job_id: i64 },
    /// The file is skipped; no conversion must be attempted.
    Skipped {
        reason: SkipReason,
        existing_dst: Option<String>,
    },
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }
}

/// Ledger totals by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total: i64,
    pub ok: i64,
    pub failed: i64,
    pub in_progress: i64,
}
