//! Source feeder.
//!
//! Walks the input tree in directory order, filters by extension, and emits
//! one descriptor per accepted file into a bounded channel. The channel bound
//! is the intended backpressure against the worker pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::EngineConfig;
use crate::{Error, Result};

/// Descriptor channel capacity.
pub const CHANNEL_CAPACITY: usize = 100;

/// One accepted source file.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Absolute path.
    pub path: PathBuf,
    /// Path relative to the input root.
    pub rel_path: PathBuf,
    /// Byte length.
    pub size: u64,
    /// Modification time, whole seconds.
    pub mtime: i64,
    /// Content digest, filled by workers in dedup mode.
    pub content_sha256: Option<String>,
}

/// Walks the input tree and feeds the worker channel.
pub struct Scanner {
    config: Arc<EngineConfig>,
}

impl Scanner {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    /// Start the walk on a blocking thread.
    ///
    /// Returns the descriptor channel and an error channel. A fatal walk
    /// error (unreadable root) is delivered on the error channel after the
    /// descriptor channel closes; per-entry errors are logged and skipped.
    pub fn start(
        &self,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<SourceFile>, mpsc::Receiver<Error>) {
        let (file_tx, file_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(1);
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            let fatal = walk(&config, &cancel, &file_tx);
            drop(file_tx);
            if let Err(e) = fatal {
                let _ = err_tx.blocking_send(e);
            }
        });

        (file_rx, err_rx)
    }
}

fn walk(
    config: &EngineConfig,
    cancel: &CancellationToken,
    file_tx: &mpsc::Sender<SourceFile>,
) -> Result<()> {
    let root = config
        .input_dir
        .canonicalize()
        .map_err(|e| Error::walk(format!("{}: {e}", config.input_dir.display())))?;

    let walker = WalkDir::new(&root).into_iter().filter_entry(|entry| {
        // Never descend into hidden directories (the input root is exempt).
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        !entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
    });

    let mut emitted = 0u64;
    for entry in walker {
        if cancel.is_cancelled() {
            debug!("scan cancelled");
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // Unreadable root aborts the run; unreadable subtrees do not.
                if e.depth() == 0 {
                    return Err(Error::walk(e.to_string()));
                }
                warn!("skipping unreadable entry: {e}");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with("._") {
            continue;
        }
        if !config.accepts_path(entry.path()) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("skipping {}: {e}", entry.path().display());
                continue;
            }
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let rel_path = entry
            .path()
            .strip_prefix(&root)
            .unwrap_or(entry.path())
            .to_path_buf();

        let file = SourceFile {
            path: entry.path().to_path_buf(),
            rel_path,
            size: metadata.len(),
            mtime,
            content_sha256: None,
        };

        // Blocks when the channel is full; errors when the workers are gone.
        if file_tx.blocking_send(file).is_err() {
            debug!("descriptor channel closed, stopping scan");
            break;
        }
        emitted += 1;
    }

    debug!(emitted, "scan finished");
    Ok(())
}
