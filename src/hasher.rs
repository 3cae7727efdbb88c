//! Streaming content hasher.
//!
//! Used only in dedup mode: the digest of a source's bytes participates in
//! admission and in flat-mode path derivation.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::{Error, Result};

/// Read chunk size.
const CHUNK_SIZE: usize = 64 * 1024;

/// Compute the sha256 of a file's contents, returned as lowercase hex.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await.map_err(|e| Error::Hash {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| Error::Hash {
            path: path.to_path_buf(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
