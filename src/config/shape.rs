//! Output-shape fingerprint.
//!
//! The options that influence produced bytes are serialized into a canonical
//! JSON form with a fixed key order and hashed; the hash is the ledger key for
//! "what output shape was requested". Options that do not change output bytes
//! (worker count, dry-run, db path, ...) must never appear here.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::OutputFormat;

/// Byte-affecting output options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputOptions {
    pub format: OutputFormat,
    /// Quality for lossy formats (1-100).
    pub quality: u8,
    /// Strip metadata from output images.
    pub strip_metadata: bool,
    /// Maximum output width in pixels (0 = unconstrained).
    pub max_width: u32,
    /// Maximum output height in pixels (0 = unconstrained).
    pub max_height: u32,
}

/// Canonical serialized form of [`OutputOptions`].
///
/// Field order is the sorted key order of the emitted JSON object. Every
/// byte-affecting option added to [`OutputOptions`] must be added here as
/// well; `canonical_form_is_stable` pins the exact encoding.
#[derive(Serialize)]
struct CanonicalParams<'a> {
    format: &'a str,
    max_height: u32,
    max_width: u32,
    quality: u8,
    strip_metadata: bool,
}

/// An output shape: the canonical option text plus its fingerprint.
///
/// Constant for a single run.
#[derive(Debug, Clone)]
pub struct OutputShape {
    pub format: OutputFormat,
    /// Canonical textual encoding of the option set.
    pub params: String,
    /// Lowercase hex sha256 of `params`.
    pub params_hash: String,
}

impl OutputShape {
    pub fn from_options(options: &OutputOptions) -> Self {
        let params = canonical_params(options);
        let params_hash = hex::encode(Sha256::digest(params.as_bytes()));
        Self {
            format: options.format,
            params,
            params_hash,
        }
    }
}

fn canonical_params(options: &OutputOptions) -> String {
    let canonical = CanonicalParams {
        format: options.format.as_str(),
        max_height: options.max_height,
        max_width: options.max_width,
        quality: options.quality,
        strip_metadata: options.strip_metadata,
    };
    // Struct serialization emits fields in declaration order; infallible for
    // this shape.
    serde_json::to_string(&canonical).unwrap_or_default()
}
