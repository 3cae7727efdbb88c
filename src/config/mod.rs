//! Engine configuration.
//!
//! Everything that influences a run is collected into an explicit
//! [`EngineConfig`] record validated up front. The options that influence
//! produced bytes live in [`shape::OutputOptions`] and feed the output-shape
//! fingerprint.

pub mod shape;

pub use shape::{OutputOptions, OutputShape};

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable overriding the external converter binary path.
pub const CONVERTER_ENV_VAR: &str = "PHOTOCONV_VIPS";

/// Default per-file conversion deadline.
pub const DEFAULT_CONVERT_TIMEOUT: Duration = Duration::from_secs(300);

/// Ledger directory name under the output root.
const STATE_DIR_NAME: &str = ".photoconv";

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Skip files already converted, identified by path + size + mtime.
    Skip,
    /// Additionally dedup by content hash; identical bytes convert once.
    Dedup,
}

/// Output container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Webp,
    Jpg,
    Png,
    Avif,
    Tiff,
    Heic,
    Jxl,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Jpg => "jpg",
            Self::Png => "png",
            Self::Avif => "avif",
            Self::Tiff => "tiff",
            Self::Heic => "heic",
            Self::Jxl => "jxl",
        }
    }

    /// Whether the format takes a lossy quality setting.
    pub fn supports_quality(&self) -> bool {
        !matches!(self, Self::Png | Self::Tiff)
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complete configuration for one conversion run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root walked for source images.
    pub input_dir: PathBuf,
    /// Root of the artifact tree.
    pub output_dir: PathBuf,
    /// Accepted source extensions, lowercased and without dots.
    pub input_extensions: Vec<String>,
    /// Byte-affecting output options (these feed the fingerprint).
    pub output: OutputOptions,
    /// Worker pool size.
    pub workers: usize,
    /// Admission mode.
    pub mode: Mode,
    /// Mirror the source directory structure under the output root.
    pub keep_tree: bool,
    /// Record jobs without invoking the converter.
    pub dry_run: bool,
    /// Ledger location. Defaults to `<output_dir>/.photoconv/state.sqlite`.
    pub db_path: PathBuf,
    /// External converter binary.
    pub vips_path: PathBuf,
    /// Per-file conversion deadline.
    pub convert_timeout: Duration,
    /// Memory budget for in-flight conversions in MiB (0 = unlimited).
    pub max_memory_mb: u64,
    /// Enable OpenCL acceleration in the converter.
    pub use_gpu: bool,
}

impl EngineConfig {
    /// Default worker count: one per CPU.
    pub fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Resolve the converter binary: explicit path, then the
    /// `PHOTOCONV_VIPS` environment variable, then `vips` on PATH.
    pub fn resolve_converter_binary(custom: Option<PathBuf>) -> PathBuf {
        if let Some(path) = custom {
            return path;
        }
        if let Ok(env_path) = std::env::var(CONVERTER_ENV_VAR)
            && !env_path.is_empty()
        {
            return PathBuf::from(env_path);
        }
        PathBuf::from("vips")
    }

    /// Validate the configuration and fill derived defaults.
    pub fn validate(&mut self) -> Result<()> {
        if self.input_dir.as_os_str().is_empty() {
            return Err(Error::config("input directory is not set"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(Error::config("output directory is not set"));
        }
        if !self.input_dir.is_dir() {
            return Err(Error::config(format!(
                "input directory does not exist: {}",
                self.input_dir.display()
            )));
        }
        if self.input_extensions.is_empty() {
            return Err(Error::config("input extension list is empty"));
        }
        if self.output.quality < 1 || self.output.quality > 100 {
            return Err(Error::config(format!(
                "quality must be within 1..=100, got {}",
                self.output.quality
            )));
        }
        if self.workers < 1 {
            return Err(Error::config("worker count must be >= 1"));
        }

        self.input_extensions = self
            .input_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        if self.input_extensions.is_empty() {
            return Err(Error::config("input extension list is empty"));
        }

        if self.db_path.as_os_str().is_empty() {
            self.db_path = self.output_dir.join(STATE_DIR_NAME).join("state.sqlite");
        }

        Ok(())
    }

    /// Whether a file extension (with or without a leading dot) is accepted.
    pub fn has_input_extension(&self, ext: &str) -> bool {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        self.input_extensions.iter().any(|e| *e == ext)
    }

    /// Whether a path's final extension is accepted.
    pub fn accepts_path(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.has_input_extension(e))
    }
}
