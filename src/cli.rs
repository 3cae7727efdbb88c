//! Command-line interface.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{EngineConfig, Mode, OutputFormat, OutputOptions};
use crate::Result;

/// Default accepted source extensions.
const DEFAULT_INPUT_EXTENSIONS: &str = "jpg,jpeg,png,heic,heif,webp,tiff,arw,raw";

#[derive(Debug, Parser)]
#[command(
    name = "photoconv",
    version,
    about = "Resumable, parallel batch image conversion"
)]
pub struct Cli {
    /// Verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Convert a directory tree of images.
    Convert(ConvertArgs),
    /// Show ledger statistics.
    Stats {
        /// Path to the ledger database.
        #[arg(long)]
        db: PathBuf,
    },
    /// Show version information.
    Version,
}

#[derive(Debug, Args)]
pub struct ConvertArgs {
    /// Input directory.
    #[arg(long = "in")]
    pub input_dir: PathBuf,

    /// Output directory.
    #[arg(long = "out")]
    pub output_dir: PathBuf,

    /// Accepted input extensions, comma separated.
    #[arg(long = "in-ext", value_delimiter = ',', default_value = DEFAULT_INPUT_EXTENSIONS)]
    pub input_extensions: Vec<String>,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Jpg)]
    pub format: OutputFormat,

    /// Quality for lossy formats (1-100).
    #[arg(long, default_value_t = 80)]
    pub quality: u8,

    /// Strip metadata from outputs.
    #[arg(long)]
    pub strip: bool,

    /// Maximum output width in pixels (0 = unconstrained).
    #[arg(long, default_value_t = 0)]
    pub max_width: u32,

    /// Maximum output height in pixels (0 = unconstrained).
    #[arg(long, default_value_t = 0)]
    pub max_height: u32,

    /// Worker count. Defaults to the number of CPUs.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Admission mode.
    #[arg(long, value_enum, default_value_t = Mode::Skip)]
    pub mode: Mode,

    /// Flatten the output tree instead of mirroring the input layout.
    #[arg(long)]
    pub flat: bool,

    /// Record jobs without invoking the converter.
    #[arg(long)]
    pub dry_run: bool,

    /// Ledger database path. Defaults to <out>/.photoconv/state.sqlite.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Path to the vips binary. Overrides PHOTOCONV_VIPS and PATH lookup.
    #[arg(long)]
    pub vips_path: Option<PathBuf>,

    /// Per-file conversion deadline in seconds.
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,

    /// Memory budget in MiB for in-flight conversions (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub max_memory_mb: u64,

    /// Enable OpenCL acceleration in the converter.
    #[arg(long)]
    pub gpu: bool,
}

impl ConvertArgs {
    /// Build and validate the engine configuration.
    pub fn into_config(self) -> Result<EngineConfig> {
        let mut config = EngineConfig {
            input_dir: self.input_dir,
            output_dir: self.output_dir,
            input_extensions: self.input_extensions,
            output: OutputOptions {
                format: self.format,
                quality: self.quality,
                strip_metadata: self.strip,
                max_width: self.max_width,
                max_height: self.max_height,
            },
            workers: self.workers.unwrap_or_else(EngineConfig::default_workers),
            mode: self.mode,
            keep_tree: !self.flat,
            dry_run: self.dry_run,
            db_path: self.db.unwrap_or_default(),
            vips_path: EngineConfig::resolve_converter_binary(self.vips_path),
            convert_timeout: Duration::from_secs(self.timeout),
            max_memory_mb: self.max_memory_mb,
            use_gpu: self.gpu,
        };
        config.validate()?;
        Ok(config)
    }
}
