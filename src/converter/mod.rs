//! Atomic converter driver.
//!
//! Invokes the external vips binary into a sibling temp path, then renames to
//! the final path. The temp name keeps the real extension because vips picks
//! the save format from it. No partial artifact is ever visible under the
//! final name.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{EngineConfig, Mode};
use crate::scanner::SourceFile;
use crate::{Error, Result};

/// Infix inserted before the extension while a conversion is in flight.
const TEMP_INFIX: &str = "converting";

/// Width passed to `vips thumbnail` when only a height bound is set.
const UNBOUNDED_DIMENSION: u32 = 100_000;

/// Stderr capture limit for failure messages.
const STDERR_SNIPPET_LEN: usize = 500;

/// Number of leading hex characters of the content hash used for flat dedup
/// file names.
const DEDUP_NAME_LEN: usize = 16;

/// Result of a successful conversion.
#[derive(Debug, Clone, Copy)]
pub struct ConvertOutcome {
    /// Wall-clock duration of the invocation.
    pub duration: Duration,
}

/// Drives the external converter binary.
pub struct Converter {
    config: Arc<EngineConfig>,
}

impl Converter {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    /// Destination path for a source file.
    pub fn dst_path(&self, file: &SourceFile) -> PathBuf {
        let ext = self.config.output.format.as_str();

        if self.config.keep_tree {
            return self.config.output_dir.join(file.rel_path.with_extension(ext));
        }

        if self.config.mode == Mode::Dedup
            && let Some(hash) = &file.content_sha256
        {
            let short = &hash[..hash.len().min(DEDUP_NAME_LEN)];
            return self.config.output_dir.join(format!("{short}.{ext}"));
        }

        let base = file
            .rel_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| file.rel_path.clone());
        self.config.output_dir.join(base.with_extension(ext))
    }

    /// Sibling temp path: `<stem>.converting.<ext>`.
    fn temp_path(dst: &Path) -> PathBuf {
        let stem = dst
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let name = match dst.extension() {
            Some(ext) => format!("{stem}.{TEMP_INFIX}.{}", ext.to_string_lossy()),
            None => format!("{stem}.{TEMP_INFIX}"),
        };
        dst.with_file_name(name)
    }

    /// The vips save-option suffix appended to the output argument,
    /// e.g. `[Q=80,strip]`.
    fn output_suffix(&self) -> String {
        let output = &self.config.output;
        let mut params = Vec::new();
        if output.format.supports_quality() {
            params.push(format!("Q={}", output.quality));
        }
        if output.strip_metadata {
            params.push("strip".to_string());
        }
        if params.is_empty() {
            String::new()
        } else {
            format!("[{}]", params.join(","))
        }
    }

    /// Assemble the vips argument vector: `thumbnail` when a dimension bound
    /// is set, plain `copy` otherwise.
    fn build_args(&self, src: &Path, out_arg: &str) -> Vec<String> {
        let output = &self.config.output;
        let mut args = Vec::new();

        if output.max_width > 0 || output.max_height > 0 {
            args.push("thumbnail".to_string());
            args.push(src.to_string_lossy().into_owned());
            args.push(out_arg.to_string());
            let width = if output.max_width > 0 {
                output.max_width
            } else {
                UNBOUNDED_DIMENSION
            };
            args.push(width.to_string());
            if output.max_height > 0 {
                args.push(format!("--height={}", output.max_height));
            }
        } else {
            args.push("copy".to_string());
            args.push(src.to_string_lossy().into_owned());
            args.push(out_arg.to_string());
        }

        args
    }

    /// Convert `src` into `dst` atomically.
    ///
    /// On success the temp file has been renamed over `dst`; on any failure
    /// the temp file is removed. Cancellation kills the child and surfaces
    /// [`Error::Cancelled`] so the caller can leave the ledger row for the
    /// next run's recovery sweep.
    pub async fn convert(
        &self,
        src: &Path,
        dst: &Path,
        cancel: &CancellationToken,
    ) -> Result<ConvertOutcome> {
        let start = Instant::now();

        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io_path("creating output directory", parent, e))?;
        }

        let tmp = Self::temp_path(dst);
        let out_arg = format!("{}{}", tmp.display(), self.output_suffix());
        let args = self.build_args(src, &out_arg);
        debug!(binary = %self.config.vips_path.display(), ?args, "invoking converter");

        let mut cmd = Command::new(&self.config.vips_path);
        cmd.args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.config.use_gpu {
            cmd.env("VIPS_OPENCL", "1");
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::conversion(format!("spawning converter: {e}")))?;

        let stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                remove_temp(&tmp).await;
                return Err(Error::Cancelled);
            }
            res = tokio::time::timeout(self.config.convert_timeout, child.wait()) => match res {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    stderr_task.abort();
                    remove_temp(&tmp).await;
                    return Err(Error::io_path("waiting for converter", src, e));
                }
                Err(_) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    stderr_task.abort();
                    remove_temp(&tmp).await;
                    return Err(Error::conversion("timeout"));
                }
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            remove_temp(&tmp).await;
            let code = status.code().unwrap_or(-1);
            let snippet = snippet(&stderr);
            let message = if snippet.is_empty() {
                format!("converter exited with code {code}")
            } else {
                format!("converter exited with code {code}: {snippet}")
            };
            return Err(Error::conversion(message));
        }

        if let Err(e) = tokio::fs::rename(&tmp, dst).await {
            remove_temp(&tmp).await;
            return Err(Error::conversion(format!(
                "renaming {} -> {}: {e}",
                tmp.display(),
                dst.display()
            )));
        }

        Ok(ConvertOutcome {
            duration: start.elapsed(),
        })
    }

    /// Probe the converter binary before starting a run.
    pub async fn health_check(&self) -> Result<()> {
        let output = Command::new(&self.config.vips_path)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::config(format!(
                    "converter binary is not usable ({}): {e}",
                    self.config.vips_path.display()
                ))
            })?;
        if !output.status.success() {
            return Err(Error::config(format!(
                "converter binary is not usable ({})",
                self.config.vips_path.display()
            )));
        }
        Ok(())
    }
}

async fn remove_temp(tmp: &Path) {
    let _ = tokio::fs::remove_file(tmp).await;
}

fn snippet(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let mut out: String = trimmed.chars().take(STDERR_SNIPPET_LEN).collect();
    if out.len() < trimmed.len() {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::shape::OutputOptions;
    use crate::config::{DEFAULT_CONVERT_TIMEOUT, OutputFormat};
    use tempfile::TempDir;

    fn config(dir: &Path, mode: Mode, keep_tree: bool) -> Arc<EngineConfig> {
        Arc::new(EngineConfig {
            input_dir: dir.join("in"),
            output_dir: dir.join("out"),
            input_extensions: vec!["jpg".into()],
            output: OutputOptions {
                format: OutputFormat::Webp,
                quality: 80,
                strip_metadata: false,
                max_width: 0,
                max_height: 0,
            },
            workers: 1,
            mode,
            keep_tree,
            dry_run: false,
            db_path: dir.join("state.sqlite"),
            vips_path: PathBuf::from("vips"),
            convert_timeout: DEFAULT_CONVERT_TIMEOUT,
            max_memory_mb: 0,
            use_gpu: false,
        })
    }

    fn source(dir: &Path, rel: &str, hash: Option<&str>) -> SourceFile {
        SourceFile {
            path: dir.join("in").join(rel),
            rel_path: PathBuf::from(rel),
            size: 3,
            mtime: 1_700_000_000,
            content_sha256: hash.map(|h| h.to_string()),
        }
    }

    #[test]
    fn dst_path_keeps_tree() {
        let dir = TempDir::new().unwrap();
        let conv = Converter::new(config(dir.path(), Mode::Skip, true));
        let file = source(dir.path(), "2024/trip/a.jpg", None);

        assert_eq!(
            conv.dst_path(&file),
            dir.path().join("out").join("2024/trip/a.webp")
        );
    }

    #[test]
    fn dst_path_flattens_to_basename() {
        let dir = TempDir::new().unwrap();
        let conv = Converter::new(config(dir.path(), Mode::Skip, false));
        let file = source(dir.path(), "2024/trip/a.jpg", None);

        assert_eq!(conv.dst_path(&file), dir.path().join("out").join("a.webp"));
    }

    #[test]
    fn dst_path_flat_dedup_uses_short_hash() {
        let dir = TempDir::new().unwrap();
        let conv = Converter::new(config(dir.path(), Mode::Dedup, false));
        let hash = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let file = source(dir.path(), "2024/trip/a.jpg", Some(hash));

        assert_eq!(
            conv.dst_path(&file),
            dir.path().join("out").join("0123456789abcdef.webp")
        );
    }

    #[test]
    fn temp_path_preserves_extension() {
        assert_eq!(
            Converter::temp_path(Path::new("/out/a.webp")),
            PathBuf::from("/out/a.converting.webp")
        );
        assert_eq!(
            Converter::temp_path(Path::new("/out/noext")),
            PathBuf::from("/out/noext.converting")
        );
    }

    #[test]
    fn output_suffix_reflects_format_and_strip() {
        let dir = TempDir::new().unwrap();

        let conv = Converter::new(config(dir.path(), Mode::Skip, true));
        assert_eq!(conv.output_suffix(), "[Q=80]");

        let mut cfg = (*config(dir.path(), Mode::Skip, true)).clone();
        cfg.output.strip_metadata = true;
        let conv = Converter::new(Arc::new(cfg));
        assert_eq!(conv.output_suffix(), "[Q=80,strip]");

        let mut cfg = (*config(dir.path(), Mode::Skip, true)).clone();
        cfg.output.format = OutputFormat::Png;
        let conv = Converter::new(Arc::new(cfg));
        assert_eq!(conv.output_suffix(), "");
    }

    #[test]
    fn build_args_uses_thumbnail_when_resizing() {
        let dir = TempDir::new().unwrap();

        let conv = Converter::new(config(dir.path(), Mode::Skip, true));
        let args = conv.build_args(Path::new("/in/a.jpg"), "/out/a.converting.webp[Q=80]");
        assert_eq!(
            args,
            vec!["copy", "/in/a.jpg", "/out/a.converting.webp[Q=80]"]
        );

        let mut cfg = (*config(dir.path(), Mode::Skip, true)).clone();
        cfg.output.max_width = 1920;
        cfg.output.max_height = 1080;
        let conv = Converter::new(Arc::new(cfg));
        let args = conv.build_args(Path::new("/in/a.jpg"), "/out/a.converting.webp[Q=80]");
        assert_eq!(
            args,
            vec![
                "thumbnail",
                "/in/a.jpg",
                "/out/a.converting.webp[Q=80]",
                "1920",
                "--height=1080"
            ]
        );

        let mut cfg = (*config(dir.path(), Mode::Skip, true)).clone();
        cfg.output.max_height = 720;
        let conv = Converter::new(Arc::new(cfg));
        let args = conv.build_args(Path::new("/in/a.jpg"), "/out/a.converting.webp[Q=80]");
        assert_eq!(args[3], UNBOUNDED_DIMENSION.to_string());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write a fake vips that understands `copy src out[opts]`.
        fn fake_vips(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-vips");
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        const COPY_SCRIPT: &str = "#!/bin/sh\n\
            case \"$1\" in --version) echo vips-fake; exit 0;; esac\n\
            src=\"$2\"\n\
            out=\"${3%%\\[*}\"\n\
            cp \"$src\" \"$out\"\n";

        fn process_config(dir: &Path, script: &str) -> Arc<EngineConfig> {
            let mut cfg = (*config(dir, Mode::Skip, true)).clone();
            cfg.vips_path = fake_vips(dir, script);
            Arc::new(cfg)
        }

        #[tokio::test]
        async fn convert_renames_temp_over_destination() {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("in")).unwrap();
            let src = dir.path().join("in").join("a.jpg");
            std::fs::write(&src, b"pixels").unwrap();

            let conv = Converter::new(process_config(dir.path(), COPY_SCRIPT));
            let dst = dir.path().join("out").join("a.webp");

            let outcome = conv
                .convert(&src, &dst, &CancellationToken::new())
                .await
                .unwrap();
            assert!(outcome.duration.as_nanos() > 0);
            assert_eq!(std::fs::read(&dst).unwrap(), b"pixels");
            assert!(!dir.path().join("out").join("a.converting.webp").exists());
        }

        #[tokio::test]
        async fn converter_failure_cleans_temp_and_carries_stderr() {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("in")).unwrap();
            let src = dir.path().join("in").join("a.jpg");
            std::fs::write(&src, b"pixels").unwrap();

            let script = "#!/bin/sh\necho 'unsupported image format' >&2\nexit 3\n";
            let conv = Converter::new(process_config(dir.path(), script));
            let dst = dir.path().join("out").join("a.webp");

            let err = conv
                .convert(&src, &dst, &CancellationToken::new())
                .await
                .expect_err("converter failure must surface");
            match err {
                Error::Conversion(message) => {
                    assert!(message.contains("code 3"), "{message}");
                    assert!(message.contains("unsupported image format"), "{message}");
                }
                other => panic!("unexpected error: {other:?}"),
            }
            assert!(!dst.exists());
            assert!(!dir.path().join("out").join("a.converting.webp").exists());
        }

        #[tokio::test]
        async fn deadline_expiry_reports_timeout() {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("in")).unwrap();
            let src = dir.path().join("in").join("a.jpg");
            std::fs::write(&src, b"pixels").unwrap();

            let script = "#!/bin/sh\nsleep 5\n";
            let mut cfg = (*process_config(dir.path(), script)).clone();
            cfg.convert_timeout = Duration::from_millis(200);
            let conv = Converter::new(Arc::new(cfg));
            let dst = dir.path().join("out").join("a.webp");

            let err = conv
                .convert(&src, &dst, &CancellationToken::new())
                .await
                .expect_err("deadline must expire");
            match err {
                Error::Conversion(message) => assert_eq!(message, "timeout"),
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[tokio::test]
        async fn cancellation_kills_the_child() {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("in")).unwrap();
            let src = dir.path().join("in").join("a.jpg");
            std::fs::write(&src, b"pixels").unwrap();

            let script = "#!/bin/sh\nsleep 5\n";
            let conv = Converter::new(process_config(dir.path(), script));
            let dst = dir.path().join("out").join("a.webp");

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel_clone.cancel();
            });

            let started = Instant::now();
            let err = conv
                .convert(&src, &dst, &cancel)
                .await
                .expect_err("cancellation must interrupt");
            assert!(matches!(err, Error::Cancelled));
            assert!(started.elapsed() < Duration::from_secs(4));
        }

        #[tokio::test]
        async fn health_check_probes_the_binary() {
            let dir = TempDir::new().unwrap();

            let conv = Converter::new(process_config(dir.path(), COPY_SCRIPT));
            conv.health_check().await.unwrap();

            let mut cfg = (*config(dir.path(), Mode::Skip, true)).clone();
            cfg.vips_path = dir.path().join("no-such-binary");
            let conv = Converter::new(Arc::new(cfg));
            assert!(matches!(
                conv.health_check().await,
                Err(Error::Configuration(_))
            ));
        }
    }
}
