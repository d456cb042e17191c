//! External compression through Ghostscript's `pdfwrite` device.
//!
//! The document is re-rendered by `gs` with every embedded image downsampled
//! (bicubic) to the profile's resolution and re-encoded at its JPEG quality.
//! Grayscale and monochrome profiles switch the output device to a gray
//! colour model; monochrome also forces lossless Flate for images, since JPEG
//! artefacts on bilevel content cost more bytes than they save.
//!
//! ## Process lifetime
//!
//! The child is spawned with `kill_on_drop(true)`. Whether the run ends by
//! timeout, by cancellation, or because the whole job future was dropped by
//! the dispatcher's hard limit, dropping the `Child` kills `gs`.

use super::{BackendKind, CompressionBackend, CompressionProfile, ProfileColorMode};
use crate::error::PdfToolsError;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Keep this many trailing bytes of stderr in failure messages.
const STDERR_TAIL: usize = 2048;

/// Compression backend that shells out to Ghostscript.
#[derive(Debug, Clone)]
pub struct GhostscriptBackend {
    binary: PathBuf,
    timeout: Duration,
}

impl GhostscriptBackend {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the configured binary can be started at all.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn unavailable(&self, detail: impl Into<String>) -> PdfToolsError {
        PdfToolsError::CompressionBackendUnavailable {
            backend: BackendKind::Ghostscript.to_string(),
            detail: detail.into(),
        }
    }

    fn failed(&self, detail: impl Into<String>) -> PdfToolsError {
        PdfToolsError::CompressionFailed {
            backend: BackendKind::Ghostscript.to_string(),
            detail: detail.into(),
        }
    }
}

impl Default for GhostscriptBackend {
    fn default() -> Self {
        Self::new(super::DEFAULT_GHOSTSCRIPT_BINARY, super::DEFAULT_EXTERNAL_TIMEOUT)
    }
}

/// Command-line arguments for one `gs` run.
pub fn ghostscript_args(
    input: &Path,
    output: &Path,
    profile: &CompressionProfile,
) -> Vec<OsString> {
    let dpi = profile.target_dpi;
    let mut args: Vec<OsString> = [
        "-sDEVICE=pdfwrite",
        "-dCompatibilityLevel=1.4",
        "-dNOPAUSE",
        "-dQUIET",
        "-dBATCH",
        "-dSAFER",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();

    for class in ["Color", "Gray", "Mono"] {
        args.push(format!("-dDownsample{class}Images=true").into());
        args.push(format!("-d{class}ImageDownsampleType=/Bicubic").into());
        args.push(format!("-d{class}ImageResolution={dpi}").into());
    }
    args.push(format!("-dJPEGQ={}", profile.image_quality).into());

    if profile.color_mode.is_gray() {
        args.push("-sColorConversionStrategy=Gray".into());
        args.push("-dProcessColorModel=/DeviceGray".into());
    }
    if profile.color_mode == ProfileColorMode::Monochrome {
        args.push("-dAutoFilterGrayImages=false".into());
        args.push("-dGrayImageFilter=/FlateEncode".into());
    }

    args.push("-dDetectDuplicateImages=true".into());
    args.push("-dCompressFonts=true".into());

    let mut out = OsString::from("-sOutputFile=");
    out.push(output.as_os_str());
    args.push(out);
    args.push(input.as_os_str().to_owned());
    args
}

#[async_trait]
impl CompressionBackend for GhostscriptBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ghostscript
    }

    async fn compress(
        &self,
        input: &Path,
        output: &Path,
        profile: &CompressionProfile,
        cancel: &CancellationToken,
    ) -> Result<(), PdfToolsError> {
        let args = ghostscript_args(input, output, profile);
        debug!("Running {} with {} args", self.binary.display(), args.len());

        let mut child = match Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                return Err(self.unavailable(format!("{}: {e}", self.binary.display())));
            }
            Err(e) => return Err(self.failed(format!("failed to start: {e}"))),
        };

        // Drain stderr concurrently so a chatty gs never blocks on a full pipe.
        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let finish = tokio::select! {
            waited = tokio::time::timeout(self.timeout, child.wait()) => match waited {
                Ok(status) => Finish::Exited(status),
                Err(_) => Finish::TimedOut,
            },
            _ = cancel.cancelled() => Finish::Cancelled,
        };

        let status = match finish {
            Finish::Exited(Ok(status)) => status,
            Finish::Exited(Err(e)) => return Err(self.failed(format!("wait failed: {e}"))),
            Finish::TimedOut => {
                warn!("Ghostscript exceeded {}s, killing", self.timeout.as_secs());
                let _ = child.kill().await;
                return Err(PdfToolsError::CompressionTimedOut {
                    backend: BackendKind::Ghostscript.to_string(),
                    secs: self.timeout.as_secs(),
                });
            }
            Finish::Cancelled => {
                let _ = child.kill().await;
                return Err(PdfToolsError::Cancelled {
                    job: "compression".into(),
                });
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            let text = String::from_utf8_lossy(&stderr);
            let tail = tail_chars(text.trim(), STDERR_TAIL);
            return Err(self.failed(format!("exit status {status}: {tail}")));
        }
        Ok(())
    }
}

enum Finish {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Last `max` bytes of `s`, cut on a character boundary.
fn tail_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
