//! PDF compression: a validated profile plus an ordered chain of backends.
//!
//! ## Backends
//!
//! | Backend | Where it runs | What it does |
//! |---------|---------------|--------------|
//! | [`BackendKind::Ghostscript`] | external `gs` process | re-renders the whole document with downsampled, re-encoded images |
//! | [`BackendKind::Resample`] | blocking pool | decodes JPEG images in place, downsamples, re-encodes, then restructures |
//! | [`BackendKind::Restructure`] | blocking pool | prunes dead objects and Flate-compresses streams; images untouched |
//!
//! ## Why a chain?
//!
//! Ghostscript gives by far the best results but is an external binary that
//! may be missing, slow, or crash on odd input. [`CompressionPolicy`] orders
//! the backends; [`PdfCompressor`] walks that order and moves on only when a
//! backend fails for a backend-specific reason
//! ([`ErrorKind::allows_fallback`](crate::error::ErrorKind::allows_fallback)).
//! A bad profile, a corrupt input or a disk fault stops the chain at once:
//! another backend would fail the same way.

pub mod ghostscript;
pub mod profile;
pub mod resample;
pub mod restructure;

pub use ghostscript::GhostscriptBackend;
pub use profile::{CompressionProfile, ProfileColorMode};
pub use resample::ResampleBackend;
pub use restructure::RestructureBackend;

use crate::error::PdfToolsError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default wall-clock budget for one external compressor run.
pub const DEFAULT_EXTERNAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Default Ghostscript executable, resolved through `PATH`.
pub const DEFAULT_GHOSTSCRIPT_BINARY: &str = "gs";

/// Identifies a compression backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Restructure,
    Ghostscript,
    Resample,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Restructure => "restructure",
            BackendKind::Ghostscript => "ghostscript",
            BackendKind::Resample => "resample",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = PdfToolsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "restructure" => Ok(BackendKind::Restructure),
            "ghostscript" | "gs" => Ok(BackendKind::Ghostscript),
            "resample" => Ok(BackendKind::Resample),
            other => Err(PdfToolsError::InvalidConfig(format!(
                "unknown compression backend '{other}'"
            ))),
        }
    }
}

/// Order in which backends are tried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionPolicy {
    pub backends: Vec<BackendKind>,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            backends: vec![BackendKind::Ghostscript, BackendKind::Restructure],
        }
    }
}

impl CompressionPolicy {
    pub fn new(backends: Vec<BackendKind>) -> Self {
        Self { backends }
    }

    /// Non-empty, without duplicates.
    pub fn validate(&self) -> Result<(), PdfToolsError> {
        if self.backends.is_empty() {
            return Err(PdfToolsError::InvalidConfig(
                "compression policy needs at least one backend".into(),
            ));
        }
        for (i, kind) in self.backends.iter().enumerate() {
            if self.backends[..i].contains(kind) {
                return Err(PdfToolsError::InvalidConfig(format!(
                    "compression backend '{kind}' listed twice"
                )));
            }
        }
        Ok(())
    }
}

impl FromStr for CompressionPolicy {
    type Err = PdfToolsError;

    /// Comma-separated backend names, e.g. `"ghostscript,restructure"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let backends = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(BackendKind::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        let policy = Self { backends };
        policy.validate()?;
        Ok(policy)
    }
}

impl fmt::Display for CompressionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.backends.iter().map(|b| b.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

/// Settings consumed when building backends from a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub ghostscript_binary: PathBuf,
    pub external_timeout: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            ghostscript_binary: PathBuf::from(DEFAULT_GHOSTSCRIPT_BINARY),
            external_timeout: DEFAULT_EXTERNAL_TIMEOUT,
        }
    }
}

/// One way of turning an input PDF file into a smaller output PDF file.
///
/// Implementations write `output` themselves and must not touch `input`.
/// They need not clean up a partial `output` on failure; the compressor does.
#[async_trait]
pub trait CompressionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn compress(
        &self,
        input: &Path,
        output: &Path,
        profile: &CompressionProfile,
        cancel: &CancellationToken,
    ) -> Result<(), PdfToolsError>;
}

/// What a successful compression produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionOutcome {
    pub backend: BackendKind,
    pub input_bytes: u64,
    pub output_bytes: u64,
}

impl CompressionOutcome {
    /// Output size as a fraction of input size.
    pub fn ratio(&self) -> f64 {
        if self.input_bytes == 0 {
            return 1.0;
        }
        self.output_bytes as f64 / self.input_bytes as f64
    }
}

/// Runs backends in policy order until one succeeds.
#[derive(Clone)]
pub struct PdfCompressor {
    backends: Vec<Arc<dyn CompressionBackend>>,
}

impl fmt::Debug for PdfCompressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdfCompressor")
            .field("backends", &self.kinds())
            .finish()
    }
}

impl PdfCompressor {
    /// Chain explicit backend instances.
    pub fn new(backends: Vec<Arc<dyn CompressionBackend>>) -> Result<Self, PdfToolsError> {
        if backends.is_empty() {
            return Err(PdfToolsError::InvalidConfig(
                "compressor needs at least one backend".into(),
            ));
        }
        Ok(Self { backends })
    }

    /// Build the standard backends named by `policy`.
    pub fn from_policy(
        policy: &CompressionPolicy,
        settings: &BackendSettings,
    ) -> Result<Self, PdfToolsError> {
        policy.validate()?;
        let backends = policy
            .backends
            .iter()
            .map(|kind| -> Arc<dyn CompressionBackend> {
                match kind {
                    BackendKind::Restructure => Arc::new(RestructureBackend),
                    BackendKind::Ghostscript => Arc::new(GhostscriptBackend::new(
                        settings.ghostscript_binary.clone(),
                        settings.external_timeout,
                    )),
                    BackendKind::Resample => Arc::new(ResampleBackend),
                }
            })
            .collect();
        Self::new(backends)
    }

    /// Backend order, for logging and diagnostics.
    pub fn kinds(&self) -> Vec<BackendKind> {
        self.backends.iter().map(|b| b.kind()).collect()
    }

    /// Compress `input` into `output` with the first backend that succeeds.
    ///
    /// The profile is validated before any file is touched. On success
    /// `output` exists and is non-empty; on failure nothing is left at
    /// `output`. `input` is never modified.
    ///
    /// # Errors
    /// - [`PdfToolsError::InvalidProfile`] for an out-of-range profile
    /// - the last backend error when every backend failed
    /// - [`PdfToolsError::EmptyOutput`] when a backend reported success but
    ///   wrote nothing
    pub async fn compress(
        &self,
        input: &Path,
        output: &Path,
        profile: &CompressionProfile,
        cancel: &CancellationToken,
    ) -> Result<CompressionOutcome, PdfToolsError> {
        profile.validate()?;
        let input_bytes = tokio::fs::metadata(input)
            .await
            .map_err(|e| PdfToolsError::io(input, e))?
            .len();

        let mut last_err = None;
        for (position, backend) in self.backends.iter().enumerate() {
            if cancel.is_cancelled() {
                remove_if_exists(output).await;
                return Err(PdfToolsError::Cancelled {
                    job: "compression".into(),
                });
            }
            let kind = backend.kind();
            remove_if_exists(output).await;

            let start = Instant::now();
            debug!("Compressing {} with {} ({})", input.display(), kind, profile);
            match backend.compress(input, output, profile, cancel).await {
                Ok(()) => {
                    let output_bytes = match tokio::fs::metadata(output).await {
                        Ok(meta) => meta.len(),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                        Err(e) => {
                            remove_if_exists(output).await;
                            return Err(PdfToolsError::io(output, e));
                        }
                    };
                    if output_bytes == 0 {
                        remove_if_exists(output).await;
                        return Err(PdfToolsError::EmptyOutput {
                            path: output.to_path_buf(),
                        });
                    }
                    let outcome = CompressionOutcome {
                        backend: kind,
                        input_bytes,
                        output_bytes,
                    };
                    info!(
                        "Compressed with {}: {} → {} bytes ({:.0}%) in {}ms",
                        kind,
                        input_bytes,
                        output_bytes,
                        outcome.ratio() * 100.0,
                        start.elapsed().as_millis()
                    );
                    return Ok(outcome);
                }
                Err(e) => {
                    remove_if_exists(output).await;
                    let has_next = position + 1 < self.backends.len();
                    if e.kind().allows_fallback() && has_next {
                        warn!("Compression backend {} failed, trying next: {}", kind, e);
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            PdfToolsError::Internal("compressor has no backends".into())
        }))
    }
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Scripted backend: fails with a given error, or writes fixed bytes.
    struct FakeBackend {
        kind: BackendKind,
        result: fn(&Path) -> Result<(), PdfToolsError>,
        calls: AtomicUsize,
    }

    impl FakeBackend {
        fn new(kind: BackendKind, result: fn(&Path) -> Result<(), PdfToolsError>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    fn dynamic(backend: &Arc<FakeBackend>) -> Arc<dyn CompressionBackend> {
        backend.clone()
    }

    #[async_trait]
    impl CompressionBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn compress(
            &self,
            _input: &Path,
            output: &Path,
            _profile: &CompressionProfile,
            _cancel: &CancellationToken,
        ) -> Result<(), PdfToolsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)(output)
        }
    }

    fn unavailable(_: &Path) -> Result<(), PdfToolsError> {
        Err(PdfToolsError::CompressionBackendUnavailable {
            backend: "ghostscript".into(),
            detail: "not installed".into(),
        })
    }

    fn corrupt(out: &Path) -> Result<(), PdfToolsError> {
        std::fs::write(out, b"partial").unwrap();
        Err(PdfToolsError::CorruptDocument {
            index: 0,
            detail: "bad xref".into(),
        })
    }

    fn writes_output(out: &Path) -> Result<(), PdfToolsError> {
        std::fs::write(out, b"%PDF-1.4 small").unwrap();
        Ok(())
    }

    fn writes_nothing(_: &Path) -> Result<(), PdfToolsError> {
        Ok(())
    }

    fn input_file() -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.pdf");
        std::fs::write(&input, vec![b'x'; 1000]).unwrap();
        let output = dir.path().join("out.pdf");
        (dir, input, output)
    }

    #[tokio::test]
    async fn invalid_profile_runs_no_backend() {
        let backend = FakeBackend::new(BackendKind::Restructure, writes_output);
        let compressor = PdfCompressor::new(vec![dynamic(&backend)]).unwrap();
        let (_dir, input, output) = input_file();

        let bad = CompressionProfile::new(71, 75, ProfileColorMode::Unchanged);
        let err = compressor
            .compress(&input, &output, &bad, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidProfile);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn unavailable_backend_falls_back() {
        let gs = FakeBackend::new(BackendKind::Ghostscript, unavailable);
        let restructure = FakeBackend::new(BackendKind::Restructure, writes_output);
        let compressor = PdfCompressor::new(vec![dynamic(&gs), dynamic(&restructure)]).unwrap();
        let (_dir, input, output) = input_file();

        let outcome = compressor
            .compress(&input, &output, &CompressionProfile::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.backend, BackendKind::Restructure);
        assert_eq!(outcome.input_bytes, 1000);
        assert_eq!(outcome.output_bytes, 14);
        assert_eq!(gs.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn last_backend_error_surfaces() {
        let only = FakeBackend::new(BackendKind::Ghostscript, unavailable);
        let compressor = PdfCompressor::new(vec![dynamic(&only)]).unwrap();
        let (_dir, input, output) = input_file();

        let err = compressor
            .compress(&input, &output, &CompressionProfile::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompressionBackendUnavailable);
    }

    #[tokio::test]
    async fn content_errors_do_not_fall_back_and_clean_up() {
        let first = FakeBackend::new(BackendKind::Resample, corrupt);
        let second = FakeBackend::new(BackendKind::Restructure, writes_output);
        let compressor = PdfCompressor::new(vec![dynamic(&first), dynamic(&second)]).unwrap();
        let (_dir, input, output) = input_file();

        let err = compressor
            .compress(&input, &output, &CompressionProfile::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptDocument);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
        assert!(!output.exists(), "partial output must be removed");
    }

    #[tokio::test]
    async fn success_without_output_is_empty_output() {
        let backend = FakeBackend::new(BackendKind::Restructure, writes_nothing);
        let compressor = PdfCompressor::new(vec![dynamic(&backend)]).unwrap();
        let (_dir, input, output) = input_file();

        let err = compressor
            .compress(&input, &output, &CompressionProfile::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyOutput);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let backend = FakeBackend::new(BackendKind::Restructure, writes_output);
        let compressor = PdfCompressor::new(vec![dynamic(&backend)]).unwrap();
        let (_dir, input, output) = input_file();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = compressor
            .compress(&input, &output, &CompressionProfile::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn policy_parses_and_validates() {
        let policy: CompressionPolicy = "gs, restructure".parse().unwrap();
        assert_eq!(
            policy.backends,
            vec![BackendKind::Ghostscript, BackendKind::Restructure]
        );
        assert_eq!(policy.to_string(), "ghostscript,restructure");
        assert!("".parse::<CompressionPolicy>().is_err());
        assert!("restructure,restructure".parse::<CompressionPolicy>().is_err());
        assert!("zip".parse::<CompressionPolicy>().is_err());
    }

    #[test]
    fn default_policy_prefers_ghostscript() {
        assert_eq!(
            CompressionPolicy::default().backends,
            vec![BackendKind::Ghostscript, BackendKind::Restructure]
        );
    }

    #[test]
    fn from_policy_builds_in_order() {
        let policy = CompressionPolicy::new(vec![BackendKind::Resample, BackendKind::Restructure]);
        let compressor = PdfCompressor::from_policy(&policy, &BackendSettings::default()).unwrap();
        assert_eq!(
            compressor.kinds(),
            vec![BackendKind::Resample, BackendKind::Restructure]
        );
        assert!(PdfCompressor::new(vec![]).is_err());
    }
}
