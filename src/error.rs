//! Error types for the pdftools library.
//!
//! Two types reflect two audiences:
//!
//! * [`PdfToolsError`]: returned from every fallible library call. Variants
//!   are grouped by where they originate: request validation, malformed
//!   content, compression backends, post-conditions, and disk I/O.
//!
//! * [`JobFailure`]: the serialisable terminal state of a failed job. An
//!   async caller never sees the original `PdfToolsError` (it lived on a
//!   worker); it sees the same [`ErrorKind`] plus the rendered message.
//!
//! [`PdfToolsError::kind`] is the bridge between the two, and also drives the
//! compression fallback policy via [`ErrorKind::allows_fallback`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the pdftools library.
#[derive(Debug, Error)]
pub enum PdfToolsError {
    // ── Validation errors ─────────────────────────────────────────────────
    /// Request rejected before any resource was allocated.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Compression profile is out of range.
    #[error("Invalid compression profile: {0}")]
    InvalidProfile(String),

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operation that needs at least one page got none.
    #[error("No pages to assemble")]
    EmptyInput,

    /// Merge needs at least two documents.
    #[error("At least 2 PDF documents are required for merging, got {got}")]
    InsufficientInputs { got: usize },

    // ── Content errors ────────────────────────────────────────────────────
    /// Input bytes could not be decoded as a raster image.
    #[error("Unsupported image (input {index}): {detail}")]
    UnsupportedImage { index: usize, detail: String },

    /// Input bytes could not be parsed as a PDF document.
    #[error("Document {index} is corrupt: {detail}")]
    CorruptDocument { index: usize, detail: String },

    // ── Compression errors ────────────────────────────────────────────────
    /// The backend's external tool is not installed or not executable.
    #[error("Compression backend '{backend}' is unavailable: {detail}")]
    CompressionBackendUnavailable { backend: String, detail: String },

    /// The backend did not finish within its wall-clock budget.
    #[error("Compression backend '{backend}' timed out after {secs}s")]
    CompressionTimedOut { backend: String, secs: u64 },

    /// The backend ran and reported failure.
    #[error("Compression backend '{backend}' failed: {detail}")]
    CompressionFailed { backend: String, detail: String },

    // ── Post-condition errors ─────────────────────────────────────────────
    /// A step reported success but left no usable output behind.
    #[error("Output '{path}' is missing or empty")]
    EmptyOutput { path: PathBuf },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Disk or permission fault on an artifact path.
    #[error("I/O failure on '{path}': {source}")]
    InternalIoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Job errors ────────────────────────────────────────────────────────
    /// The job observed its cancellation signal (soft limit or caller).
    #[error("Job {job} was cancelled")]
    Cancelled { job: String },

    /// The job exceeded its hard time limit or the caller's wait budget.
    #[error("Job {job} timed out after {secs}s")]
    TimedOut { job: String, secs: u64 },

    /// Terminal failure reported by an async job.
    #[error(transparent)]
    Job(#[from] JobFailure),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PdfToolsError {
    /// Build an [`PdfToolsError::InternalIoFailure`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PdfToolsError::InternalIoFailure {
            path: path.into(),
            source,
        }
    }

    /// Classification shared by sync errors and async job failures.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PdfToolsError::Validation(_) | PdfToolsError::InvalidConfig(_) => {
                ErrorKind::Validation
            }
            PdfToolsError::InvalidProfile(_) => ErrorKind::InvalidProfile,
            PdfToolsError::EmptyInput => ErrorKind::EmptyInput,
            PdfToolsError::InsufficientInputs { .. } => ErrorKind::InsufficientInputs,
            PdfToolsError::UnsupportedImage { .. } => ErrorKind::UnsupportedImage,
            PdfToolsError::CorruptDocument { .. } => ErrorKind::CorruptDocument,
            PdfToolsError::CompressionBackendUnavailable { .. } => {
                ErrorKind::CompressionBackendUnavailable
            }
            PdfToolsError::CompressionTimedOut { .. } => ErrorKind::CompressionTimedOut,
            PdfToolsError::CompressionFailed { .. } => ErrorKind::CompressionFailed,
            PdfToolsError::EmptyOutput { .. } => ErrorKind::EmptyOutput,
            PdfToolsError::InternalIoFailure { .. } => ErrorKind::InternalIoFailure,
            PdfToolsError::Cancelled { .. } => ErrorKind::Cancelled,
            PdfToolsError::TimedOut { .. } => ErrorKind::TimedOut,
            PdfToolsError::Job(failure) => failure.kind,
            PdfToolsError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Error classification carried by failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InvalidProfile,
    EmptyInput,
    InsufficientInputs,
    UnsupportedImage,
    CorruptDocument,
    CompressionBackendUnavailable,
    CompressionTimedOut,
    CompressionFailed,
    EmptyOutput,
    InternalIoFailure,
    Cancelled,
    TimedOut,
    Internal,
}

impl ErrorKind {
    /// Whether the compressor may try the next backend after this error.
    pub fn allows_fallback(self) -> bool {
        matches!(
            self,
            ErrorKind::CompressionBackendUnavailable
                | ErrorKind::CompressionTimedOut
                | ErrorKind::CompressionFailed
        )
    }

    /// Errors caused by the request itself rather than by the service.
    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            ErrorKind::Validation
                | ErrorKind::InvalidProfile
                | ErrorKind::EmptyInput
                | ErrorKind::InsufficientInputs
                | ErrorKind::UnsupportedImage
                | ErrorKind::CorruptDocument
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::InvalidProfile => "invalid_profile",
            ErrorKind::EmptyInput => "empty_input",
            ErrorKind::InsufficientInputs => "insufficient_inputs",
            ErrorKind::UnsupportedImage => "unsupported_image",
            ErrorKind::CorruptDocument => "corrupt_document",
            ErrorKind::CompressionBackendUnavailable => "compression_backend_unavailable",
            ErrorKind::CompressionTimedOut => "compression_timed_out",
            ErrorKind::CompressionFailed => "compression_failed",
            ErrorKind::EmptyOutput => "empty_output",
            ErrorKind::InternalIoFailure => "internal_io_failure",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Terminal failure of a job, as observed on its handle.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PdfToolsError> for JobFailure {
    fn from(err: &PdfToolsError) -> Self {
        match err {
            // Avoid nesting "kind: kind: message" when re-wrapping.
            PdfToolsError::Job(failure) => failure.clone(),
            other => JobFailure {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}
