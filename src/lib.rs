//! # pdftools
//!
//! Convert images to PDF, merge PDFs and compress PDFs, with every
//! intermediate file tracked and cleaned up.
//!
//! ## Why this crate?
//!
//! The transformations themselves are small. What makes a document service
//! hard to run is everything around them: uploads that outlive their request,
//! outputs nobody collects, an external compressor that hangs, a worker that
//! dies halfway through. This crate puts every file behind a scoped guard,
//! every job behind soft and hard time limits, and sweeps whatever still
//! slips through.
//!
//! ## Pipeline Overview
//!
//! ```text
//! caller bytes
//!  │
//!  ├─ 1. Validate   extensions, input counts, compression profile
//!  ├─ 2. Stage      bytes → incoming/<uuid>.<ext>      (StagedArtifact guards)
//!  ├─ 3. Dispatch   inline, or the "pdf_processing" worker queue
//!  ├─ 4. Transform  normalize+assemble │ merge │ compress (gs → restructure)
//!  ├─ 5. Finalize   produced/<uuid>.pdf, inputs released
//!  └─ 6. Sweep      both regions, every 30 min, TTL 1 h
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdftools::{CompressionProfile, PdfTools, ProfileColorMode, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tools = PdfTools::start(ServiceConfig::default()).await?;
//!
//!     let scan = std::fs::read("scan.jpg")?;
//!     let pdf = tools
//!         .convert_images_to_document(vec![(scan, "jpg".to_string())])
//!         .await?;
//!
//!     let profile = CompressionProfile::new(96, 60, ProfileColorMode::Grayscale);
//!     let small = tools.compress_document(pdf, profile).await?;
//!     std::fs::write("scan.pdf", small)?;
//!
//!     tools.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdftools` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdftools = { version = "0.1", default-features = false }
//! ```
//!
//! ## Compression Backends
//!
//! | Backend | Needs | Result |
//! |---------|-------|--------|
//! | `ghostscript` | `gs` on `PATH` | best: images re-rendered at the target DPI |
//! | `resample` | nothing | good for JPEG-heavy scans |
//! | `restructure` | nothing | lossless: dead objects pruned, streams deflated |
//!
//! The default chain is `ghostscript,restructure`: a missing or failing
//! Ghostscript falls back to the lossless pass.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod dispatch;
pub mod error;
pub mod gc;
pub mod job;
pub mod pipeline;
pub mod progress;
pub mod service;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ServiceConfig, ServiceConfigBuilder};
pub use dispatch::{DispatchMode, DispatcherConfig, JobHandle, TaskDispatcher};
pub use error::{ErrorKind, JobFailure, PdfToolsError};
pub use gc::{GarbageCollector, GcConfig, GcHandle, SweepReport};
pub use job::{Job, JobExecutor, JobId, JobKind, JobRequest, JobRunner, JobSpec, JobStatus};
pub use pipeline::compress::{
    BackendKind, CompressionPolicy, CompressionProfile, PdfCompressor, ProfileColorMode,
};
pub use pipeline::normalize::{ColorMode, PagePolicy};
pub use pipeline::{is_document_extension, is_image_extension};
pub use progress::{JobProgressCallback, NoopProgressCallback, ProgressCallback};
pub use service::PdfTools;
pub use store::{Artifact, ArtifactId, ArtifactStore, Region, StagedArtifact};
