//! The service facade: store, dispatcher and collector behind one handle.
//!
//! ## Why two levels of API?
//!
//! The byte-level calls ([`PdfTools::convert_images_to_document`],
//! [`PdfTools::merge_documents`], [`PdfTools::compress_document`]) suit a
//! request handler that answers with the produced bytes and wants nothing
//! left on disk afterwards. [`PdfTools::run`] and [`PdfTools::submit`] return
//! the produced [`Artifact`] or a [`JobHandle`] instead, for callers that
//! stream the file from disk or poll a queued job.

use crate::config::ServiceConfig;
use crate::dispatch::{DispatchMode, JobHandle, TaskDispatcher};
use crate::error::PdfToolsError;
use crate::gc::{GarbageCollector, GcHandle, SweepReport};
use crate::job::{Job, JobRequest, JobRunner};
use crate::pipeline::compress::{CompressionProfile, PdfCompressor};
use crate::store::{Artifact, ArtifactStore};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A running document service.
///
/// Construct once per process with [`PdfTools::start`] and share it by
/// reference or `Arc`. Call [`PdfTools::shutdown`] before exiting so queued
/// jobs finish and the collector stops.
///
/// # Example
/// ```rust,no_run
/// use pdftools::{PdfTools, ServiceConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ServiceConfig::builder().storage_root("/tmp/pdftools").build()?;
///     let tools = PdfTools::start(config).await?;
///
///     let a = std::fs::read("a.pdf")?;
///     let b = std::fs::read("b.pdf")?;
///     let merged = tools.merge_documents(vec![a, b]).await?;
///     std::fs::write("merged.pdf", merged)?;
///
///     tools.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct PdfTools {
    config: ServiceConfig,
    store: ArtifactStore,
    dispatcher: Arc<TaskDispatcher>,
    gc: Mutex<Option<GcHandle>>,
}

impl std::fmt::Debug for PdfTools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfTools")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl PdfTools {
    /// Open the store, start the workers and, if enabled, the collector.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn start(config: ServiceConfig) -> Result<Self, PdfToolsError> {
        let store = ArtifactStore::open_with_dirs(
            &config.storage_root,
            &config.incoming_dir,
            &config.produced_dir,
        )?;
        let compressor = PdfCompressor::from_policy(&config.compression, &config.backend)?;
        debug!("Compression chain: {:?}", compressor.kinds());

        let runner = JobRunner::new(
            store.clone(),
            config.normalize,
            config.assemble,
            Arc::new(compressor),
        )
        .with_concurrency(config.convert_concurrency)
        .with_progress(config.progress_callback.clone());

        let dispatcher = TaskDispatcher::start(
            config.dispatcher.clone(),
            Arc::new(runner),
            config.progress_callback.clone(),
        )?;

        let gc = if config.enable_gc {
            Some(GarbageCollector::new(store.clone(), config.gc).spawn())
        } else {
            None
        };

        info!(
            "pdftools service started at {} (default mode: {})",
            config.storage_root.display(),
            config.default_mode
        );
        Ok(Self {
            config,
            store,
            dispatcher,
            gc: Mutex::new(gc),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// Validate `request`, stage its inputs and hand it to the dispatcher.
    ///
    /// Nothing touches disk when validation fails. If staging one input
    /// fails, the inputs already staged are released.
    pub async fn submit(
        &self,
        request: JobRequest,
        mode: DispatchMode,
    ) -> Result<JobHandle, PdfToolsError> {
        request.validate()?;
        let JobRequest { kind, inputs } = request;
        let staged = try_join_all(
            inputs
                .into_iter()
                .map(|input| async move { self.store.stage(input.bytes, &input.extension).await }),
        )
        .await?;
        let job = Job::new(kind, staged);
        debug!("Submitting job {} ({}) in {} mode", job.id, job.kind, mode);
        self.dispatcher.submit(job, mode).await
    }

    /// Run `request` to completion and return the produced artifact.
    ///
    /// The caller owns the artifact and should release it once served; the
    /// collector removes it after the TTL otherwise.
    pub async fn run(
        &self,
        request: JobRequest,
        mode: DispatchMode,
    ) -> Result<Artifact, PdfToolsError> {
        let handle = self.submit(request, mode).await?;
        Ok(handle.wait().await?)
    }

    /// Images (as `(bytes, extension)` pairs) → one PDF, one page per image
    /// in input order.
    pub async fn convert_images_to_document(
        &self,
        images: Vec<(Vec<u8>, String)>,
    ) -> Result<Vec<u8>, PdfToolsError> {
        self.run_to_bytes(JobRequest::convert(images)).await
    }

    /// Concatenate the pages of every document, in order.
    ///
    /// # Errors
    /// [`PdfToolsError::InsufficientInputs`] for fewer than two documents.
    pub async fn merge_documents(&self, documents: Vec<Vec<u8>>) -> Result<Vec<u8>, PdfToolsError> {
        self.run_to_bytes(JobRequest::merge(documents)).await
    }

    /// Compress one document according to `profile`.
    pub async fn compress_document(
        &self,
        document: Vec<u8>,
        profile: CompressionProfile,
    ) -> Result<Vec<u8>, PdfToolsError> {
        self.run_to_bytes(JobRequest::compress(document, profile)).await
    }

    async fn run_to_bytes(&self, request: JobRequest) -> Result<Vec<u8>, PdfToolsError> {
        let output = self.run(request, self.config.default_mode).await?;
        let bytes = self.store.read(&output).await;
        if let Err(e) = self.store.release(&output).await {
            warn!("Failed to release output {}: {}", output.id, e);
        }
        bytes
    }

    /// Sweep both regions now with the configured TTL.
    pub async fn sweep(&self) -> SweepReport {
        GarbageCollector::new(self.store.clone(), self.config.gc)
            .run_once()
            .await
    }

    /// Stop the collector, drain the queue and join the workers.
    pub async fn shutdown(&self) {
        if let Some(gc) = self.gc.lock().await.take() {
            gc.stop().await;
        }
        self.dispatcher.shutdown().await;
    }
}
