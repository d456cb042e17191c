//! Jobs: what a caller asks for, and how one attempt of it is executed.
//!
//! A [`JobRequest`] carries raw bytes and is validated before anything
//! touches disk. Once its inputs are staged it becomes a [`JobSpec`]: plain
//! data (kind, ordered input artifacts, attempt number) that can be queued,
//! redelivered and logged. A [`JobExecutor`] turns a spec into an output
//! artifact; [`JobRunner`] is the executor wired to the real pipeline.
//!
//! ## Why the executor returns a guard
//!
//! [`JobExecutor::execute`] hands back a [`StagedArtifact`], not an
//! [`Artifact`]. Until the dispatcher has decided the attempt really counts
//! (it was not cancelled in the meantime, nobody stopped waiting), the output
//! stays armed: any early return or dropped future deletes it.

use crate::error::{JobFailure, PdfToolsError};
use crate::pipeline::assemble::{assemble, AssembleOptions};
use crate::pipeline::compress::{CompressionProfile, PdfCompressor};
use crate::pipeline::normalize::{normalize, NormalizePolicy, PageImage};
use crate::pipeline::{
    is_document_extension, is_image_extension, load_document, merge, save_document,
};
use crate::progress::ProgressCallback;
use crate::store::{Artifact, ArtifactStore, StagedArtifact};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The operation a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JobKind {
    /// Images → one PDF, one page per image.
    ConvertImages,
    /// Several PDFs → one PDF.
    Merge,
    /// One PDF → a smaller PDF.
    Compress { profile: CompressionProfile },
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::ConvertImages => "convert",
            JobKind::Merge => "merge",
            JobKind::Compress { .. } => "compress",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One caller-supplied input: bytes plus the extension they arrived with.
#[derive(Debug, Clone)]
pub struct JobInput {
    pub bytes: Vec<u8>,
    pub extension: String,
}

impl JobInput {
    pub fn new(bytes: Vec<u8>, extension: impl Into<String>) -> Self {
        Self {
            bytes,
            extension: extension.into(),
        }
    }
}

/// A job as submitted by a caller, before anything is staged.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    pub inputs: Vec<JobInput>,
}

impl JobRequest {
    /// Convert images, given as `(bytes, extension)` pairs in page order.
    pub fn convert(images: Vec<(Vec<u8>, String)>) -> Self {
        Self {
            kind: JobKind::ConvertImages,
            inputs: images
                .into_iter()
                .map(|(bytes, ext)| JobInput::new(bytes, ext))
                .collect(),
        }
    }

    /// Merge documents in the given order.
    pub fn merge(documents: Vec<Vec<u8>>) -> Self {
        Self {
            kind: JobKind::Merge,
            inputs: documents
                .into_iter()
                .map(|bytes| JobInput::new(bytes, "pdf"))
                .collect(),
        }
    }

    /// Compress one document.
    pub fn compress(document: Vec<u8>, profile: CompressionProfile) -> Self {
        Self {
            kind: JobKind::Compress { profile },
            inputs: vec![JobInput::new(document, "pdf")],
        }
    }

    /// Reject the request before any resource is allocated.
    ///
    /// # Errors
    /// - [`PdfToolsError::EmptyInput`] for a conversion without images
    /// - [`PdfToolsError::InsufficientInputs`] for a merge of fewer than two
    /// - [`PdfToolsError::InvalidProfile`] for an out-of-range profile
    /// - [`PdfToolsError::Validation`] for a wrong extension or input count
    pub fn validate(&self) -> Result<(), PdfToolsError> {
        match &self.kind {
            JobKind::ConvertImages => {
                if self.inputs.is_empty() {
                    return Err(PdfToolsError::EmptyInput);
                }
                for (i, input) in self.inputs.iter().enumerate() {
                    if !is_image_extension(&input.extension) {
                        return Err(PdfToolsError::Validation(format!(
                            "input {i}: '{}' is not an accepted image type",
                            input.extension
                        )));
                    }
                }
            }
            JobKind::Merge => {
                if self.inputs.len() < 2 {
                    return Err(PdfToolsError::InsufficientInputs {
                        got: self.inputs.len(),
                    });
                }
                self.require_documents()?;
            }
            JobKind::Compress { profile } => {
                profile.validate()?;
                if self.inputs.len() != 1 {
                    return Err(PdfToolsError::Validation(format!(
                        "compression takes exactly one document, got {}",
                        self.inputs.len()
                    )));
                }
                self.require_documents()?;
            }
        }
        Ok(())
    }

    fn require_documents(&self) -> Result<(), PdfToolsError> {
        for (i, input) in self.inputs.iter().enumerate() {
            if !is_document_extension(&input.extension) {
                return Err(PdfToolsError::Validation(format!(
                    "input {i}: '{}' is not a PDF document",
                    input.extension
                )));
            }
        }
        Ok(())
    }
}

/// A job whose inputs are staged and held by guards.
///
/// Dropping a `Job` releases its inputs; submitting it hands them to the
/// dispatcher, which releases them when the job ends.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub inputs: Vec<StagedArtifact>,
}

impl Job {
    pub fn new(kind: JobKind, inputs: Vec<StagedArtifact>) -> Self {
        Self {
            id: JobId::new(),
            kind,
            inputs,
        }
    }

    /// The plain-data view of this job for its first attempt.
    pub fn spec(&self) -> JobSpec {
        JobSpec {
            id: self.id,
            kind: self.kind,
            inputs: self.inputs.iter().map(|i| i.artifact().clone()).collect(),
            attempt: 1,
        }
    }
}

/// A staged job: everything one attempt needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub kind: JobKind,
    /// Staged inputs, in caller order.
    pub inputs: Vec<Artifact>,
    /// 1 for the first run; incremented on every redelivery.
    pub attempt: u32,
}

impl JobSpec {
    pub fn new(kind: JobKind, inputs: Vec<Artifact>) -> Self {
        Self {
            id: JobId::new(),
            kind,
            inputs,
            attempt: 1,
        }
    }

    fn cancelled(&self) -> PdfToolsError {
        PdfToolsError::Cancelled {
            job: self.id.to_string(),
        }
    }

    /// Fail fast between stages once the job's token has fired.
    fn ensure_live(&self, cancel: &CancellationToken) -> Result<(), PdfToolsError> {
        if cancel.is_cancelled() {
            Err(self.cancelled())
        } else {
            Ok(())
        }
    }
}

/// Observable state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running { attempt: u32 },
    Succeeded { output: Artifact },
    Failed { failure: JobFailure },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. } | JobStatus::Failed { .. })
    }
}

/// Executes one attempt of a job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Produce the job's output.
    ///
    /// Implementations check `cancel` between stages and return
    /// [`PdfToolsError::Cancelled`] once it fires. They must not release the
    /// spec's inputs; the dispatcher owns those.
    async fn execute(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> Result<StagedArtifact, PdfToolsError>;
}

/// The production executor: pipeline stages over the artifact store.
pub struct JobRunner {
    store: ArtifactStore,
    normalize: NormalizePolicy,
    assemble: AssembleOptions,
    compressor: Arc<PdfCompressor>,
    concurrency: usize,
    progress: Option<ProgressCallback>,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("store", &self.store)
            .field("normalize", &self.normalize)
            .field("assemble", &self.assemble)
            .field("compressor", &self.compressor)
            .field("concurrency", &self.concurrency)
            .field("progress", &self.progress.as_ref().map(|_| "<dyn JobProgressCallback>"))
            .finish()
    }
}

impl JobRunner {
    pub fn new(
        store: ArtifactStore,
        normalize: NormalizePolicy,
        assemble: AssembleOptions,
        compressor: Arc<PdfCompressor>,
    ) -> Self {
        Self {
            store,
            normalize,
            assemble,
            compressor,
            concurrency: 1,
            progress: None,
        }
    }

    /// Images decoded in parallel during a conversion.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn item_done(&self, spec: &JobSpec, index: usize, total: usize) {
        if let Some(ref cb) = self.progress {
            cb.on_item_complete(spec.id, index, total);
        }
    }

    // ── Convert ──────────────────────────────────────────────────────────

    async fn convert(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> Result<StagedArtifact, PdfToolsError> {
        let total = spec.inputs.len();
        if total == 0 {
            return Err(PdfToolsError::EmptyInput);
        }

        // Order-preserving: `buffered` yields results in input order even
        // though up to `concurrency` decodes run at once.
        let inputs = spec.inputs.clone().into_iter().enumerate();
        let pages: Vec<PageImage> = stream::iter(inputs.map(|(index, artifact)| {
            let policy = self.normalize;
            async move {
                spec.ensure_live(cancel)?;
                let raw = self.store.read(&artifact).await?;
                let page = tokio::task::spawn_blocking(move || normalize(&raw, &policy))
                    .await
                    .map_err(|e| PdfToolsError::Internal(format!("Normalize task panicked: {e}")))?
                    .map_err(|e| match e {
                        PdfToolsError::UnsupportedImage { detail, .. } => {
                            PdfToolsError::UnsupportedImage { index, detail }
                        }
                        other => other,
                    })?;
                self.item_done(spec, index, total);
                Ok::<_, PdfToolsError>(page)
            }
        }))
        .buffered(self.concurrency)
        .try_collect()
        .await?;

        spec.ensure_live(cancel)?;
        let options = self.assemble;
        let bytes = tokio::task::spawn_blocking(move || {
            let mut document = assemble(pages, &options)?;
            save_document(&mut document)
        })
        .await
        .map_err(|e| PdfToolsError::Internal(format!("Assemble task panicked: {e}")))??;

        self.finish(spec, cancel, bytes).await
    }

    // ── Merge ────────────────────────────────────────────────────────────

    async fn merge(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> Result<StagedArtifact, PdfToolsError> {
        let total = spec.inputs.len();
        if total < 2 {
            return Err(PdfToolsError::InsufficientInputs { got: total });
        }

        let mut documents = Vec::with_capacity(total);
        for (index, artifact) in spec.inputs.iter().enumerate() {
            spec.ensure_live(cancel)?;
            let raw = self.store.read(artifact).await?;
            let document = tokio::task::spawn_blocking(move || load_document(&raw, index))
                .await
                .map_err(|e| PdfToolsError::Internal(format!("Parse task panicked: {e}")))??;
            self.item_done(spec, index, total);
            documents.push(document);
        }

        spec.ensure_live(cancel)?;
        let bytes = tokio::task::spawn_blocking(move || {
            let mut merged = merge::merge(documents)?;
            save_document(&mut merged)
        })
        .await
        .map_err(|e| PdfToolsError::Internal(format!("Merge task panicked: {e}")))??;

        self.finish(spec, cancel, bytes).await
    }

    // ── Compress ─────────────────────────────────────────────────────────

    async fn compress(
        &self,
        spec: &JobSpec,
        profile: &CompressionProfile,
        cancel: &CancellationToken,
    ) -> Result<StagedArtifact, PdfToolsError> {
        profile.validate()?;
        let input = match spec.inputs.as_slice() {
            [input] => input,
            other => {
                return Err(PdfToolsError::Validation(format!(
                    "compression takes exactly one document, got {}",
                    other.len()
                )))
            }
        };
        spec.ensure_live(cancel)?;

        let slot = self.store.reserve("pdf");
        self.compressor
            .compress(&input.path, slot.path(), profile, cancel)
            .await
            .map_err(|e| match e {
                PdfToolsError::Cancelled { .. } => spec.cancelled(),
                other => other,
            })?;
        self.item_done(spec, 0, 1);

        let staged = self.store.seal(slot).await?;
        spec.ensure_live(cancel)?;
        Ok(staged)
    }

    /// Write the produced bytes and confirm the artifact is really there.
    async fn finish(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
        bytes: Vec<u8>,
    ) -> Result<StagedArtifact, PdfToolsError> {
        spec.ensure_live(cancel)?;
        let staged = self.store.finalize(bytes).await?;
        if !self.store.exists(staged.artifact()).await {
            return Err(PdfToolsError::io(
                staged.path(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "output vanished after write"),
            ));
        }
        Ok(staged)
    }
}

#[async_trait]
impl JobExecutor for JobRunner {
    async fn execute(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> Result<StagedArtifact, PdfToolsError> {
        let start = Instant::now();
        debug!(
            "Job {} ({}) attempt {} with {} input(s)",
            spec.id,
            spec.kind,
            spec.attempt,
            spec.inputs.len()
        );
        let result = match &spec.kind {
            JobKind::ConvertImages => self.convert(spec, cancel).await,
            JobKind::Merge => self.merge(spec, cancel).await,
            JobKind::Compress { profile } => self.compress(spec, profile, cancel).await,
        };
        if let Ok(ref staged) = result {
            info!(
                "Job {} ({}) produced {} bytes in {}ms",
                spec.id,
                spec.kind,
                staged.artifact().size,
                start.elapsed().as_millis()
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pipeline::compress::{
        BackendKind, BackendSettings, CompressionPolicy, ProfileColorMode,
    };
    use crate::pipeline::normalize::tests::png_bytes;
    use crate::pipeline::page_count;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn runner() -> (TempDir, JobRunner) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let compressor = PdfCompressor::from_policy(
            &CompressionPolicy::new(vec![BackendKind::Restructure]),
            &BackendSettings::default(),
        )
        .unwrap();
        let runner = JobRunner::new(
            store,
            NormalizePolicy::default(),
            AssembleOptions::default(),
            Arc::new(compressor),
        )
        .with_concurrency(2);
        (dir, runner)
    }

    async fn stage_images(runner: &JobRunner, n: usize) -> Vec<Artifact> {
        let mut out = Vec::new();
        for i in 0..n {
            let img = RgbImage::from_pixel(40 + i as u32 * 10, 60, Rgb([i as u8 * 40, 0, 0]));
            out.push(runner.store().stage(png_bytes(&img), "png").await.unwrap().promote());
        }
        out
    }

    #[test]
    fn request_validation_precedes_staging() {
        assert!(matches!(
            JobRequest::convert(vec![]).validate(),
            Err(PdfToolsError::EmptyInput)
        ));
        assert!(matches!(
            JobRequest::merge(vec![b"%PDF".to_vec()]).validate(),
            Err(PdfToolsError::InsufficientInputs { got: 1 })
        ));
        let bad = CompressionProfile::new(72, 5, ProfileColorMode::Unchanged);
        assert_eq!(
            JobRequest::compress(vec![1], bad).validate().unwrap_err().kind(),
            ErrorKind::InvalidProfile
        );
        let tiff = JobRequest::convert(vec![(vec![1], "tiff".into())]);
        assert_eq!(tiff.validate().unwrap_err().kind(), ErrorKind::Validation);
        assert!(JobRequest::convert(vec![(vec![1], ".JPG".into())]).validate().is_ok());
    }

    #[test]
    fn status_serialises_with_tag() {
        let json = serde_json::to_string(&JobStatus::Running { attempt: 2 }).unwrap();
        assert_eq!(json, r#"{"status":"running","attempt":2}"#);
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[tokio::test]
    async fn convert_produces_one_page_per_image() {
        let (_dir, runner) = runner();
        let inputs = stage_images(&runner, 3).await;
        let spec = JobSpec::new(JobKind::ConvertImages, inputs);

        let staged = runner.execute(&spec, &CancellationToken::new()).await.unwrap();
        let bytes = runner.store().read(staged.artifact()).await.unwrap();
        assert_eq!(page_count(&bytes).unwrap(), 3);
    }

    #[tokio::test]
    async fn bad_image_reports_its_position() {
        let (_dir, runner) = runner();
        let mut inputs = stage_images(&runner, 2).await;
        inputs.push(runner.store().stage(b"not an image".to_vec(), "jpg").await.unwrap().promote());

        let spec = JobSpec::new(JobKind::ConvertImages, inputs);
        let err = runner.execute(&spec, &CancellationToken::new()).await.unwrap_err();
        match err {
            PdfToolsError::UnsupportedImage { index, .. } => assert_eq!(index, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn merge_then_compress() {
        let (_dir, runner) = runner();
        let two = JobSpec::new(JobKind::ConvertImages, stage_images(&runner, 2).await);
        let a = runner
            .execute(&two, &CancellationToken::new())
            .await
            .unwrap()
            .promote();
        let one = JobSpec::new(JobKind::ConvertImages, stage_images(&runner, 1).await);
        let b = runner
            .execute(&one, &CancellationToken::new())
            .await
            .unwrap()
            .promote();

        let merged = runner
            .execute(&JobSpec::new(JobKind::Merge, vec![a, b]), &CancellationToken::new())
            .await
            .unwrap();
        let merged_bytes = runner.store().read(merged.artifact()).await.unwrap();
        assert_eq!(page_count(&merged_bytes).unwrap(), 3);

        let spec = JobSpec::new(
            JobKind::Compress {
                profile: CompressionProfile::default(),
            },
            vec![merged.artifact().clone()],
        );
        let compressed = runner.execute(&spec, &CancellationToken::new()).await.unwrap();
        let bytes = runner.store().read(compressed.artifact()).await.unwrap();
        assert_eq!(page_count(&bytes).unwrap(), 3);
    }

    #[tokio::test]
    async fn cancelled_job_leaves_no_output() {
        let (_dir, runner) = runner();
        let inputs = stage_images(&runner, 2).await;
        let spec = JobSpec::new(JobKind::ConvertImages, inputs);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = runner.execute(&spec, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(err.to_string().contains(&spec.id.to_string()));

        let produced = std::fs::read_dir(runner.store().region_dir(crate::store::Region::Produced))
            .unwrap()
            .count();
        assert_eq!(produced, 0);
    }
}
