//! In-process structural compression.
//!
//! Drops objects nothing references, drops zero-length streams, and
//! Flate-compresses every stream that is still stored raw. Embedded images
//! are left exactly as they are, so this pass is lossless and always
//! available, at the cost of modest savings on image-heavy documents.

use super::{BackendKind, CompressionBackend, CompressionProfile};
use crate::error::PdfToolsError;
use crate::pipeline::{load_document, save_document};
use async_trait::async_trait;
use lopdf::Document;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lossless object-graph cleanup and stream compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestructureBackend;

#[async_trait]
impl CompressionBackend for RestructureBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Restructure
    }

    async fn compress(
        &self,
        input: &Path,
        output: &Path,
        _profile: &CompressionProfile,
        _cancel: &CancellationToken,
    ) -> Result<(), PdfToolsError> {
        let bytes = tokio::fs::read(input)
            .await
            .map_err(|e| PdfToolsError::io(input, e))?;

        let compressed = tokio::task::spawn_blocking(move || {
            let mut document = load_document(&bytes, 0)?;
            restructure(&mut document);
            save_document(&mut document)
        })
        .await
        .map_err(|e| PdfToolsError::Internal(format!("Restructure task panicked: {e}")))??;

        tokio::fs::write(output, compressed)
            .await
            .map_err(|e| PdfToolsError::io(output, e))
    }
}

/// Apply the lossless cleanup to a parsed document.
pub(crate) fn restructure(document: &mut Document) {
    let before = document.objects.len();
    document.delete_zero_length_streams();
    let pruned = document.prune_objects();
    document.compress();
    debug!(
        "Restructured: {} objects, {} pruned, {} remaining",
        before,
        pruned.len(),
        document.objects.len()
    );
}
