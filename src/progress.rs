//! Progress-callback trait for job lifecycle events.
//!
//! Inject an [`Arc<dyn JobProgressCallback>`] via
//! [`crate::config::ServiceConfigBuilder::progress_callback`] to receive
//! events as jobs are queued, started, advanced and finished.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a Tokio broadcast channel, a metrics sink, a database
//! record, or a terminal spinner without the library knowing anything about
//! how the host application communicates. The trait is `Send + Sync` because
//! events fire from dispatcher workers and from the blocking pool.
//!
//! # Example
//!
//! ```rust
//! use pdftools::{JobId, JobProgressCallback, ServiceConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     pages: AtomicUsize,
//! }
//!
//! impl JobProgressCallback for CountingCallback {
//!     fn on_item_complete(&self, _job: JobId, index: usize, total: usize) {
//!         self.pages.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Item {}/{} done", index + 1, total);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { pages: AtomicUsize::new(0) });
//!
//! let config = ServiceConfig::builder()
//!     .storage_root(std::env::temp_dir().join("pdftools-doc"))
//!     .progress_callback(counter as Arc<dyn JobProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::error::JobFailure;
use crate::job::JobId;
use std::sync::Arc;

/// Called by the job layer and the dispatcher as jobs move through their
/// lifecycle.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// Events for different jobs arrive concurrently from different workers, and
/// `on_item_complete` for one conversion may fire from several blocking
/// threads. Protect shared mutable state with `Mutex` or atomics.
pub trait JobProgressCallback: Send + Sync {
    /// The job was accepted by the dispatcher.
    ///
    /// # Arguments
    /// * `job`: job identifier
    /// * `kind`: `"convert"`, `"merge"` or `"compress"`
    fn on_job_queued(&self, job: JobId, kind: &str) {
        let _ = (job, kind);
    }

    /// A worker (or the inline caller) started an attempt.
    ///
    /// # Arguments
    /// * `attempt`: 1 for the first run, higher after a redelivery
    fn on_job_start(&self, job: JobId, attempt: u32) {
        let _ = (job, attempt);
    }

    /// One input of the job was processed.
    ///
    /// For conversions this fires once per image; for merges once per parsed
    /// document. Compression reports a single item.
    ///
    /// # Arguments
    /// * `index`: 0-based input position
    /// * `total`: number of inputs
    fn on_item_complete(&self, job: JobId, index: usize, total: usize) {
        let _ = (job, index, total);
    }

    /// The job succeeded.
    ///
    /// # Arguments
    /// * `output_bytes`: size of the produced document
    fn on_job_complete(&self, job: JobId, output_bytes: u64) {
        let _ = (job, output_bytes);
    }

    /// The job failed for good (no further redelivery).
    fn on_job_error(&self, job: JobId, failure: &JobFailure) {
        let _ = (job, failure);
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl JobProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ServiceConfig`].
pub type ProgressCallback = Arc<dyn JobProgressCallback>;
