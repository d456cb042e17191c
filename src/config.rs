//! Configuration for the document service.
//!
//! Every knob lives in [`ServiceConfig`], built via its
//! [`ServiceConfigBuilder`]. One struct means one place to look when two
//! deployments behave differently, and one value to hand to
//! [`crate::service::PdfTools::start`].
//!
//! # Design choice: builder over constructor
//! Callers set only what they care about. Setters clamp numeric values into
//! their accepted range; [`ServiceConfigBuilder::build`] rejects the
//! combinations that clamping cannot fix (an empty backend list, a hard time
//! limit shorter than the soft one).

use crate::dispatch::{DispatchMode, DispatcherConfig};
use crate::error::PdfToolsError;
use crate::gc::{GcConfig, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL};
use crate::pipeline::assemble::{AssembleOptions, DEFAULT_JPEG_QUALITY, DEFAULT_RESOLUTION};
use crate::pipeline::compress::{
    BackendKind, BackendSettings, CompressionPolicy, DEFAULT_EXTERNAL_TIMEOUT,
    DEFAULT_GHOSTSCRIPT_BINARY,
};
use crate::pipeline::normalize::{ColorMode, NormalizePolicy, PagePolicy, DEFAULT_MAX_DIMENSION};
use crate::progress::ProgressCallback;
use crate::store::{INCOMING_DIR, PRODUCED_DIR};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default storage root when none is configured.
pub const DEFAULT_STORAGE_ROOT: &str = "pdftools-data";

/// Configuration for a [`crate::service::PdfTools`] instance.
///
/// # Example
/// ```rust
/// use pdftools::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .storage_root("/var/lib/pdftools")
///     .workers(4)
///     .ttl_secs(1800)
///     .build()
///     .unwrap();
/// assert_eq!(config.dispatcher.workers, 4);
/// ```
#[derive(Clone)]
pub struct ServiceConfig {
    /// Directory holding both artifact regions. Default: `pdftools-data`.
    pub storage_root: PathBuf,

    /// Name of the incoming region's directory under the root. Default: `incoming`.
    pub incoming_dir: String,

    /// Name of the produced region's directory under the root. Default: `produced`.
    pub produced_dir: String,

    /// Artifact lifetime and sweep cadence. Default: 1 h TTL, sweep every 30 min.
    ///
    /// The TTL bounds how long a leaked file can live. It must comfortably
    /// exceed the dispatcher's hard time limit, or a sweep may delete the
    /// inputs of a job that is still running.
    pub gc: GcConfig,

    /// Whether [`crate::service::PdfTools::start`] spawns the collector. Default: true.
    ///
    /// One-shot CLI runs switch this off and sweep explicitly instead.
    pub enable_gc: bool,

    /// Image normalization: colour mode, page geometry, decode cap.
    ///
    /// Defaults to RGB pages fitted within A4 at the page resolution, with
    /// the longest decoded edge capped at 6000 px so a hostile upload cannot
    /// exhaust memory.
    pub normalize: NormalizePolicy,

    /// Page resolution and JPEG quality for converted documents.
    /// Default: 100 DPI, quality 92.
    pub assemble: AssembleOptions,

    /// Images decoded in parallel during one conversion. Default: 4.
    ///
    /// Decoding is CPU-bound and runs on the blocking pool; more than the
    /// core count only adds memory pressure.
    pub convert_concurrency: usize,

    /// Compression backends, in fallback order. Default: `ghostscript,restructure`.
    pub compression: CompressionPolicy,

    /// Ghostscript executable and the per-run timeout for external backends.
    pub backend: BackendSettings,

    /// Queue name, workers, time limits, recycling and redelivery.
    pub dispatcher: DispatcherConfig,

    /// Mode used by the byte-level entry points. Default: async.
    pub default_mode: DispatchMode,

    /// Optional lifecycle observer.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            incoming_dir: INCOMING_DIR.to_string(),
            produced_dir: PRODUCED_DIR.to_string(),
            gc: GcConfig::default(),
            enable_gc: true,
            normalize: NormalizePolicy::default(),
            assemble: AssembleOptions::default(),
            convert_concurrency: 4,
            compression: CompressionPolicy::default(),
            backend: BackendSettings::default(),
            dispatcher: DispatcherConfig::default(),
            default_mode: DispatchMode::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("storage_root", &self.storage_root)
            .field("incoming_dir", &self.incoming_dir)
            .field("produced_dir", &self.produced_dir)
            .field("gc", &self.gc)
            .field("enable_gc", &self.enable_gc)
            .field("normalize", &self.normalize)
            .field("assemble", &self.assemble)
            .field("convert_concurrency", &self.convert_concurrency)
            .field("compression", &self.compression)
            .field("backend", &self.backend)
            .field("dispatcher", &self.dispatcher)
            .field("default_mode", &self.default_mode)
            .field(
                "progress_callback",
                &self
                    .progress_callback
                    .as_ref()
                    .map(|_| "<dyn JobProgressCallback>"),
            )
            .finish()
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.storage_root = root.into();
        self
    }

    pub fn incoming_dir(mut self, name: impl Into<String>) -> Self {
        self.config.incoming_dir = name.into();
        self
    }

    pub fn produced_dir(mut self, name: impl Into<String>) -> Self {
        self.config.produced_dir = name.into();
        self
    }

    pub fn ttl_secs(mut self, secs: u64) -> Self {
        self.config.gc.ttl = Duration::from_secs(secs.max(1));
        self
    }

    pub fn sweep_interval_secs(mut self, secs: u64) -> Self {
        self.config.gc.interval = Duration::from_secs(secs.max(1));
        self
    }

    pub fn enable_gc(mut self, v: bool) -> Self {
        self.config.enable_gc = v;
        self
    }

    pub fn color_mode(mut self, mode: ColorMode) -> Self {
        self.config.normalize.color = mode;
        self
    }

    pub fn page_policy(mut self, policy: PagePolicy) -> Self {
        self.config.normalize.page = policy;
        self
    }

    /// Page resolution in pixels per inch, clamped to 36–600.
    ///
    /// A page policy left at its default follows the new resolution, so the
    /// A4 canvas and the page size stay consistent.
    pub fn resolution(mut self, dpi: f32) -> Self {
        let dpi = if dpi.is_finite() { dpi.clamp(36.0, 600.0) } else { DEFAULT_RESOLUTION };
        if self.config.normalize.page == PagePolicy::fit_a4(self.config.assemble.resolution) {
            self.config.normalize.page = PagePolicy::fit_a4(dpi);
        }
        self.config.assemble.resolution = dpi;
        self
    }

    pub fn max_image_dimension(mut self, px: u32) -> Self {
        self.config.normalize.max_dimension = px.clamp(64, 20_000);
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.assemble.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn convert_concurrency(mut self, n: usize) -> Self {
        self.config.convert_concurrency = n.max(1);
        self
    }

    pub fn compression_policy(mut self, policy: CompressionPolicy) -> Self {
        self.config.compression = policy;
        self
    }

    pub fn compression_backends(mut self, backends: Vec<BackendKind>) -> Self {
        self.config.compression = CompressionPolicy::new(backends);
        self
    }

    pub fn ghostscript_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.backend.ghostscript_binary = path.into();
        self
    }

    pub fn external_timeout_secs(mut self, secs: u64) -> Self {
        self.config.backend.external_timeout = Duration::from_secs(secs.max(1));
        self
    }

    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.config.dispatcher.queue_name = name.into();
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.dispatcher.workers = n.max(1);
        self
    }

    pub fn soft_time_limit_secs(mut self, secs: u64) -> Self {
        self.config.dispatcher.soft_time_limit = Duration::from_secs(secs.max(1));
        self
    }

    pub fn hard_time_limit_secs(mut self, secs: u64) -> Self {
        self.config.dispatcher.hard_time_limit = Duration::from_secs(secs.max(1));
        self
    }

    pub fn max_jobs_per_worker(mut self, n: u64) -> Self {
        self.config.dispatcher.max_jobs_per_worker = n.max(1);
        self
    }

    pub fn max_redeliveries(mut self, n: u32) -> Self {
        self.config.dispatcher.max_redeliveries = n;
        self
    }

    pub fn dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.config.dispatcher = dispatcher;
        self
    }

    pub fn default_mode(mut self, mode: DispatchMode) -> Self {
        self.config.default_mode = mode;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, PdfToolsError> {
        let c = &self.config;
        if c.storage_root.as_os_str().is_empty() {
            return Err(PdfToolsError::InvalidConfig(
                "storage root must not be empty".into(),
            ));
        }
        if c.incoming_dir.is_empty()
            || c.produced_dir.is_empty()
            || c.incoming_dir == c.produced_dir
        {
            return Err(PdfToolsError::InvalidConfig(format!(
                "region directories must be distinct and non-empty, got '{}' and '{}'",
                c.incoming_dir, c.produced_dir
            )));
        }
        if c.backend.ghostscript_binary.as_os_str().is_empty() {
            return Err(PdfToolsError::InvalidConfig(
                "ghostscript binary must not be empty".into(),
            ));
        }
        c.normalize.page.validate()?;
        c.compression.validate()?;
        c.dispatcher.validate()?;
        c.gc.validate()?;
        Ok(self.config)
    }
}

/// Defaults as they appear in `--help` and in logs.
pub fn describe_defaults() -> String {
    format!(
        "ttl={}s sweep={}s resolution={} jpeg_quality={} max_dimension={} backends={} gs={} external_timeout={}s",
        DEFAULT_TTL.as_secs(),
        DEFAULT_SWEEP_INTERVAL.as_secs(),
        DEFAULT_RESOLUTION,
        DEFAULT_JPEG_QUALITY,
        DEFAULT_MAX_DIMENSION,
        CompressionPolicy::default(),
        DEFAULT_GHOSTSCRIPT_BINARY,
        DEFAULT_EXTERNAL_TIMEOUT.as_secs()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = ServiceConfig::builder().build().unwrap();
        assert_eq!(config.gc.ttl, Duration::from_secs(3600));
        assert_eq!(config.dispatcher.queue_name, "pdf_processing");
        assert_eq!(
            config.compression.backends,
            vec![BackendKind::Ghostscript, BackendKind::Restructure]
        );
        assert!(config.enable_gc);
    }

    #[test]
    fn setters_clamp() {
        let config = ServiceConfig::builder()
            .jpeg_quality(0)
            .workers(0)
            .convert_concurrency(0)
            .max_image_dimension(1)
            .resolution(10_000.0)
            .build()
            .unwrap();
        assert_eq!(config.assemble.jpeg_quality, 1);
        assert_eq!(config.dispatcher.workers, 1);
        assert_eq!(config.convert_concurrency, 1);
        assert_eq!(config.normalize.max_dimension, 64);
        assert_eq!(config.assemble.resolution, 600.0);
    }

    #[test]
    fn default_page_follows_resolution() {
        let config = ServiceConfig::builder().resolution(200.0).build().unwrap();
        assert_eq!(config.normalize.page, PagePolicy::fit_a4(200.0));

        let config = ServiceConfig::builder()
            .page_policy(PagePolicy::fill_a4())
            .resolution(200.0)
            .build()
            .unwrap();
        assert_eq!(config.normalize.page, PagePolicy::fill_a4());
    }

    #[test]
    fn hard_limit_below_soft_is_rejected() {
        let err = ServiceConfig::builder()
            .soft_time_limit_secs(300)
            .hard_time_limit_secs(60)
            .build()
            .unwrap_err();
        assert!(matches!(err, PdfToolsError::InvalidConfig(_)));
    }

    #[test]
    fn empty_backend_list_is_rejected() {
        let err = ServiceConfig::builder()
            .compression_backends(vec![])
            .build()
            .unwrap_err();
        assert!(matches!(err, PdfToolsError::InvalidConfig(_)));
    }

    #[test]
    fn zero_area_canvas_is_rejected() {
        let err = ServiceConfig::builder()
            .page_policy(PagePolicy::FillAndCrop {
                width: 0,
                height: 3508,
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, PdfToolsError::InvalidConfig(_)));

        let err = ServiceConfig::builder()
            .page_policy(PagePolicy::FitWithin {
                width: 800,
                height: 0,
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, PdfToolsError::InvalidConfig(_)));

        assert!(ServiceConfig::builder()
            .page_policy(PagePolicy::Original)
            .build()
            .is_ok());
    }

    #[test]
    fn same_region_dirs_are_rejected() {
        let err = ServiceConfig::builder()
            .incoming_dir("files")
            .produced_dir("files")
            .build()
            .unwrap_err();
        assert!(matches!(err, PdfToolsError::InvalidConfig(_)));
    }

    #[test]
    fn debug_hides_callback() {
        let config = ServiceConfig::builder()
            .progress_callback(std::sync::Arc::new(crate::progress::NoopProgressCallback))
            .build()
            .unwrap();
        assert!(format!("{config:?}").contains("<dyn JobProgressCallback>"));
    }
}
