//! CLI binary for pdftools.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ServiceConfig`, runs one job and writes the result.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pdftools::config::describe_defaults;
use pdftools::{
    ColorMode, CompressionPolicy, CompressionProfile, DispatchMode, JobFailure, JobId,
    JobProgressCallback, JobRequest, PagePolicy, PdfTools, ProfileColorMode, ProgressCallback,
    ServiceConfig,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner that counts processed inputs while a job runs.
struct CliProgressCallback {
    bar: ProgressBar,
    total: usize,
    done: AtomicUsize,
}

impl CliProgressCallback {
    fn new(verb: &str, total: usize) -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style =
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix(verb.to_string());
        bar.set_message("queued");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            total,
            done: AtomicUsize::new(0),
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl JobProgressCallback for CliProgressCallback {
    fn on_job_start(&self, _job: JobId, attempt: u32) {
        if attempt > 1 {
            self.bar.set_message(format!("retrying (attempt {attempt})"));
        } else {
            self.bar.set_message("running");
        }
    }

    fn on_item_complete(&self, _job: JobId, _index: usize, _total: usize) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        self.bar.set_message(format!("{done}/{} input(s)", self.total));
    }

    fn on_job_error(&self, _job: JobId, failure: &JobFailure) {
        self.bar.println(format!("  {} {}", red("✗"), failure));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Scans to one PDF, one page per image, in argument order
  pdftools convert page1.jpg page2.png page3.jpg -o scans.pdf

  # Grayscale, border-free A4 pages
  pdftools convert --color grayscale --fill *.jpg -o scans.pdf

  # Merge documents
  pdftools merge a.pdf b.pdf c.pdf -o all.pdf

  # Compress for e-mail
  pdftools compress big.pdf -o small.pdf --dpi 96 --quality 60 --color gray

  # Compress without Ghostscript
  pdftools compress big.pdf -o small.pdf --backends resample,restructure

  # Delete stale artifacts once, or keep sweeping until Ctrl-C
  pdftools sweep --ttl 600
  pdftools gc

ENVIRONMENT VARIABLES:
  PDFTOOLS_STORAGE_ROOT       Directory holding incoming/ and produced/
  PDFTOOLS_WORKERS            Dispatcher worker count
  PDFTOOLS_MODE               inline or async
  PDFTOOLS_TTL                Artifact lifetime in seconds
  PDFTOOLS_SWEEP_INTERVAL     Seconds between sweeps (gc)
  PDFTOOLS_SOFT_LIMIT         Soft time limit per job in seconds
  PDFTOOLS_HARD_LIMIT         Hard time limit per job in seconds
  PDFTOOLS_BACKENDS           Compression backend order
  PDFTOOLS_GS                 Ghostscript executable
  PDFTOOLS_EXTERNAL_TIMEOUT   Ghostscript timeout in seconds
  RUST_LOG                    Overrides --verbose/--quiet log filtering
"#;

/// Convert images to PDF, merge and compress PDF documents.
#[derive(Parser, Debug)]
#[command(
    name = "pdftools",
    version,
    about = "Convert images to PDF, merge and compress PDF documents",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    service: ServiceArgs,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDFTOOLS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDFTOOLS_QUIET")]
    quiet: bool,

    /// Disable the progress spinner.
    #[arg(long, global = true, env = "PDFTOOLS_NO_PROGRESS")]
    no_progress: bool,

    /// Print a JSON summary on stdout instead of the human-readable line.
    #[arg(long, global = true, env = "PDFTOOLS_JSON")]
    json: bool,
}

#[derive(Args, Debug)]
struct ServiceArgs {
    /// Directory holding the incoming/ and produced/ regions.
    #[arg(long, global = true, env = "PDFTOOLS_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    /// Worker tasks draining the job queue.
    #[arg(long, global = true, env = "PDFTOOLS_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Run jobs inline or through the worker queue.
    #[arg(long, global = true, env = "PDFTOOLS_MODE", default_value = "inline")]
    mode: DispatchMode,

    /// Artifact lifetime in seconds.
    #[arg(long, global = true, env = "PDFTOOLS_TTL", default_value_t = 3600)]
    ttl: u64,

    /// Seconds between two sweeps of the collector.
    #[arg(long, global = true, env = "PDFTOOLS_SWEEP_INTERVAL", default_value_t = 1800)]
    sweep_interval: u64,

    /// Soft time limit per job in seconds; the job is cancelled.
    #[arg(long, global = true, env = "PDFTOOLS_SOFT_LIMIT", default_value_t = 240)]
    soft_limit: u64,

    /// Hard time limit per job in seconds; the job is terminated.
    #[arg(long, global = true, env = "PDFTOOLS_HARD_LIMIT", default_value_t = 300)]
    hard_limit: u64,

    /// Ghostscript executable.
    #[arg(long, global = true, env = "PDFTOOLS_GS", default_value = "gs")]
    gs: PathBuf,

    /// Ghostscript timeout in seconds.
    #[arg(long, global = true, env = "PDFTOOLS_EXTERNAL_TIMEOUT", default_value_t = 120)]
    external_timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Combine images into one PDF, one page per image.
    Convert {
        /// Images (jpg, jpeg, png, gif, bmp) in page order.
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Output PDF.
        #[arg(short, long)]
        output: PathBuf,

        /// Page colour model.
        #[arg(long, value_enum, default_value = "rgb")]
        color: ColorArg,

        /// Cover the A4 page and crop the overflow instead of fitting within it.
        #[arg(long)]
        fill: bool,

        /// Page resolution in pixels per inch.
        #[arg(long, default_value_t = 100.0)]
        resolution: f32,

        /// JPEG quality for colour and grayscale pages (1–100).
        #[arg(long, default_value_t = 92)]
        jpeg_quality: u8,
    },

    /// Concatenate two or more PDFs.
    Merge {
        /// Documents in output order.
        #[arg(required = true, num_args = 2..)]
        documents: Vec<PathBuf>,

        /// Output PDF.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Make a PDF smaller.
    Compress {
        /// Document to compress.
        input: PathBuf,

        /// Output PDF.
        #[arg(short, long)]
        output: PathBuf,

        /// Target image resolution (72–300).
        #[arg(long, default_value_t = 144)]
        dpi: u32,

        /// JPEG quality (10–100).
        #[arg(long, default_value_t = 75)]
        quality: u8,

        /// no-change, grayscale or monochrome.
        #[arg(long, default_value = "no-change")]
        color: ProfileColorMode,

        /// Backend order, e.g. ghostscript,restructure.
        #[arg(long, env = "PDFTOOLS_BACKENDS")]
        backends: Option<CompressionPolicy>,
    },

    /// Delete artifacts older than the TTL once and exit.
    Sweep,

    /// Run the garbage collector in the foreground until Ctrl-C.
    Gc,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ColorArg {
    Rgb,
    Grayscale,
    Monochrome,
}

impl From<ColorArg> for ColorMode {
    fn from(v: ColorArg) -> Self {
        match v {
            ColorArg::Rgb => ColorMode::Rgb,
            ColorArg::Grayscale => ColorMode::Grayscale,
            ColorArg::Monochrome => ColorMode::Monochrome,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner is the feedback in normal runs; library INFO logs would
    // tear it apart.
    let show_progress =
        !cli.quiet && !cli.no_progress && !cli.json && !matches!(cli.command, Command::Gc);
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Convert {
            ref images,
            ref output,
            color,
            fill,
            resolution,
            jpeg_quality,
        } => {
            let mut inputs = Vec::with_capacity(images.len());
            for path in images {
                inputs.push((read_input(path).await?, extension_of(path)?));
            }
            let progress = spinner(show_progress, "Converting", inputs.len());
            let mut builder = service_builder(&cli.service, progress.clone())
                .color_mode(color.into())
                .resolution(resolution)
                .jpeg_quality(jpeg_quality);
            if fill {
                builder = builder.page_policy(PagePolicy::fill_a4());
            }
            let config = builder.build().context("Invalid configuration")?;
            run_job(&cli, config, JobRequest::convert(inputs), output, progress).await
        }

        Command::Merge {
            ref documents,
            ref output,
        } => {
            let mut inputs = Vec::with_capacity(documents.len());
            for path in documents {
                inputs.push(read_input(path).await?);
            }
            let progress = spinner(show_progress, "Merging", inputs.len());
            let config = service_builder(&cli.service, progress.clone())
                .build()
                .context("Invalid configuration")?;
            run_job(&cli, config, JobRequest::merge(inputs), output, progress).await
        }

        Command::Compress {
            ref input,
            ref output,
            dpi,
            quality,
            color,
            ref backends,
        } => {
            let profile = CompressionProfile::new(dpi, quality, color);
            profile.validate().context("Invalid compression profile")?;
            let document = read_input(input).await?;
            let progress = spinner(show_progress, "Compressing", 1);
            let mut builder = service_builder(&cli.service, progress.clone());
            if let Some(policy) = backends {
                builder = builder.compression_policy(policy.clone());
            }
            let config = builder.build().context("Invalid configuration")?;
            run_job(&cli, config, JobRequest::compress(document, profile), output, progress).await
        }

        Command::Sweep => {
            let config = service_builder(&cli.service, None)
                .build()
                .context("Invalid configuration")?;
            let tools = PdfTools::start(config).await.context("Failed to start service")?;
            let report = tools.sweep().await;
            tools.shutdown().await;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("Failed to serialise report")?
                );
            } else if !cli.quiet {
                eprintln!(
                    "{} removed {} artifact(s)  {}",
                    green("✔"),
                    bold(&report.total().to_string()),
                    dim(&format!("({} incoming, {} produced)", report.incoming, report.produced)),
                );
            }
            Ok(())
        }

        Command::Gc => {
            let config = service_builder(&cli.service, None)
                .enable_gc(true)
                .build()
                .context("Invalid configuration")?;
            let tools = PdfTools::start(config).await.context("Failed to start service")?;
            if !cli.quiet {
                eprintln!(
                    "Collecting artifacts older than {}s every {}s; Ctrl-C to stop  {}",
                    cli.service.ttl,
                    cli.service.sweep_interval,
                    dim(&describe_defaults()),
                );
            }
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            tools.shutdown().await;
            Ok(())
        }
    }
}

/// Map the shared flags onto a config builder. One-shot commands do not
/// need the background collector.
fn service_builder(
    args: &ServiceArgs,
    progress: Option<Arc<CliProgressCallback>>,
) -> pdftools::ServiceConfigBuilder {
    let root = args
        .storage_root
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("pdftools"));
    let mut builder = ServiceConfig::builder()
        .storage_root(root)
        .workers(args.workers)
        .default_mode(args.mode)
        .ttl_secs(args.ttl)
        .sweep_interval_secs(args.sweep_interval)
        .soft_time_limit_secs(args.soft_limit)
        .hard_time_limit_secs(args.hard_limit)
        .ghostscript_binary(args.gs.clone())
        .external_timeout_secs(args.external_timeout)
        .enable_gc(false);
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb as ProgressCallback);
    }
    builder
}

fn spinner(show: bool, verb: &str, total: usize) -> Option<Arc<CliProgressCallback>> {
    show.then(|| CliProgressCallback::new(verb, total))
}

async fn run_job(
    cli: &Cli,
    config: ServiceConfig,
    request: JobRequest,
    output: &Path,
    progress: Option<Arc<CliProgressCallback>>,
) -> Result<()> {
    let start = Instant::now();
    let input_bytes: usize = request.inputs.iter().map(|i| i.bytes.len()).sum();
    let tools = PdfTools::start(config).await.context("Failed to start service")?;

    let result = tools.run(request, cli.service.mode).await;
    if let Some(ref p) = progress {
        p.finish();
    }
    let result = match result {
        Ok(artifact) => {
            let written = write_output(&tools, &artifact, output).await;
            if let Err(e) = tools.store().release(&artifact).await {
                tracing::warn!("Failed to release {}: {}", artifact.id, e);
            }
            written.map(|()| artifact)
        }
        Err(e) => Err(anyhow::Error::new(e).context("Job failed")),
    };
    tools.shutdown().await;
    let artifact = result?;
    let size = artifact.size;

    if cli.json {
        let summary = serde_json::json!({
            "output": output,
            "input_bytes": input_bytes,
            "output_bytes": size,
            "artifact": artifact.id,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    } else if !cli.quiet {
        eprintln!(
            "{}  {} → {}  {}ms  →  {}",
            green("✔"),
            dim(&human_bytes(input_bytes as u64)),
            dim(&human_bytes(size)),
            start.elapsed().as_millis(),
            bold(&output.display().to_string()),
        );
    }
    Ok(())
}

/// Copy the produced artifact to `output` atomically: a temp file in the
/// destination directory, renamed into place.
async fn write_output(
    tools: &PdfTools,
    artifact: &pdftools::Artifact,
    output: &Path,
) -> Result<()> {
    let bytes = tools
        .store()
        .read(artifact)
        .await
        .context("Failed to read produced document")?;
    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&bytes).context("Failed to write output")?;
        tmp.persist(&output)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        Ok(())
    })
    .await
    .context("Output writer panicked")?
}

async fn read_input(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

fn extension_of(path: &Path) -> Result<String> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => Ok(ext.to_string()),
        _ => bail!("{} has no file extension; cannot tell its format", path.display()),
    }
}

fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
