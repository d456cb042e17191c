//! Job dispatch: inline on the caller's task, or on a named worker queue.
//!
//! ## Model
//!
//! ```text
//!  submit(Async) ──▶ [ unbounded mpsc: "pdf_processing" ] ──▶ worker 0..N
//!                          ▲                                    │
//!                          └──── redelivery after a panic ◀─────┘
//!  submit(Inline) ─────────────────────────────────────────▶ same attempt loop
//! ```
//!
//! Every attempt runs in its own spawned task, watched by the worker:
//!
//! * **soft limit**: the job's [`CancellationToken`] fires; the job body
//!   notices between stages and returns `Cancelled`.
//! * **hard limit**: the attempt task is aborted. Its future is dropped, so
//!   every [`StagedArtifact`] it held deletes its file and any child process
//!   spawned with `kill_on_drop` dies. Classified `TimedOut`.
//! * **panic**: treated as a worker crash: the job goes back on the queue
//!   (at-least-once) until `max_redeliveries` is exhausted.
//!
//! Workers retire after `max_jobs_per_worker` jobs; a supervisor task spawns
//! a fresh one in each retiree's place.
//!
//! ## Ordering guarantee
//!
//! When a job ends, its input artifacts are released *before* the terminal
//! status is published, so anyone who observes `Failed` or `Succeeded` can
//! rely on the inputs already being gone.

use crate::error::{ErrorKind, JobFailure, PdfToolsError};
use crate::job::{Job, JobExecutor, JobId, JobSpec, JobStatus};
use crate::progress::ProgressCallback;
use crate::store::{Artifact, StagedArtifact};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default logical queue name.
pub const DEFAULT_QUEUE: &str = "pdf_processing";

/// Dispatcher tuning. Constructed once and injected; there is no global
/// dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Logical queue name, used in logs.
    pub queue_name: String,
    /// Concurrent workers draining the queue. Default: 2.
    pub workers: usize,
    /// Cooperative cancellation deadline per attempt. Default: 240 s.
    pub soft_time_limit: Duration,
    /// Forced termination deadline per attempt. Default: 300 s.
    pub hard_time_limit: Duration,
    /// Jobs a worker handles before it is replaced. Default: 1000.
    pub max_jobs_per_worker: u64,
    /// Extra attempts granted to a job whose body panicked. Default: 3.
    pub max_redeliveries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE.to_string(),
            workers: 2,
            soft_time_limit: Duration::from_secs(240),
            hard_time_limit: Duration::from_secs(300),
            max_jobs_per_worker: 1000,
            max_redeliveries: 3,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), PdfToolsError> {
        if self.workers == 0 {
            return Err(PdfToolsError::InvalidConfig(
                "dispatcher needs at least one worker".into(),
            ));
        }
        if self.soft_time_limit.is_zero() {
            return Err(PdfToolsError::InvalidConfig(
                "soft time limit must be positive".into(),
            ));
        }
        if self.hard_time_limit < self.soft_time_limit {
            return Err(PdfToolsError::InvalidConfig(format!(
                "hard time limit ({}s) must not be shorter than the soft limit ({}s)",
                self.hard_time_limit.as_secs(),
                self.soft_time_limit.as_secs()
            )));
        }
        if self.max_jobs_per_worker == 0 {
            return Err(PdfToolsError::InvalidConfig(
                "max_jobs_per_worker must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Where a submitted job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// On the submitting task; `submit` returns once the job is terminal.
    Inline,
    /// On the worker queue; `submit` returns immediately.
    #[default]
    Async,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Inline => f.write_str("inline"),
            DispatchMode::Async => f.write_str("async"),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = PdfToolsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" | "sync" => Ok(DispatchMode::Inline),
            "async" | "queue" => Ok(DispatchMode::Async),
            other => Err(PdfToolsError::InvalidConfig(format!(
                "unknown dispatch mode '{other}' (expected inline or async)"
            ))),
        }
    }
}

// ── Job handle ───────────────────────────────────────────────────────────

/// Caller-side view of a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    status: watch::Receiver<JobStatus>,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Current status snapshot.
    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    /// Ask the job to stop. The job still releases everything it created.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the job is terminal.
    ///
    /// On success the output artifact belongs to the caller, who must
    /// release it (or leave it to the garbage collector).
    pub async fn wait(&self) -> Result<Artifact, JobFailure> {
        let mut rx = self.status.clone();
        let terminal = rx
            .wait_for(JobStatus::is_terminal)
            .await
            .map(|status| status.clone())
            .map_err(|_| JobFailure {
                kind: ErrorKind::Internal,
                message: format!("job {} was dropped by the dispatcher", self.id),
            })?;
        match terminal {
            JobStatus::Succeeded { output } => Ok(output),
            JobStatus::Failed { failure } => Err(failure),
            other => Err(JobFailure {
                kind: ErrorKind::Internal,
                message: format!("job {} ended in non-terminal state {other:?}", self.id),
            }),
        }
    }

    /// Like [`JobHandle::wait`], but give up after `timeout`.
    ///
    /// Giving up cancels the job. Should it succeed anyway, its output is
    /// deleted as soon as it appears, since nobody is left to collect it.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Artifact, JobFailure> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Gave up waiting for job {} after {}s", self.id, timeout.as_secs());
                self.cancel();
                let mut rx = self.status.clone();
                tokio::spawn(async move {
                    let terminal = rx.wait_for(JobStatus::is_terminal).await.map(|s| s.clone());
                    if let Ok(JobStatus::Succeeded { output }) = terminal {
                        if let Err(e) = tokio::fs::remove_file(&output.path).await {
                            if e.kind() != std::io::ErrorKind::NotFound {
                                warn!(
                                    "Failed to delete abandoned output {}: {}",
                                    output.path.display(),
                                    e
                                );
                            }
                        }
                    }
                });
                let err = PdfToolsError::TimedOut {
                    job: self.id.to_string(),
                    secs: timeout.as_secs(),
                };
                Err(JobFailure::from(&err))
            }
        }
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────────

/// Aborts an attempt task when its watcher is dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A job travelling through the queue, together with everything needed to
/// finish it.
struct Envelope {
    spec: JobSpec,
    inputs: Vec<StagedArtifact>,
    status: watch::Sender<JobStatus>,
    cancel: CancellationToken,
}

/// Result of one attempt.
enum Attempt {
    Done(Result<StagedArtifact, PdfToolsError>),
    Redeliver,
}

enum WorkerExit {
    Retired,
    QueueClosed,
}

struct Shared {
    config: DispatcherConfig,
    executor: Arc<dyn JobExecutor>,
    progress: Option<ProgressCallback>,
    queue: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    requeue: mpsc::WeakUnboundedSender<Envelope>,
    closed: AtomicBool,
    workers_started: AtomicUsize,
}

/// Runs jobs inline or through the worker queue.
pub struct TaskDispatcher {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("config", &self.shared.config)
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl TaskDispatcher {
    /// Validate `config` and start the workers. Must be called inside a
    /// Tokio runtime.
    pub fn start(
        config: DispatcherConfig,
        executor: Arc<dyn JobExecutor>,
        progress: Option<ProgressCallback>,
    ) -> Result<Arc<Self>, PdfToolsError> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            requeue: tx.downgrade(),
            config,
            executor,
            progress,
            queue: Mutex::new(rx),
            closed: AtomicBool::new(false),
            workers_started: AtomicUsize::new(0),
        });

        let mut workers = JoinSet::new();
        for _ in 0..shared.config.workers {
            spawn_worker(&mut workers, &shared);
        }
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), workers));

        info!(
            "Dispatcher started: queue '{}', {} worker(s), soft {}s / hard {}s",
            shared.config.queue_name,
            shared.config.workers,
            shared.config.soft_time_limit.as_secs(),
            shared.config.hard_time_limit.as_secs()
        );
        Ok(Arc::new(Self {
            shared,
            sender: Mutex::new(Some(tx)),
            supervisor: Mutex::new(Some(supervisor)),
        }))
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// Workers spawned so far, including replacements.
    pub fn workers_started(&self) -> usize {
        self.shared.workers_started.load(Ordering::SeqCst)
    }

    /// Submit a staged job.
    ///
    /// In [`DispatchMode::Inline`] the job has already finished when this
    /// returns. In [`DispatchMode::Async`] it is queued.
    ///
    /// # Errors
    /// [`PdfToolsError::Internal`] after [`TaskDispatcher::shutdown`]; the
    /// job's inputs are released.
    pub async fn submit(&self, job: Job, mode: DispatchMode) -> Result<JobHandle, PdfToolsError> {
        let spec = job.spec();
        let (status_tx, status_rx) = watch::channel(JobStatus::Pending);
        let cancel = CancellationToken::new();
        let handle = JobHandle {
            id: spec.id,
            status: status_rx,
            cancel: cancel.clone(),
        };
        let envelope = Envelope {
            spec,
            inputs: job.inputs,
            status: status_tx,
            cancel,
        };

        if let Some(ref cb) = self.shared.progress {
            cb.on_job_queued(handle.id, envelope.spec.kind.name());
        }

        match mode {
            DispatchMode::Inline => {
                debug!("Running job {} inline", handle.id);
                let mut envelope = envelope;
                loop {
                    match self.shared.attempt(&envelope).await {
                        Attempt::Done(result) => {
                            self.shared.complete(envelope, result).await;
                            break;
                        }
                        Attempt::Redeliver => envelope.spec.attempt += 1,
                    }
                }
            }
            DispatchMode::Async => {
                let sender = self.sender.lock().await;
                let Some(sender) = sender.as_ref() else {
                    return Err(PdfToolsError::Internal("dispatcher is shut down".into()));
                };
                sender
                    .send(envelope)
                    .map_err(|_| PdfToolsError::Internal("dispatcher queue is closed".into()))?;
                debug!("Queued job {} on '{}'", handle.id, self.shared.config.queue_name);
            }
        }
        Ok(handle)
    }

    /// Stop accepting jobs, let the workers drain the queue, and wait for
    /// them to exit.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        drop(self.sender.lock().await.take());
        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                error!("Dispatcher supervisor failed: {}", e);
            }
        }
        info!("Dispatcher '{}' stopped", self.shared.config.queue_name);
    }
}

fn spawn_worker(workers: &mut JoinSet<WorkerExit>, shared: &Arc<Shared>) {
    let n = shared.workers_started.fetch_add(1, Ordering::SeqCst);
    workers.spawn(worker_loop(n, Arc::clone(shared)));
}

/// Keep the worker count steady until the queue closes.
async fn supervise(shared: Arc<Shared>, mut workers: JoinSet<WorkerExit>) {
    while let Some(exit) = workers.join_next().await {
        match exit {
            Ok(WorkerExit::QueueClosed) => {}
            Ok(WorkerExit::Retired) => spawn_worker(&mut workers, &shared),
            Err(e) => {
                error!("Worker crashed: {}", e);
                if !shared.closed.load(Ordering::SeqCst) {
                    spawn_worker(&mut workers, &shared);
                }
            }
        }
    }
    debug!("All workers of '{}' exited", shared.config.queue_name);
}

async fn worker_loop(n: usize, shared: Arc<Shared>) -> WorkerExit {
    debug!("Worker {} started on '{}'", n, shared.config.queue_name);
    let mut handled: u64 = 0;
    loop {
        let next = shared.queue.lock().await.recv().await;
        let Some(envelope) = next else {
            debug!("Worker {} exiting: queue closed", n);
            return WorkerExit::QueueClosed;
        };

        match shared.attempt(&envelope).await {
            Attempt::Done(result) => shared.complete(envelope, result).await,
            Attempt::Redeliver => shared.redeliver(envelope).await,
        }

        handled += 1;
        if handled >= shared.config.max_jobs_per_worker {
            info!("Worker {} retiring after {} job(s)", n, handled);
            return WorkerExit::Retired;
        }
    }
}

impl Shared {
    /// Run one attempt under the soft and hard limits.
    async fn attempt(&self, envelope: &Envelope) -> Attempt {
        let spec = envelope.spec.clone();
        let id = spec.id;
        let attempt = spec.attempt;
        let _ = envelope.status.send(JobStatus::Running { attempt });
        if let Some(ref cb) = self.progress {
            cb.on_job_start(id, attempt);
        }

        let executor = Arc::clone(&self.executor);
        let token = envelope.cancel.clone();
        let task = tokio::spawn(async move { executor.execute(&spec, &token).await });

        // Whoever awaits this attempt owns the limits. If that future is
        // dropped (an inline caller gone away), the attempt goes with it.
        let _abort_on_drop = AbortOnDrop(task.abort_handle());
        let cancel_on_drop = envelope.cancel.clone().drop_guard();
        let outcome = self.watch(envelope, task, id, attempt).await;
        let _ = cancel_on_drop.disarm();
        outcome
    }

    /// Race the attempt task against the soft and hard limits.
    async fn watch(
        &self,
        envelope: &Envelope,
        mut task: JoinHandle<Result<StagedArtifact, PdfToolsError>>,
        id: JobId,
        attempt: u32,
    ) -> Attempt {
        let soft = tokio::time::sleep(self.config.soft_time_limit);
        let hard = tokio::time::sleep(self.config.hard_time_limit);
        tokio::pin!(soft);
        tokio::pin!(hard);
        let mut soft_fired = false;

        let joined = loop {
            tokio::select! {
                joined = &mut task => break Some(joined),
                _ = &mut soft, if !soft_fired => {
                    soft_fired = true;
                    warn!(
                        "Job {} exceeded soft limit of {}s, cancelling",
                        id,
                        self.config.soft_time_limit.as_secs()
                    );
                    envelope.cancel.cancel();
                }
                _ = &mut hard => break None,
            }
        };

        let joined = match joined {
            Some(joined) => joined,
            None => {
                error!(
                    "Job {} exceeded hard limit of {}s, terminating",
                    id,
                    self.config.hard_time_limit.as_secs()
                );
                envelope.cancel.cancel();
                task.abort();
                // Wait for the abort so the attempt's guards have run.
                let _ = task.await;
                return Attempt::Done(Err(PdfToolsError::TimedOut {
                    job: id.to_string(),
                    secs: self.config.hard_time_limit.as_secs(),
                }));
            }
        };

        match joined {
            Ok(Ok(output)) if envelope.cancel.is_cancelled() => {
                // Finished, but too late: the caller already moved on.
                output.release().await;
                Attempt::Done(Err(PdfToolsError::Cancelled {
                    job: id.to_string(),
                }))
            }
            Ok(result) => Attempt::Done(result),
            Err(e) if e.is_panic() => {
                if attempt <= self.config.max_redeliveries && !envelope.cancel.is_cancelled() {
                    warn!("Job {} panicked on attempt {}, redelivering", id, attempt);
                    Attempt::Redeliver
                } else {
                    Attempt::Done(Err(PdfToolsError::Internal(format!(
                        "job panicked on attempt {attempt}; no redeliveries left"
                    ))))
                }
            }
            Err(e) => Attempt::Done(Err(PdfToolsError::Internal(format!(
                "job task failed: {e}"
            )))),
        }
    }

    /// Put a crashed job back on the queue with its attempt bumped.
    async fn redeliver(&self, mut envelope: Envelope) {
        envelope.spec.attempt += 1;
        let _ = envelope.status.send(JobStatus::Pending);
        let Some(sender) = self.requeue.upgrade() else {
            let err = PdfToolsError::Internal("dispatcher shut down before redelivery".into());
            self.complete(envelope, Err(err)).await;
            return;
        };
        if let Err(mpsc::error::SendError(envelope)) = sender.send(envelope) {
            let err = PdfToolsError::Internal("dispatcher queue closed before redelivery".into());
            self.complete(envelope, Err(err)).await;
        }
    }

    /// Release inputs, then publish the terminal status.
    async fn complete(&self, envelope: Envelope, result: Result<StagedArtifact, PdfToolsError>) {
        let Envelope {
            spec,
            inputs,
            status,
            ..
        } = envelope;

        for input in inputs {
            input.release().await;
        }

        // An output that vanished before it could be handed over is a failure.
        let result = match result {
            Ok(output) => {
                let present = tokio::fs::metadata(output.path()).await;
                match present {
                    Ok(_) => Ok(output),
                    Err(e) => Err(PdfToolsError::io(output.path(), e)),
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(output) => {
                let artifact = output.promote();
                if let Some(ref cb) = self.progress {
                    cb.on_job_complete(spec.id, artifact.size);
                }
                if let Err(watch::error::SendError(JobStatus::Succeeded { output })) =
                    status.send(JobStatus::Succeeded { output: artifact })
                {
                    // Every handle is gone; nobody will ever collect this.
                    debug!("Job {} finished unobserved, releasing output", spec.id);
                    if let Err(e) = tokio::fs::remove_file(&output.path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(
                                "Failed to delete unobserved output {}: {}",
                                output.path.display(),
                                e
                            );
                        }
                    }
                }
            }
            Err(e) => {
                let failure = JobFailure::from(&e);
                if e.kind().is_client_error() {
                    info!("Job {} rejected: {}", spec.id, e);
                } else {
                    warn!("Job {} failed: {}", spec.id, e);
                }
                if let Some(ref cb) = self.progress {
                    cb.on_job_error(spec.id, &failure);
                }
                let _ = status.send(JobStatus::Failed { failure });
            }
        }
    }
}
