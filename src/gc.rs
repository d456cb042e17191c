//! Time-based eviction of stale artifacts.
//!
//! Anything a crashed request, an abandoned caller or a killed worker left
//! behind is eventually removed here. Both regions are swept with the same
//! TTL. Sweeps run on the blocking pool, so a slow directory listing never
//! stalls request work, and a failed sweep is only logged.

use crate::error::PdfToolsError;
use crate::store::{ArtifactStore, Region};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Default artifact lifetime: one hour.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Default time between sweeps: thirty minutes.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcConfig {
    /// Artifacts older than this are deleted.
    pub ttl: Duration,
    /// Pause between two sweeps.
    pub interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl GcConfig {
    pub fn validate(&self) -> Result<(), PdfToolsError> {
        if self.ttl.is_zero() {
            return Err(PdfToolsError::InvalidConfig("gc ttl must be positive".into()));
        }
        if self.interval.is_zero() {
            return Err(PdfToolsError::InvalidConfig(
                "gc interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Counts from one pass over both regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub incoming: usize,
    pub produced: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.incoming + self.produced
    }
}

#[derive(Debug, Clone)]
pub struct GarbageCollector {
    store: ArtifactStore,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(store: ArtifactStore, config: GcConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Sweep both regions once.
    ///
    /// A region that cannot be listed is logged and counted as zero; the
    /// other region is still swept.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for region in [Region::Incoming, Region::Produced] {
            match self.store.sweep(region, self.config.ttl).await {
                Ok(n) => match region {
                    Region::Incoming => report.incoming = n,
                    Region::Produced => report.produced = n,
                },
                Err(e) => error!("Sweep of {} region failed: {}", region, e),
            }
        }
        if report.total() > 0 {
            info!(
                "Swept {} stale artifact(s) ({} incoming, {} produced)",
                report.total(),
                report.incoming,
                report.produced
            );
        } else {
            debug!("Sweep found nothing older than {}s", self.config.ttl.as_secs());
        }
        report
    }

    /// Run [`GarbageCollector::run_once`] every `interval` on its own task
    /// until the returned handle is stopped.
    ///
    /// The first sweep happens one interval after spawning.
    pub fn spawn(self) -> GcHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            info!(
                "Garbage collector running: ttl {}s, every {}s",
                self.config.ttl.as_secs(),
                self.config.interval.as_secs()
            );
            let start = tokio::time::Instant::now() + self.config.interval;
            let mut ticker = tokio::time::interval_at(start, self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
            debug!("Garbage collector stopped");
        });
        GcHandle { token, handle }
    }
}

/// Handle to a running collector.
#[derive(Debug)]
pub struct GcHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl GcHandle {
    /// Stop the collector and wait for an in-flight sweep to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!("Garbage collector task failed: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let c = GcConfig::default();
        assert_eq!(c.ttl, Duration::from_secs(3600));
        assert_eq!(c.interval, Duration::from_secs(1800));
        assert!(c.validate().is_ok());
        assert!(GcConfig {
            ttl: Duration::ZERO,
            ..c
        }
        .validate()
        .is_err());
    }

    #[tokio::test]
    async fn run_once_sweeps_both_regions() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let input = store.stage(b"abc".to_vec(), "png").await.unwrap().promote();
        let output = store.finalize(b"%PDF".to_vec()).await.unwrap().promote();

        let gc = GarbageCollector::new(
            store.clone(),
            GcConfig {
                ttl: Duration::from_millis(10),
                interval: Duration::from_secs(60),
            },
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = gc.run_once().await;

        assert_eq!(report, SweepReport { incoming: 1, produced: 1 });
        assert!(!store.exists(&input).await);
        assert!(!store.exists(&output).await);
    }

    #[tokio::test]
    async fn fresh_artifacts_survive() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let input = store.stage(b"abc".to_vec(), "png").await.unwrap().promote();

        let report = GarbageCollector::new(store.clone(), GcConfig::default())
            .run_once()
            .await;
        assert_eq!(report.total(), 0);
        assert!(store.exists(&input).await);
    }

    #[tokio::test]
    async fn spawned_collector_sweeps_and_stops() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let stale = store.stage(b"abc".to_vec(), "gif").await.unwrap().promote();

        let handle = GarbageCollector::new(
            store.clone(),
            GcConfig {
                ttl: Duration::from_millis(1),
                interval: Duration::from_millis(20),
            },
        )
        .spawn();
        assert!(handle.is_running());

        let deadline = SystemTime::now() + Duration::from_secs(5);
        while store.exists(&stale).await && SystemTime::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!store.exists(&stale).await);
        handle.stop().await;
    }
}
