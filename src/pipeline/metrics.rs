//! Progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for one run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Instances handed to a worker
    pub dispatched: AtomicU64,

    /// Instances that completed successfully (including cached)
    pub succeeded: AtomicU64,

    /// Instances satisfied from the completion journal
    pub cached: AtomicU64,

    /// Instances that failed
    pub failed: AtomicU64,

    /// Instances that can never run
    pub skipped: AtomicU64,

    /// CPU tokens granted, summed over dispatched instances
    pub cpus_requested: AtomicU64,

    /// Wall time spent in external processes (milliseconds, summed)
    pub process_ms: AtomicU64,

    start_time: Option<Instant>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record a dispatched instance and its CPU grant.
    pub fn add_dispatched(&self, cpus: usize) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.cpus_requested.fetch_add(cpus as u64, Ordering::Relaxed);
    }

    pub fn add_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// A cached instance also counts as succeeded.
    pub fn add_cached(&self) {
        self.cached.fetch_add(1, Ordering::Relaxed);
        self.add_succeeded();
    }

    pub fn add_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_process_time(&self, duration: Duration) {
        self.process_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            cpus_requested: self.cpus_requested.load(Ordering::Relaxed),
            process_secs: self.process_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            elapsed: self.elapsed(),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub dispatched: u64,
    pub succeeded: u64,
    pub cached: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cpus_requested: u64,
    /// Summed wall time of external processes
    pub process_secs: f64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Instances in a terminal state.
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.skipped
    }

    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path.display());
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Instances: {} dispatched, {} succeeded ({} cached), {} failed, {} skipped | \
             Process time: {:.1}s | Elapsed: {:.1}s",
            self.dispatched,
            self.succeeded,
            self.cached,
            self.failed,
            self.skipped,
            self.process_secs,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic progress reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_instances: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_instances: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
            total_instances,
        }
    }

    fn progress(&self, snapshot: &MetricsSnapshot) -> f64 {
        if self.total_instances > 0 {
            snapshot.finished() as f64 / self.total_instances as f64 * 100.0
        } else {
            0.0
        }
    }

    /// Log progress every interval until `shutdown` fires.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("[{:.1}%] {}", self.progress(&snapshot), snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Instances: {}", self.total_instances);
        println!("Dispatched: {}", snapshot.dispatched);
        println!("Succeeded: {} ({} from journal)", snapshot.succeeded, snapshot.cached);
        println!("Failed: {}", snapshot.failed);
        println!("Skipped: {}", snapshot.skipped);
        println!("CPU tokens granted: {}", snapshot.cpus_requested);
        println!("External process time: {:.1}s", snapshot.process_secs);
        println!("========================\n");
    }
}
