//! Periodic garbage collection of idle limiters.

use chrono::Local;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use super::trie::{GcReport, RateLimiterTrie};
use crate::config::RateLimitingConfig;
use crate::error::{PathguardError, Result};

/// Runs [`RateLimiterTrie::gc`] on a fixed interval.
///
/// Each cycle runs on the blocking pool. A cycle that panics is logged and
/// the loop carries on with the next interval.
pub struct Reclaimer {
    trie: Arc<RateLimiterTrie>,
    config: RateLimitingConfig,
}

impl Reclaimer {
    /// Create a reclaimer for `trie`.
    ///
    /// The trie prunes with its own staleness threshold, so `config` must
    /// carry the same value; build the trie with
    /// [`RateLimiterTrie::from_config`] to keep them in step.
    pub fn new(trie: Arc<RateLimiterTrie>, config: RateLimitingConfig) -> Result<Self> {
        config.validate()?;
        if config.staleness_threshold() != trie.staleness_threshold() {
            return Err(PathguardError::Config(format!(
                "staleness_threshold_ms is {} but the trie prunes after {}ms",
                config.staleness_threshold_ms,
                trie.staleness_threshold().as_millis()
            )));
        }
        Ok(Self { trie, config })
    }

    /// Start the loop on the current tokio runtime.
    pub fn spawn(self) -> ReclaimerHandle {
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let task = tokio::spawn(self.run(stop_rx));
        ReclaimerHandle { stop_tx, task }
    }

    /// Run cycles until a shutdown signal arrives.
    ///
    /// The first cycle starts one full interval after the call. Shutdown is
    /// only observed between cycles, so a running cycle always finishes its
    /// root swap.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.gc_interval();
        info!(
            interval_ms = self.config.gc_interval_ms,
            snapshot_enabled = self.config.snapshot_enabled,
            snapshot_path = %self.config.snapshot_path,
            "Rate limiter reclaimer starting"
        );

        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.recv() => {
                    info!("Rate limiter reclaimer received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Run a single isolated garbage collection cycle now.
    ///
    /// Returns `None` if the cycle did not complete.
    pub async fn run_cycle(&self) -> Option<GcReport> {
        let trie = self.trie.clone();
        let write_snapshot = self.config.snapshot_enabled;
        let target = self.config.snapshot_path_for(Local::now());

        isolate(move || trie.gc(write_snapshot, &target)).await
    }
}

/// Run `f` on the blocking pool, turning a panic into `None`.
async fn isolate<F, T>(f: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match task::spawn_blocking(f).await {
        Ok(value) => Some(value),
        Err(e) if e.is_panic() => {
            error!(error = %e, "Rate limiter GC cycle panicked, continuing");
            None
        }
        Err(e) => {
            warn!(error = %e, "Rate limiter GC cycle was cancelled");
            None
        }
    }
}

/// Handle to a spawned [`Reclaimer`].
pub struct ReclaimerHandle {
    stop_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ReclaimerHandle {
    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "Rate limiter reclaimer task failed");
        }
    }
}
