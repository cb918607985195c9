//! Periodic reaper for timed-out sessions and idle tunnel connections
//!
//! Rebinding a local port after a peer disappears without a clean close can
//! fail indefinitely while the stale session still holds it, so eviction is
//! proactive: a background sweep on a fixed cadence bounds how long a stuck
//! resource can block reuse.
//!
//! The loop is fixed-delay, not fixed-rate: the next sweep is scheduled only
//! after the previous one fully completes, so sweeps never overlap or pile up
//! when a pass has many releases to perform.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Outcome of one sweep pass over one target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Resources examined during the pass
    pub examined: usize,
    /// Resources force-released during the pass
    pub evicted: usize,
}

/// A collection the reaper walks: the server's context registry or the
/// client's provider registry.
///
/// `sweep` sees the resources present at sweep start; anything created
/// mid-pass is picked up on the next one. Implementations isolate release
/// failures internally so one stuck resource never aborts the pass.
pub trait SweepTarget: Send + Sync {
    fn name(&self) -> &'static str;
    fn sweep(&self) -> SweepStats;
}

/// Fixed-delay scheduler driving the sweep as the process's long-lived
/// background task. The first pass runs immediately at start.
pub struct Reaper {
    delay: Duration,
    targets: Vec<Arc<dyn SweepTarget>>,
}

impl Reaper {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            targets: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: Arc<dyn SweepTarget>) -> Self {
        self.targets.push(target);
        self
    }

    /// One pass over every registered target
    pub fn sweep_once(&self) -> SweepStats {
        let mut total = SweepStats::default();
        for target in &self.targets {
            let stats = target.sweep();
            if stats.evicted > 0 {
                debug!(
                    target = target.name(),
                    examined = stats.examined,
                    evicted = stats.evicted,
                    "sweep pass complete"
                );
            }
            total.examined += stats.examined;
            total.evicted += stats.evicted;
        }
        total
    }

    /// Run forever with a fixed delay between passes
    pub async fn run(self) {
        loop {
            self.sweep_once();
            tokio::time::sleep(self.delay).await;
        }
    }

    /// Spawn the loop onto the runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
