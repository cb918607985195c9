//! Live proxied TCP data streams and their inactivity clock

use crate::release::{run_release, ReleaseHook};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One proxied TCP stream flowing through an established route.
///
/// The data plane calls [`Session::touch`] for every byte transferred; the
/// reaper evicts sessions whose clock has gone stale. `touch` is lock-free so
/// the hot path never contends with a sweep.
pub struct Session {
    id: String,
    epoch: Instant,
    /// Milliseconds since `epoch` at the last observed activity
    last_activity_ms: AtomicU64,
    closed: AtomicBool,
    release: Arc<dyn ReleaseHook>,
}

impl Session {
    pub fn new(release: Arc<dyn ReleaseHook>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            release,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refresh the inactivity clock; called on every transferred byte
    pub fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last observed activity
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Pure function of (now − last activity) against the threshold
    pub fn is_timed_out(&self, threshold: Duration) -> bool {
        self.idle_for() >= threshold
    }

    /// Close the session and free its data-plane resources.
    ///
    /// The release hook runs exactly once no matter how many callers race
    /// here; a closed session holds no socket or buffer resources. Returns
    /// whether this call performed the close.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        run_release(&self.release, "session", &self.id);
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::{CountingRelease, NoopRelease};

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_pure_over_elapsed_time() {
        let session = Session::new(Arc::new(NoopRelease));
        let threshold = Duration::from_secs(30);

        assert!(!session.is_timed_out(threshold));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!session.is_timed_out(threshold));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(session.is_timed_out(threshold));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_clock() {
        let session = Session::new(Arc::new(NoopRelease));
        let threshold = Duration::from_secs(30);

        tokio::time::advance(Duration::from_secs(25)).await;
        session.touch();
        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(!session.is_timed_out(threshold));
        assert_eq!(session.idle_for(), Duration::from_secs(25));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(session.is_timed_out(threshold));
    }

    #[test]
    fn test_close_releases_exactly_once() {
        let hook = CountingRelease::new();
        let session = Session::new(hook.clone());

        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());
        assert_eq!(hook.count(), 1);
    }

    #[test]
    fn test_concurrent_close_releases_once() {
        let hook = CountingRelease::new();
        let session = Arc::new(Session::new(hook.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || session.close())
            })
            .collect();

        let performed: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(performed, 1);
        assert_eq!(hook.count(), 1);
    }
}
