//! Release hook seam between the control plane and the data plane
//!
//! The control plane decides *when* a route or session dies; the data plane
//! owns the sockets, listeners and buffers that must actually be freed. It
//! plugs in here.

use crate::error::ReleaseFailure;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::error;

/// Implemented by the data-plane/OS-socket layer to free bound ports,
/// sockets and buffers when a route or session is released.
///
/// Implementations must be non-blocking and bounded-time: the hook can run
/// while a registry lock is held.
pub trait ReleaseHook: Send + Sync {
    fn release(&self) -> Result<(), ReleaseFailure>;
}

/// Hook for resources with nothing to free
#[derive(Debug, Default)]
pub struct NoopRelease;

impl ReleaseHook for NoopRelease {
    fn release(&self) -> Result<(), ReleaseFailure> {
        Ok(())
    }
}

/// Run a hook, logging a failure instead of propagating it.
///
/// A stuck socket must not prevent the rest of a batch or sweep from being
/// reclaimed, so the error stops here.
pub(crate) fn run_release(hook: &Arc<dyn ReleaseHook>, kind: &str, name: &str) {
    if let Err(e) = hook.release() {
        error!(kind, name, error = %e, "resource release failed");
    }
}

/// Test hook that counts invocations and can be told to fail
#[derive(Debug, Default)]
pub struct CountingRelease {
    released: AtomicUsize,
    fail: bool,
}

impl CountingRelease {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            released: AtomicUsize::new(0),
            fail: true,
        })
    }

    pub fn count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl ReleaseHook for CountingRelease {
    fn release(&self) -> Result<(), ReleaseFailure> {
        self.released.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ReleaseFailure("simulated release failure".to_string()));
        }
        Ok(())
    }
}
