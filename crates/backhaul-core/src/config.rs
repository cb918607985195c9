//! Timeout configuration consumed by the registries and the reaper

use std::time::Duration;

/// Delay between reaper sweeps (fixed delay, not fixed rate)
pub const DEFAULT_SWEEP_DELAY: Duration = Duration::from_secs(30);

/// Inactivity threshold after which a session is evicted
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(30);

/// Inactivity threshold after which a tunnel connection context is released
pub const DEFAULT_CONTEXT_IDLE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Pause between the end of one sweep and the start of the next
    pub sweep_delay: Duration,
    /// Session inactivity threshold
    pub session_idle: Duration,
    /// Context inactivity threshold; longer than the session one because a
    /// healthy tunnel only carries control traffic between pings
    pub context_idle: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            sweep_delay: DEFAULT_SWEEP_DELAY,
            session_idle: DEFAULT_SESSION_IDLE,
            context_idle: DEFAULT_CONTEXT_IDLE,
        }
    }
}
