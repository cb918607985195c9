//! Client-side service providers and the process-wide provider registry
//!
//! A [`ServiceProvider`] fronts one exposed local service and owns the
//! sessions multiplexed under it. The [`ProviderRegistry`] is the shared map
//! the client reaper walks; it is handed to the reaper and to the tunnel
//! handler by constructor injection.

use crate::config::TimeoutConfig;
use crate::reaper::{SweepStats, SweepTarget};
use crate::session::Session;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One exposed local service and the sessions currently flowing through it
pub struct ServiceProvider {
    /// Route key this provider serves
    route_key: String,
    /// Local service address (e.g., "localhost:3000")
    local_addr: String,
    sessions: DashMap<String, Arc<Session>>,
}

impl ServiceProvider {
    pub fn new(route_key: impl Into<String>, local_addr: impl Into<String>) -> Self {
        Self {
            route_key: route_key.into(),
            local_addr: local_addr.into(),
            sessions: DashMap::new(),
        }
    }

    pub fn route_key(&self) -> &str {
        &self.route_key
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Track a newly established proxied stream
    pub fn register_session(&self, session: Arc<Session>) {
        debug!(
            route_key = %self.route_key,
            session_id = %session.id(),
            "session opened"
        );
        self.sessions.insert(session.id().to_string(), session);
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// Refresh a session's inactivity clock; unknown ids are ignored (the
    /// session may have been evicted between the data event and this call)
    pub fn session_data_observed(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            session.touch();
        }
    }

    /// Close a session immediately on normal stream closure, independent of
    /// the reaper
    pub fn session_closed(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.close();
        }
    }

    /// Cascade-close every session; used when the owning route is removed
    pub fn shutdown(&self) -> usize {
        let mut closed = 0;
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                if session.close() {
                    closed += 1;
                }
            }
        }
        closed
    }

    /// Evict sessions idle past the threshold; each close is isolated
    fn evict_timed_out(&self, threshold: std::time::Duration, stats: &mut SweepStats) {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .inspect(|_| stats.examined += 1)
            .filter(|entry| entry.value().is_timed_out(threshold))
            .map(|entry| entry.key().clone())
            .collect();

        for session_id in stale {
            if let Some((_, session)) = self.sessions.remove(&session_id) {
                info!(
                    route_key = %self.route_key,
                    session_id = %session_id,
                    "releasing session, timed out"
                );
                session.close();
                stats.evicted += 1;
            }
        }
    }
}

/// Process-wide map of providers, keyed by route key
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<ServiceProvider>>,
    timeouts: TimeoutConfig,
}

impl ProviderRegistry {
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self {
            providers: DashMap::new(),
            timeouts,
        }
    }

    /// Register a provider for a route; lives as long as the route stays
    /// registered
    pub fn register(&self, provider: Arc<ServiceProvider>) {
        self.providers
            .insert(provider.route_key().to_string(), provider);
    }

    /// Remove a provider and cascade-close its sessions
    pub fn unregister(&self, route_key: &str) -> Option<Arc<ServiceProvider>> {
        let (_, provider) = self.providers.remove(route_key)?;
        let closed = provider.shutdown();
        debug!(route_key, closed, "service provider unregistered");
        Some(provider)
    }

    pub fn get(&self, route_key: &str) -> Option<Arc<ServiceProvider>> {
        self.providers.get(route_key).map(|e| e.value().clone())
    }

    pub fn count(&self) -> usize {
        self.providers.len()
    }
}

impl SweepTarget for ProviderRegistry {
    fn name(&self) -> &'static str {
        "sessions"
    }

    fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        for provider in self.providers.iter() {
            provider.evict_timed_out(self.timeouts.session_idle, &mut stats);
        }
        stats
    }
}
