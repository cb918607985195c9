//! Process-wide registry of live connection contexts
//!
//! Shared between the accept path, the per-connection control handlers and
//! the reaper, all of which receive the same `Arc<ContextRegistry>` at
//! construction time. The map supports concurrent iteration during a sweep
//! while contexts are added and removed on other threads.

use crate::config::TimeoutConfig;
use crate::context::{ConnectionContext, RouteDescriptor};
use crate::error::ControlError;
use crate::reaper::{SweepStats, SweepTarget};
use backhaul_proto::{IpGate, RouteAck, RouteCandidate};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ContextRegistry {
    contexts: DashMap<String, Arc<ConnectionContext>>,
    gate: IpGate,
    timeouts: TimeoutConfig,
}

impl ContextRegistry {
    pub fn new(gate: IpGate, timeouts: TimeoutConfig) -> Self {
        Self {
            contexts: DashMap::new(),
            gate,
            timeouts,
        }
    }

    /// Admit a freshly accepted tunnel connection.
    ///
    /// The peer address is checked against the IP gate first; a denied peer
    /// never gets a context. On success the context is registered under its
    /// generated id and returned for the connection handler to drive.
    pub fn connection_established(
        &self,
        peer: SocketAddr,
    ) -> Result<Arc<ConnectionContext>, ControlError> {
        if !self.gate.is_socket_allowed(&peer) {
            warn!(peer = %peer, "tunnel connection refused by ip gate");
            return Err(ControlError::PeerDenied(peer.ip()));
        }

        let context = Arc::new(ConnectionContext::new(peer));
        info!(
            context_id = %context.id(),
            peer = %peer,
            "tunnel connection established"
        );
        self.contexts
            .insert(context.id().to_string(), context.clone());
        Ok(context)
    }

    /// Handle loss of the underlying connection.
    ///
    /// Matching is by context identity (the id generated at accept), never by
    /// address: multiple contexts may share a peer IP. An unknown id is a
    /// warning and a no-op. Returns how many routes the cascade released.
    pub fn connection_lost(&self, context_id: &str) -> usize {
        match self.contexts.remove(context_id) {
            Some((_, context)) => {
                let released = context.release();
                info!(
                    context_id,
                    peer_ip = %context.peer_ip(),
                    connected_at = %context.connected_at(),
                    released,
                    "tunnel connection lost"
                );
                released
            }
            None => {
                warn!(context_id, "disconnect for unknown connection context");
                0
            }
        }
    }

    pub fn get(&self, context_id: &str) -> Option<Arc<ConnectionContext>> {
        self.contexts.get(context_id).map(|e| e.value().clone())
    }

    /// Route an add-routes request to the owning context
    pub fn request_add_routes(
        &self,
        context_id: &str,
        candidates: Vec<RouteDescriptor>,
    ) -> Result<Vec<RouteAck>, ControlError> {
        let context = self.get(context_id).ok_or_else(|| {
            warn!(context_id, "add routes for unknown connection context");
            ControlError::UnknownContext(context_id.to_string())
        })?;
        context.touch();
        Ok(context.add_routes(candidates))
    }

    /// Route a remove-routes request to the owning context
    pub fn request_remove_routes(
        &self,
        context_id: &str,
        candidates: &[RouteCandidate],
    ) -> Result<Vec<RouteAck>, ControlError> {
        let context = self.get(context_id).ok_or_else(|| {
            warn!(context_id, "remove routes for unknown connection context");
            ControlError::UnknownContext(context_id.to_string())
        })?;
        context.touch();
        Ok(context.remove_routes(candidates))
    }

    /// Find the context currently serving a route key, if any
    pub fn find_route(&self, route_key: &str) -> Option<Arc<ConnectionContext>> {
        self.contexts
            .iter()
            .find(|entry| entry.value().has_route(route_key))
            .map(|entry| entry.value().clone())
    }

    pub fn count(&self) -> usize {
        self.contexts.len()
    }
}

impl SweepTarget for ContextRegistry {
    fn name(&self) -> &'static str {
        "contexts"
    }

    /// Evict contexts that have been silent past the idle threshold.
    ///
    /// This is the path that reclaims routes when a peer vanishes without a
    /// clean close: the event-driven `connection_lost` never fires, so the
    /// sweep has to force the cascade.
    fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();

        let stale: Vec<String> = self
            .contexts
            .iter()
            .inspect(|_| stats.examined += 1)
            .filter(|entry| entry.value().idle_for() >= self.timeouts.context_idle)
            .map(|entry| entry.key().clone())
            .collect();

        for context_id in stale {
            if let Some((_, context)) = self.contexts.remove(&context_id) {
                info!(
                    context_id = %context_id,
                    peer_ip = %context.peer_ip(),
                    connected_at = %context.connected_at(),
                    "releasing idle tunnel connection"
                );
                context.release();
                stats.evicted += 1;
            }
        }

        stats
    }
}
