//! Connection context and per-connection route registry
//!
//! A [`ConnectionContext`] owns exactly one tunnel connection and the set of
//! routes registered over it. All structural mutation of the registry (add,
//! remove, cascade release) is serialized under one mutex scoped to the
//! context instance, so route churn on unrelated connections never contends.

use crate::error::ControlError;
use crate::release::{run_release, ReleaseHook};
use backhaul_proto::{RouteAck, RouteCandidate};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error};

/// A single registered mapping from a route key to a client-side service.
///
/// The identifier is assigned by the registry at insertion time; anything the
/// client proposed is discarded. The context back-reference is the owning
/// context's id, a non-owning lookup handle: a descriptor never keeps its
/// context alive.
#[derive(Clone)]
pub struct RouteDescriptor {
    id: String,
    route_key: String,
    target_addr: String,
    owner_ip: IpAddr,
    context_id: String,
    release: Arc<dyn ReleaseHook>,
}

impl RouteDescriptor {
    /// Build a descriptor from a client candidate and the data-plane hook
    /// that will free its bindings on release. The id, owner IP and context
    /// back-reference are placeholders until the registry admits it.
    pub fn from_candidate(candidate: &RouteCandidate, release: Arc<dyn ReleaseHook>) -> Self {
        Self {
            id: String::new(),
            route_key: candidate.route_key.clone(),
            target_addr: candidate.target_addr.clone(),
            owner_ip: IpAddr::from([0, 0, 0, 0]),
            context_id: String::new(),
            release,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn route_key(&self) -> &str {
        &self.route_key
    }

    pub fn target_addr(&self) -> &str {
        &self.target_addr
    }

    pub fn owner_ip(&self) -> IpAddr {
        self.owner_ip
    }

    /// Id of the owning connection context
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    fn release_resources(&self) {
        run_release(&self.release, "route", &self.route_key);
    }
}

impl std::fmt::Debug for RouteDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteDescriptor")
            .field("id", &self.id)
            .field("route_key", &self.route_key)
            .field("target_addr", &self.target_addr)
            .field("owner_ip", &self.owner_ip)
            .field("context_id", &self.context_id)
            .finish()
    }
}

/// Lifecycle state of a connection context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Live,
    Closed,
}

struct ContextInner {
    state: ContextState,
    routes: Vec<RouteDescriptor>,
}

/// One client's tunnel connection and its registered routes.
///
/// The peer address is captured when the connection is accepted and is
/// immutable afterwards. Once the context transitions to `Closed` the
/// registry is empty and stays empty: further add/remove calls are no-ops.
pub struct ConnectionContext {
    id: String,
    peer_ip: IpAddr,
    peer_port: u16,
    connected_at: chrono::DateTime<chrono::Utc>,
    last_seen: Mutex<Instant>,
    inner: Mutex<ContextInner>,
    shutdown: Notify,
}

impl ConnectionContext {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer_ip: peer.ip(),
            peer_port: peer.port(),
            connected_at: chrono::Utc::now(),
            last_seen: Mutex::new(Instant::now()),
            inner: Mutex::new(ContextInner {
                state: ContextState::Live,
                routes: Vec::new(),
            }),
            shutdown: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    pub fn connected_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ContextState {
        self.inner.lock().unwrap().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ContextState::Closed
    }

    /// Refresh the liveness clock; called for every control message
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    /// Time since the last control message was observed
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_seen.lock().unwrap().elapsed()
    }

    pub fn route_count(&self) -> usize {
        self.inner.lock().unwrap().routes.len()
    }

    pub fn has_route(&self, route_key: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .routes
            .iter()
            .any(|r| r.route_key == route_key)
    }

    /// Snapshot of the registered routes
    pub fn routes(&self) -> Vec<RouteDescriptor> {
        self.inner.lock().unwrap().routes.clone()
    }

    /// Register a batch of routes on this connection.
    ///
    /// Candidates are admitted in order. A candidate whose route key is
    /// already present, either from an earlier call or earlier in this same
    /// batch, is rejected and logged; it leaves no trace in the registry.
    /// Accepted descriptors get a fresh server-assigned id, the peer's IP as
    /// owner, and this context as back-reference.
    ///
    /// Returns one ack per candidate, in batch order.
    pub fn add_routes(&self, candidates: Vec<RouteDescriptor>) -> Vec<RouteAck> {
        let mut inner = self.inner.lock().unwrap();

        if inner.state == ContextState::Closed {
            debug!(context_id = %self.id, "add_routes on closed context is a no-op");
            return candidates
                .iter()
                .map(|c| RouteAck::rejected(&c.route_key, ControlError::ContextClosed.to_string()))
                .collect();
        }

        let mut present: HashSet<String> = inner
            .routes
            .iter()
            .map(|r| r.route_key.clone())
            .collect();

        let mut acks = Vec::with_capacity(candidates.len());
        for mut candidate in candidates {
            candidate.owner_ip = self.peer_ip;

            if present.contains(&candidate.route_key) {
                error!(
                    route_key = %candidate.route_key,
                    peer_ip = %self.peer_ip,
                    "route key already registered, rejecting candidate"
                );
                acks.push(RouteAck::rejected(
                    &candidate.route_key,
                    ControlError::DuplicateRouteKey(candidate.route_key.clone()).to_string(),
                ));
                continue;
            }

            candidate.id = uuid::Uuid::new_v4().to_string();
            candidate.context_id = self.id.clone();
            present.insert(candidate.route_key.clone());
            acks.push(RouteAck::accepted(&candidate.route_key));
            inner.routes.push(candidate);
        }

        acks
    }

    /// Unregister routes by key.
    ///
    /// Matching is by route key value only, scanning this context's own
    /// registry; the server-assigned id is not required. Detached descriptors
    /// have their release hooks invoked before the call returns, failures
    /// logged per descriptor.
    pub fn remove_routes(&self, candidates: &[RouteCandidate]) -> Vec<RouteAck> {
        let wanted: HashSet<&str> = candidates.iter().map(|c| c.route_key.as_str()).collect();

        let mut inner = self.inner.lock().unwrap();

        if inner.state == ContextState::Closed {
            debug!(context_id = %self.id, "remove_routes on closed context is a no-op");
            return candidates
                .iter()
                .map(|c| RouteAck::rejected(&c.route_key, ControlError::ContextClosed.to_string()))
                .collect();
        }

        let mut removed: HashSet<String> = HashSet::new();
        let mut keep = Vec::with_capacity(inner.routes.len());
        for route in inner.routes.drain(..) {
            if wanted.contains(route.route_key.as_str()) {
                route.release_resources();
                removed.insert(route.route_key);
            } else {
                keep.push(route);
            }
        }
        inner.routes = keep;

        candidates
            .iter()
            .map(|c| {
                if removed.contains(&c.route_key) {
                    RouteAck::accepted(&c.route_key)
                } else {
                    RouteAck::rejected(&c.route_key, "no such route")
                }
            })
            .collect()
    }

    /// Resolves once this context has been released.
    ///
    /// The connection handler parks here alongside its read loop so that a
    /// reaper-forced release also tears down the control connection and its
    /// task, not just the routes. Resolves immediately on a closed context.
    pub async fn wait_closed(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        // Register before checking state so a release between the check and
        // the await cannot be missed
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Cascade-release every owned route and close the registry.
    ///
    /// Safe to call more than once, including concurrently: the descriptors
    /// are taken out under the lock exactly once, so each release hook runs
    /// exactly once in total. Returns how many routes were released.
    pub fn release(&self) -> usize {
        let routes = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ContextState::Closed {
                return 0;
            }
            inner.state = ContextState::Closed;
            std::mem::take(&mut inner.routes)
        };
        self.shutdown.notify_waiters();

        debug!(
            peer_ip = %self.peer_ip,
            context_id = %self.id,
            count = routes.len(),
            "unregistering routes for closed tunnel"
        );

        for route in &routes {
            route.release_resources();
        }
        routes.len()
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("peer_ip", &self.peer_ip)
            .field("peer_port", &self.peer_port)
            .field("state", &self.state())
            .finish()
    }
}
