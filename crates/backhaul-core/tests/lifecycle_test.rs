//! End-to-end lifecycle tests: route churn, disconnect cascade, and the
//! reaper reclaiming idle connections and stale sessions.

use backhaul_core::release::CountingRelease;
use backhaul_core::{
    ContextRegistry, ProviderRegistry, Reaper, RouteDescriptor, ServiceProvider, Session,
    TimeoutConfig,
};
use backhaul_proto::{IpGate, RouteCandidate};
use std::sync::Arc;
use std::time::Duration;

fn descriptor(key: &str, hook: Arc<CountingRelease>) -> RouteDescriptor {
    RouteDescriptor::from_candidate(&RouteCandidate::new(key, "localhost:3000"), hook)
}

#[test]
fn route_churn_scenario() {
    let registry = ContextRegistry::new(IpGate::allow_all(), TimeoutConfig::default());
    let ctx = registry
        .connection_established("203.0.113.10:41000".parse().unwrap())
        .unwrap();
    let hook = CountingRelease::new();

    // Start with {a, b}
    let acks = registry
        .request_add_routes(
            ctx.id(),
            vec![descriptor("a", hook.clone()), descriptor("b", hook.clone())],
        )
        .unwrap();
    assert!(acks.iter().all(|a| a.accepted));

    // add([b, c]): b rejected as duplicate, c accepted
    let acks = registry
        .request_add_routes(
            ctx.id(),
            vec![descriptor("b", hook.clone()), descriptor("c", hook.clone())],
        )
        .unwrap();
    assert!(!acks[0].accepted);
    assert!(acks[1].accepted);
    assert_eq!(ctx.route_count(), 3);

    // remove([a]): registry = {b, c}, release hook ran once
    let acks = registry
        .request_remove_routes(ctx.id(), &[RouteCandidate::new("a", "")])
        .unwrap();
    assert!(acks[0].accepted);
    assert_eq!(ctx.route_count(), 2);
    assert_eq!(hook.count(), 1);
    assert!(ctx.has_route("b"));
    assert!(ctx.has_route("c"));

    // release(): empty and closed; releasing again is a no-op
    assert_eq!(ctx.release(), 2);
    assert_eq!(hook.count(), 3);
    assert_eq!(ctx.release(), 0);
    assert_eq!(hook.count(), 3);
}

#[test]
fn disconnect_cascade_releases_all_routes() {
    let registry = ContextRegistry::new(IpGate::allow_all(), TimeoutConfig::default());
    let ctx = registry
        .connection_established("203.0.113.10:41000".parse().unwrap())
        .unwrap();
    let hook = CountingRelease::new();

    registry
        .request_add_routes(
            ctx.id(),
            vec![descriptor("a", hook.clone()), descriptor("b", hook.clone())],
        )
        .unwrap();

    assert_eq!(registry.connection_lost(ctx.id()), 2);
    assert_eq!(hook.count(), 2);
    assert!(ctx.is_closed());

    // The context is gone; a second disconnect for the same id is a no-op
    assert_eq!(registry.connection_lost(ctx.id()), 0);
    assert_eq!(hook.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn reaper_reclaims_idle_context_and_stale_sessions() {
    let timeouts = TimeoutConfig {
        sweep_delay: Duration::from_secs(30),
        session_idle: Duration::from_secs(30),
        context_idle: Duration::from_secs(120),
    };

    let contexts = Arc::new(ContextRegistry::new(IpGate::allow_all(), timeouts));
    let providers = Arc::new(ProviderRegistry::new(timeouts));

    let idle_ctx = contexts
        .connection_established("203.0.113.10:41000".parse().unwrap())
        .unwrap();
    let live_ctx = contexts
        .connection_established("203.0.113.11:41000".parse().unwrap())
        .unwrap();
    let route_hook = CountingRelease::new();
    contexts
        .request_add_routes(idle_ctx.id(), vec![descriptor("web", route_hook.clone())])
        .unwrap();

    let provider = Arc::new(ServiceProvider::new("web", "localhost:3000"));
    providers.register(provider.clone());
    let session_hook = CountingRelease::new();
    let session = Arc::new(Session::new(session_hook.clone()));
    provider.register_session(session);

    let reaper = Reaper::new(timeouts.sweep_delay)
        .with_target(contexts.clone())
        .with_target(providers.clone());

    // Stands in for the connection handler parked on its half-open socket:
    // a reaper-forced release must wake it so the task and stream go away
    let handler_parked = tokio::spawn({
        let ctx = idle_ctx.clone();
        async move { ctx.wait_closed().await }
    });
    tokio::task::yield_now().await;

    // Just past the session threshold: session goes, contexts stay
    tokio::time::advance(Duration::from_secs(31)).await;
    live_ctx.touch();
    reaper.sweep_once();
    assert_eq!(session_hook.count(), 1);
    assert_eq!(provider.session_count(), 0);
    assert_eq!(contexts.count(), 2);

    // Past the context threshold: the silent context is force-released,
    // the one that kept pinging survives
    tokio::time::advance(Duration::from_secs(90)).await;
    live_ctx.touch();
    reaper.sweep_once();
    assert_eq!(contexts.count(), 1);
    assert!(idle_ctx.is_closed());
    assert!(!live_ctx.is_closed());
    assert_eq!(route_hook.count(), 1);

    tokio::time::timeout(Duration::from_secs(5), handler_parked)
        .await
        .expect("sweep release must wake the connection handler")
        .unwrap();
}

#[tokio::test]
async fn contexts_do_not_contend_across_connections() {
    // Progress check: heavy churn on one context never blocks another.
    let registry = Arc::new(ContextRegistry::new(
        IpGate::allow_all(),
        TimeoutConfig::default(),
    ));
    let a = registry
        .connection_established("203.0.113.10:41000".parse().unwrap())
        .unwrap();
    let b = registry
        .connection_established("203.0.113.11:41000".parse().unwrap())
        .unwrap();

    let mut handles = Vec::new();
    for ctx in [a.clone(), b.clone()] {
        let registry = registry.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            for i in 0..500 {
                let key = format!("route-{i}");
                let hook = CountingRelease::new();
                let acks = registry
                    .request_add_routes(ctx.id(), vec![descriptor(&key, hook.clone())])
                    .unwrap();
                assert!(acks[0].accepted);
                registry
                    .request_remove_routes(ctx.id(), &[RouteCandidate::new(&key, "")])
                    .unwrap();
                assert_eq!(hook.count(), 1);
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(a.route_count(), 0);
    assert_eq!(b.route_count(), 0);
}
