//! Backhaul relay (server)
//!
//! Accepts outward tunnel connections from agents, tracks the routes they
//! register, and runs the reaper that reclaims idle connections. Inbound
//! public traffic is matched to a route by key and handed to the data plane.

use anyhow::Result;
use backhaul_core::{
    ConnectionContext, ContextRegistry, Reaper, ReleaseFailure, ReleaseHook, RouteDescriptor,
    TimeoutConfig,
};
use backhaul_proto::{ControlMessage, ControlResponse, IpGate, RouteAck};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Backhaul relay - accepts tunnel connections and routes public traffic
#[derive(Parser, Debug)]
#[command(name = "backhaul-relay")]
#[command(about = "Run a reverse tunnel relay server", long_about = None)]
struct Args {
    /// Tunnel control port for agent connections
    #[arg(long, default_value = "0.0.0.0:4440")]
    control_addr: String,

    /// Allowed peer IPs or CIDR ranges (repeatable); empty allows all
    #[arg(long = "allow")]
    allowlist: Vec<String>,

    /// Denied peer IPs or CIDR ranges (repeatable); deny wins over allow
    #[arg(long = "deny")]
    denylist: Vec<String>,

    /// Seconds between reaper sweeps
    #[arg(long, default_value = "30")]
    sweep_delay_secs: u64,

    /// Seconds of silence before a tunnel connection is force-released
    #[arg(long, default_value = "120")]
    context_idle_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "BACKHAUL_LOG")]
    log_level: String,
}

/// Data-plane hook for a registered route. The real listener teardown lives
/// in the forwarding layer; the control plane only guarantees when it runs.
struct RouteRelease {
    route_key: String,
}

impl ReleaseHook for RouteRelease {
    fn release(&self) -> Result<(), ReleaseFailure> {
        debug!(route_key = %self.route_key, "route bindings released");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let gate = IpGate::from_rules(args.allowlist.clone(), args.denylist.clone())
        .map_err(|e| anyhow::anyhow!("invalid ip gate rule: {}", e))?;

    let timeouts = TimeoutConfig {
        sweep_delay: Duration::from_secs(args.sweep_delay_secs),
        context_idle: Duration::from_secs(args.context_idle_secs),
        ..Default::default()
    };

    let registry = Arc::new(ContextRegistry::new(gate, timeouts));

    let reaper_handle = Reaper::new(timeouts.sweep_delay)
        .with_target(registry.clone())
        .spawn();

    let listener = TcpListener::bind(&args.control_addr).await?;
    info!("Tunnel control listening on {}", args.control_addr);
    info!("Press Ctrl+C to stop");

    let accept_registry = registry.clone();
    let accept_handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let context = match accept_registry.connection_established(peer) {
                        Ok(context) => context,
                        // Denied peers are logged by the registry; just drop
                        Err(_) => continue,
                    };
                    let registry = accept_registry.clone();
                    tokio::spawn(async move {
                        let context_id = context.id().to_string();
                        if let Err(e) = handle_connection(stream, context, registry.clone()).await {
                            debug!(context_id = %context_id, error = %e, "control connection ended");
                        }
                        registry.connection_lost(&context_id);
                    });
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                }
            }
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping relay..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    accept_handle.abort();
    reaper_handle.abort();
    info!("Relay stopped");

    Ok(())
}

/// Drive one agent's control connection until it disconnects.
///
/// The caller owns the disconnect path: whatever way this returns, the
/// context is released exactly once via `connection_lost`.
async fn handle_connection(
    stream: TcpStream,
    context: Arc<ConnectionContext>,
    registry: Arc<ContextRegistry>,
) -> Result<()> {
    let peer = stream.peer_addr()?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            // A reaper-forced release must also drop the socket and end this
            // task; a half-open connection would otherwise block in the read
            // below forever
            _ = context.wait_closed() => {
                debug!(context_id = %context.id(), "context released, closing control connection");
                return Ok(());
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: ControlMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %peer, error = %e, "unparseable control message");
                continue;
            }
        };

        context.touch();

        let response = match message {
            ControlMessage::Hello { agent_name } => {
                info!(peer = %peer, agent_name = %agent_name, "agent hello");
                ControlResponse::HelloAck {
                    context_id: context.id().to_string(),
                }
            }
            ControlMessage::AddRoutes { candidates } => {
                let descriptors: Vec<RouteDescriptor> = candidates
                    .iter()
                    .map(|c| {
                        RouteDescriptor::from_candidate(
                            c,
                            Arc::new(RouteRelease {
                                route_key: c.route_key.clone(),
                            }),
                        )
                    })
                    .collect();
                let acks = registry
                    .request_add_routes(context.id(), descriptors)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "add routes failed");
                        candidates
                            .iter()
                            .map(|c| RouteAck::rejected(&c.route_key, "unknown connection"))
                            .collect()
                    });
                ControlResponse::RouteAcks { acks }
            }
            ControlMessage::RemoveRoutes { candidates } => {
                let acks = registry
                    .request_remove_routes(context.id(), &candidates)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "remove routes failed");
                        candidates
                            .iter()
                            .map(|c| RouteAck::rejected(&c.route_key, "unknown connection"))
                            .collect()
                    });
                ControlResponse::RouteAcks { acks }
            }
            ControlMessage::Ping { timestamp } => ControlResponse::Pong { timestamp },
        };

        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
    }

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
