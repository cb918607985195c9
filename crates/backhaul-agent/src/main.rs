//! Backhaul agent (client)
//!
//! Connects outward to a relay, registers local services under route keys,
//! and keeps the client-side provider registry alive. The agent's reaper
//! prunes timed-out sessions so local ports can always be rebound, even when
//! the far side vanished without a close.

use anyhow::{bail, Context, Result};
use backhaul_core::{ProviderRegistry, Reaper, ServiceProvider, TimeoutConfig};
use backhaul_proto::{ControlMessage, ControlResponse, RouteCandidate};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Backhaul agent - exposes local services through a relay
#[derive(Parser, Debug)]
#[command(name = "backhaul-agent")]
#[command(about = "Expose local TCP services through a backhaul relay", long_about = None)]
struct Args {
    /// Relay control address
    #[arg(long, default_value = "127.0.0.1:4440")]
    relay_addr: String,

    /// Name reported to the relay
    #[arg(long, default_value = "backhaul-agent")]
    agent_name: String,

    /// Route to expose, as key=host:port (repeatable)
    #[arg(long = "route", required = true)]
    routes: Vec<String>,

    /// Seconds between keepalive pings
    #[arg(long, default_value = "10")]
    ping_interval_secs: u64,

    /// Seconds between reaper sweeps
    #[arg(long, default_value = "30")]
    sweep_delay_secs: u64,

    /// Seconds of inactivity before a session is evicted
    #[arg(long, default_value = "30")]
    session_idle_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "BACKHAUL_LOG")]
    log_level: String,
}

/// Parse a `key=host:port` route flag
fn parse_route(raw: &str) -> Result<RouteCandidate> {
    let (key, addr) = raw
        .split_once('=')
        .with_context(|| format!("route '{}' is not key=host:port", raw))?;
    if key.is_empty() || addr.is_empty() {
        bail!("route '{}' is not key=host:port", raw);
    }
    Ok(RouteCandidate::new(key, addr))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let candidates = args
        .routes
        .iter()
        .map(|r| parse_route(r))
        .collect::<Result<Vec<_>>>()?;

    let timeouts = TimeoutConfig {
        sweep_delay: Duration::from_secs(args.sweep_delay_secs),
        session_idle: Duration::from_secs(args.session_idle_secs),
        ..Default::default()
    };
    let providers = Arc::new(ProviderRegistry::new(timeouts));

    let reaper_handle = Reaper::new(timeouts.sweep_delay)
        .with_target(providers.clone())
        .spawn();

    info!("Connecting to relay at {}", args.relay_addr);
    let stream = TcpStream::connect(&args.relay_addr)
        .await
        .with_context(|| format!("cannot reach relay at {}", args.relay_addr))?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    send(
        &mut writer,
        &ControlMessage::Hello {
            agent_name: args.agent_name.clone(),
        },
    )
    .await?;
    let context_id = match recv(&mut lines).await? {
        ControlResponse::HelloAck { context_id } => context_id,
        other => bail!("expected HelloAck, relay sent {:?}", other),
    };
    info!(context_id = %context_id, "registered with relay");

    send(
        &mut writer,
        &ControlMessage::AddRoutes {
            candidates: candidates.clone(),
        },
    )
    .await?;
    let acks = match recv(&mut lines).await? {
        ControlResponse::RouteAcks { acks } => acks,
        other => bail!("expected RouteAcks, relay sent {:?}", other),
    };

    let mut accepted = 0;
    for (ack, candidate) in acks.iter().zip(&candidates) {
        if ack.accepted {
            providers.register(Arc::new(ServiceProvider::new(
                &candidate.route_key,
                &candidate.target_addr,
            )));
            info!(
                route_key = %ack.route_key,
                target = %candidate.target_addr,
                "route registered"
            );
            accepted += 1;
        } else {
            warn!(
                route_key = %ack.route_key,
                reason = ack.reason.as_deref().unwrap_or("unknown"),
                "route rejected by relay"
            );
        }
    }
    if accepted == 0 {
        bail!("relay rejected every route");
    }

    info!("Press Ctrl+C to stop");
    let mut ping = tokio::time::interval(Duration::from_secs(args.ping_interval_secs));
    let mut timestamp = 0u64;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received, removing routes...");
                let remove = ControlMessage::RemoveRoutes { candidates: candidates.clone() };
                if let Err(e) = send(&mut writer, &remove).await {
                    warn!(error = %e, "could not remove routes on shutdown");
                }
                break;
            }
            _ = ping.tick() => {
                timestamp += 1;
                send(&mut writer, &ControlMessage::Ping { timestamp }).await?;
            }
            line = lines.next_line() => {
                match line? {
                    // Pongs and late acks both just prove the relay is alive
                    Some(_) => {}
                    None => {
                        warn!("relay closed the control connection");
                        break;
                    }
                }
            }
        }
    }

    reaper_handle.abort();
    info!("Agent stopped");
    Ok(())
}

async fn send(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    message: &ControlMessage,
) -> Result<()> {
    let mut payload = serde_json::to_string(message)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;
    Ok(())
}

async fn recv(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
) -> Result<ControlResponse> {
    let line = lines
        .next_line()
        .await?
        .context("relay closed the control connection")?;
    Ok(serde_json::from_str(&line)?)
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
