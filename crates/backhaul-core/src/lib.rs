//! Backhaul control-plane core
//!
//! Tracks which routes exist, which tunnel connection backs them, and when
//! they must die. The server side keeps one [`ConnectionContext`] per client
//! tunnel with its per-connection route registry; the client side keeps one
//! [`ServiceProvider`] per exposed service with its live sessions. The
//! [`Reaper`] sweeps both on a fixed cadence so stale resources never block
//! port rebinding.

pub mod config;
pub mod context;
pub mod error;
pub mod provider;
pub mod reaper;
pub mod registry;
pub mod release;
pub mod session;

pub use config::TimeoutConfig;
pub use context::{ConnectionContext, ContextState, RouteDescriptor};
pub use error::{ControlError, ReleaseFailure};
pub use provider::{ProviderRegistry, ServiceProvider};
pub use reaper::{Reaper, SweepStats, SweepTarget};
pub use registry::ContextRegistry;
pub use release::{NoopRelease, ReleaseHook};
pub use session::Session;
