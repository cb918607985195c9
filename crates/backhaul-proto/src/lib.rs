//! Backhaul Control Protocol Definitions
//!
//! This crate defines the control-plane message types exchanged between the
//! relay and its agents, plus the IP gate consulted when a tunnel connection
//! is accepted. The data-plane byte forwarding is defined elsewhere.

pub mod ip_gate;
pub mod messages;

pub use ip_gate::{IpGate, IpGateError};
pub use messages::{ControlMessage, ControlResponse, RouteAck, RouteCandidate};
