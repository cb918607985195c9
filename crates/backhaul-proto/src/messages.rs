//! Control-plane message types
//!
//! Messages travel as one JSON document per line over the tunnel control
//! connection. Route registration is batched: a single `AddRoutes` or
//! `RemoveRoutes` may carry any number of candidates, and the relay answers
//! with one `RouteAck` per candidate.

use serde::{Deserialize, Serialize};

/// A client-proposed route registration.
///
/// The `proposed_id` is advisory at best: the relay always assigns its own
/// identifier to an accepted route and discards whatever the client sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteCandidate {
    /// Key used to match inbound public traffic to this route
    pub route_key: String,
    /// Local service the agent forwards to (e.g., "localhost:3000")
    pub target_addr: String,
    /// Identifier suggested by the client; ignored by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_id: Option<String>,
}

impl RouteCandidate {
    pub fn new(route_key: impl Into<String>, target_addr: impl Into<String>) -> Self {
        Self {
            route_key: route_key.into(),
            target_addr: target_addr.into(),
            proposed_id: None,
        }
    }
}

/// Per-candidate outcome of a route registration or removal batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteAck {
    pub route_key: String,
    pub accepted: bool,
    /// Present only when `accepted` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RouteAck {
    pub fn accepted(route_key: impl Into<String>) -> Self {
        Self {
            route_key: route_key.into(),
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(route_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            route_key: route_key.into(),
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Messages sent by the agent over the control connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// First message after connecting
    Hello { agent_name: String },
    /// Register local services under the given route keys
    AddRoutes { candidates: Vec<RouteCandidate> },
    /// Unregister routes by key; only keys in the sender's own registry match
    RemoveRoutes { candidates: Vec<RouteCandidate> },
    /// Keepalive; refreshes the relay's last-seen clock for this connection
    Ping { timestamp: u64 },
}

/// Messages sent by the relay over the control connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlResponse {
    /// Answer to `Hello`, carrying the server-assigned connection identifier
    HelloAck { context_id: String },
    /// One ack per candidate of the preceding add/remove batch
    RouteAcks { acks: Vec<RouteAck> },
    Pong { timestamp: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_routes_roundtrip() {
        let msg = ControlMessage::AddRoutes {
            candidates: vec![
                RouteCandidate::new("web", "localhost:3000"),
                RouteCandidate {
                    route_key: "db".to_string(),
                    target_addr: "localhost:5432".to_string(),
                    proposed_id: Some("client-picked".to_string()),
                },
            ],
        };

        let json = serde_json::to_string(&msg).unwrap();
        let decoded: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_candidate_proposed_id_optional_on_wire() {
        let json = r#"{"route_key":"web","target_addr":"localhost:3000"}"#;
        let candidate: RouteCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.route_key, "web");
        assert!(candidate.proposed_id.is_none());

        // Absent proposed_id is not serialized
        let out = serde_json::to_string(&candidate).unwrap();
        assert!(!out.contains("proposed_id"));
    }

    #[test]
    fn test_route_ack_constructors() {
        let ok = RouteAck::accepted("web");
        assert!(ok.accepted);
        assert!(ok.reason.is_none());

        let bad = RouteAck::rejected("web", "duplicate route key");
        assert!(!bad.accepted);
        assert_eq!(bad.reason.as_deref(), Some("duplicate route key"));
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = ControlResponse::RouteAcks {
            acks: vec![
                RouteAck::accepted("web"),
                RouteAck::rejected("db", "duplicate route key"),
            ],
        };
        let json = serde_json::to_string(&resp).unwrap();
        let decoded: ControlResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, resp);
    }
}
