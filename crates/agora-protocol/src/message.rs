use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Relay message type.
///
/// The wire format is an open string set: peers may introduce new types at
/// any time, and the router deliberately leaves unknown types unacknowledged
/// so they can be retried or inspected later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MsgKind {
    /// "Are you alive?"; answered with a signed pong.
    Ping,
    /// Reply to a ping, referencing the ping's message id.
    Pong,
    /// Paid service invocation. Must carry a valid signature.
    ServiceRequest,
    /// Result (or signed rejection) of a service request.
    ServiceResponse,
    /// Any type this node does not handle.
    Other(String),
}

impl MsgKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::ServiceRequest => "service-request",
            Self::ServiceResponse => "service-response",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for MsgKind {
    fn from(s: &str) -> Self {
        match s {
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "service-request" => Self::ServiceRequest,
            "service-response" => Self::ServiceResponse,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl std::fmt::Display for MsgKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MsgKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MsgKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// An inbound relay message. The relay assigns `id` on ingestion; everything
/// else is sender-controlled and untrusted until the signature checks out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: MsgKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// An outbound envelope. No id; the relay mints one and returns it.
#[derive(Debug, Clone, Serialize)]
pub struct SendEnvelope {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: MsgKind,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Check that a string is a compressed secp256k1 public key in hex
/// (66 chars, 02/03 prefix); the identity key format used on the relay.
pub fn is_identity_key(s: &str) -> bool {
    s.len() == 66
        && (s.starts_with("02") || s.starts_with("03"))
        && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_kind_round_trips_through_strings() {
        for s in ["ping", "pong", "service-request", "service-response", "gossip"] {
            assert_eq!(MsgKind::from(s).as_str(), s);
        }
    }

    #[test]
    fn unknown_kind_is_preserved_verbatim() {
        let kind: MsgKind = serde_json::from_value(serde_json::json!("telemetry")).unwrap();
        assert_eq!(kind, MsgKind::Other("telemetry".into()));
        assert_eq!(serde_json::to_value(&kind).unwrap(), serde_json::json!("telemetry"));
    }

    #[test]
    fn identity_key_format() {
        let good = format!("02{}", "ab".repeat(32));
        assert!(is_identity_key(&good));
        assert!(!is_identity_key(&format!("04{}", "ab".repeat(32))));
        assert!(!is_identity_key("02abcd"));
        assert!(!is_identity_key(&format!("02{}zz", "ab".repeat(31))));
    }
}
