//! Message envelope and the message types exchanged with agents
//!
//! Everything on the wire is `{type, data}` JSON; framing belongs to the
//! connection layer, the bus only sees structured messages.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Full state snapshot pushed to an Olm at (re)connect.
pub const OLM_SYNC: &str = "olm/sync";

/// Zone configuration push to a Newt.
pub const NEWT_DNS_AUTHORITY_CONFIG: &str = "newt/dns/authority/config";

/// Zone configuration push to an Olm.
pub const OLM_DNS_AUTHORITY_CONFIG: &str = "olm/dns/authority/config";

/// Auth-proxy configuration push to a Newt.
pub const NEWT_AUTH_PROXY_CONFIG: &str = "newt/auth/proxy/config";

/// Inbound per-target health report from a Newt.
pub const HEALTHCHECK_STATUS: &str = "healthcheck/status";

/// One structured message on an agent channel, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: serde_json::Value,
}

impl AgentMessage {
    /// Build a message from a serializable payload.
    pub fn new<T: Serialize>(message_type: impl Into<String>, data: &T) -> Result<Self> {
        Ok(Self {
            message_type: message_type.into(),
            data: serde_json::to_value(data)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_type_field() {
        let msg = AgentMessage::new(OLM_SYNC, &serde_json::json!({"sites": []})).unwrap();
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"type\":\"olm/sync\""));

        let back: AgentMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }
}
