//! Protocol version negotiation
//!
//! The client advertises every version it speaks in the CONNECT frame's
//! `accept-version` header; the server picks one and reports it back in the
//! CONNECTED frame's `version` header.

use serde::{Deserialize, Serialize};

/// STOMP 1.0
pub const V1_0: &str = "1.0";
/// STOMP 1.1 (adds heart-beating and NACK)
pub const V1_1: &str = "1.1";
/// STOMP 1.2 (adds header escaping and the `ack` header)
pub const V1_2: &str = "1.2";

/// An ordered list of protocol versions the client is willing to speak
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Versions(Vec<String>);

impl Versions {
    /// Create a version list from explicit version strings
    pub fn new(versions: Vec<String>) -> Self {
        Self(versions)
    }

    /// The versions as individual strings
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Comma-joined list for the `accept-version` CONNECT header
    pub fn supported_versions(&self) -> String {
        self.0.join(",")
    }

    /// Subprotocol identifiers in the `v12.stomp` form.
    ///
    /// Used by transports that negotiate a subprotocol during their own
    /// handshake (e.g. WebSocket).
    pub fn protocol_versions(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|v| format!("v{}.stomp", v.replace('.', "")))
            .collect()
    }
}

impl Default for Versions {
    /// All versions, oldest first: `1.0,1.1,1.2`
    fn default() -> Self {
        Self(vec![V1_0.to_string(), V1_1.to_string(), V1_2.to_string()])
    }
}
