//! Client configuration
//!
//! All knobs the client honors, with serde support so deployments can load
//! them from TOML. Durations are expressed in milliseconds on disk.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stompline_protocol::{HeaderMap, Versions};

use crate::error::ConfigError;

/// Configuration for a [`Client`](crate::Client)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker address for the built-in TCP transport, `host:port`
    pub broker_addr: String,

    /// Protocol versions offered during the CONNECT handshake
    pub versions: Versions,

    /// Extra headers merged into every CONNECT frame
    pub connect_headers: HeaderMap,

    /// Extra headers merged into the DISCONNECT frame
    pub disconnect_headers: HeaderMap,

    /// Smallest outgoing heartbeat interval this client offers; zero
    /// disables outgoing heartbeats
    #[serde(with = "duration_millis")]
    pub heartbeat_outgoing: Duration,

    /// Desired incoming heartbeat interval; zero disables staleness checks
    #[serde(with = "duration_millis")]
    pub heartbeat_incoming: Duration,

    /// Delay between a connection loss and the next connect attempt; zero
    /// disables automatic reconnection
    #[serde(with = "duration_millis")]
    pub reconnect_delay: Duration,

    /// How long to wait for the CONNECTED frame before tearing the socket
    /// down; zero waits forever
    #[serde(with = "duration_millis")]
    pub connection_timeout: Duration,

    /// Split serialized text frames larger than `max_chunk_size` into
    /// multiple transport sends
    pub split_large_frames: bool,

    /// Chunk size used when `split_large_frames` is on
    pub max_chunk_size: usize,

    /// Send every frame as binary even when its payload is valid text
    pub force_binary_frames: bool,

    /// Append a NUL to inbound chunks that lack one, for transports that
    /// strip frame terminators
    pub append_missing_null: bool,

    /// On heartbeat failure, abandon the socket without a closing handshake
    /// instead of waiting for `close` to complete
    pub discard_on_comm_failure: bool,

    /// Log raw inbound chunks instead of decoded frames
    pub log_raw_communication: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_addr: "localhost:61613".to_string(),
            versions: Versions::default(),
            connect_headers: HeaderMap::new(),
            disconnect_headers: HeaderMap::new(),
            heartbeat_outgoing: Duration::from_millis(10_000),
            heartbeat_incoming: Duration::from_millis(10_000),
            reconnect_delay: Duration::from_millis(5_000),
            connection_timeout: Duration::ZERO,
            split_large_frames: false,
            max_chunk_size: 8 * 1024,
            force_binary_frames: false,
            append_missing_null: false,
            discard_on_comm_failure: false,
            log_raw_communication: false,
        }
    }
}

/// Load a client configuration from a TOML file
pub fn load_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::Invalid(format!("failed to read {}: {}", path.display(), err)))?;
    Ok(toml::from_str(&raw)?)
}

/// Save a client configuration to a TOML file
pub fn save_config(config: &ClientConfig, path: &Path) -> Result<(), ConfigError> {
    let raw = toml::to_string_pretty(config)?;
    std::fs::write(path, raw)
        .map_err(|err| ConfigError::Invalid(format!("failed to write {}: {}", path.display(), err)))?;
    Ok(())
}

/// Serde helper for durations stored as integer milliseconds
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
