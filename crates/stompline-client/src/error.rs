//! Client error types

use std::path::PathBuf;

use stompline_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the client API
#[derive(Error, Debug)]
pub enum ClientError {
    /// `activate` was called while a deactivation is still in flight
    #[error("Still DEACTIVATING, can not activate now")]
    StillDeactivating,

    /// An operation requires a live connection handler and none exists
    #[error("No active STOMP connection")]
    NotConnected,

    /// A MESSAGE without an ack id header cannot be acked/nacked
    #[error("Message carries no ack id header")]
    MissingAckId,

    /// Legacy connect call with an unparseable argument list
    #[error("Legacy connect: {0}")]
    BadConnectArgs(&'static str),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
