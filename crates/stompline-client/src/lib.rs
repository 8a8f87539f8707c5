//! STOMP client built on [`stompline-protocol`](stompline_protocol)
//!
//! Provides the full client lifecycle: transport management with automatic
//! reconnection, the CONNECT handshake with version and heartbeat
//! negotiation, frame dispatch to subscriptions and receipt watchers, and
//! graceful receipt-confirmed disconnects. A [`CompatClient`] facade covers
//! the legacy calling conventions.

pub mod client;
pub mod compat;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod transport;

pub use client::{ActivationState, Client};
pub use compat::{CompatClient, LegacyConnectArg};
pub use config::{load_config, save_config, ClientConfig};
pub use error::{ClientError, ConfigError};
pub use events::ClientCallbacks;
pub use handler::{InboundMessage, Publish, Subscription, Transaction};
pub use transport::{
    BoxedTransport, CloseInfo, ReadyState, TcpTransport, Transport, TransportEvent,
    TransportFactory, TransportFuture,
};
