//! STOMP command verbs

use std::fmt;

/// Protocol command identifier
///
/// Covers every verb defined by STOMP 1.0 through 1.2, for both directions
/// of the connection. Frames read off the wire with a command outside this
/// set are rejected at decode time (see `Frame::from_raw_frame`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Open a session (client -> server)
    Connect,
    /// Session accepted (server -> client)
    Connected,
    /// Publish a message to a destination
    Send,
    /// Message delivery (server -> client)
    Message,
    /// Register a subscription
    Subscribe,
    /// Remove a subscription
    Unsubscribe,
    /// Acknowledge a message
    Ack,
    /// Negatively acknowledge a message
    Nack,
    /// Start a transaction
    Begin,
    /// Commit a transaction
    Commit,
    /// Abort a transaction
    Abort,
    /// Close the session gracefully
    Disconnect,
    /// Server-side error report
    Error,
    /// Acknowledgement correlated via `receipt-id`
    Receipt,
}

impl Command {
    /// Wire representation of the command
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Error => "ERROR",
            Command::Receipt => "RECEIPT",
        }
    }

    /// Parse a wire command string
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "CONNECT" => Some(Command::Connect),
            "CONNECTED" => Some(Command::Connected),
            "SEND" => Some(Command::Send),
            "MESSAGE" => Some(Command::Message),
            "SUBSCRIBE" => Some(Command::Subscribe),
            "UNSUBSCRIBE" => Some(Command::Unsubscribe),
            "ACK" => Some(Command::Ack),
            "NACK" => Some(Command::Nack),
            "BEGIN" => Some(Command::Begin),
            "COMMIT" => Some(Command::Commit),
            "ABORT" => Some(Command::Abort),
            "DISCONNECT" => Some(Command::Disconnect),
            "ERROR" => Some(Command::Error),
            "RECEIPT" => Some(Command::Receipt),
            _ => None,
        }
    }

    /// Whether header escaping is suppressed for this command.
    ///
    /// CONNECT and CONNECTED frames never use escaped header values,
    /// regardless of the negotiated protocol version.
    pub fn is_connect_family(&self) -> bool {
        matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
