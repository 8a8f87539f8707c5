//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame command is not a STOMP verb
    #[error("Unknown STOMP command: {0:?}")]
    UnknownCommand(String),

    /// Frame arrived without a command line
    #[error("Frame is missing a command")]
    MissingCommand,
}
