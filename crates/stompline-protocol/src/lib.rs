//! stompline-protocol: STOMP wire protocol
//!
//! This crate defines the text-based STOMP frame format and an incremental
//! parser for decoding a connection's byte stream. It has no knowledge of
//! any transport; the client crate feeds it bytes and transmits whatever it
//! serializes.

pub mod command;
pub mod error;
pub mod frame;
pub mod headers;
pub mod parser;
pub mod version;

pub use command::Command;
pub use error::ProtocolError;
pub use frame::{Frame, FrameBody};
pub use headers::HeaderMap;
pub use parser::{ParseEvent, Parser, RawFrame};
pub use version::Versions;
