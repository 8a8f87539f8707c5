//! Frame representation and wire serialization
//!
//! A frame serializes as the command line, one `name:value` line per header,
//! a blank line, the body bytes, and a single NUL terminator:
//!
//! ```text
//! COMMAND\n
//! header1:value1\n
//! header2:value2\n
//! \n
//! body-bytes[NUL]
//! ```
//!
//! Header values are escaped when the negotiated protocol version requires
//! it, except on CONNECT/CONNECTED frames which are never escaped.

use std::borrow::Cow;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::command::Command;
use crate::error::ProtocolError;
use crate::headers::HeaderMap;
use crate::parser::RawFrame;

/// Header carrying the exact byte length of the body
pub const CONTENT_LENGTH: &str = "content-length";

/// Frame payload, canonical in one representation
///
/// The other representation is derived on demand: `text()` decodes a binary
/// body, `as_bytes()` views a text body as bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FrameBody {
    /// No payload
    #[default]
    Empty,
    /// Textual payload
    Text(String),
    /// Binary payload; may contain NUL bytes
    Binary(Bytes),
}

impl FrameBody {
    /// The payload as raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FrameBody::Empty => &[],
            FrameBody::Text(s) => s.as_bytes(),
            FrameBody::Binary(b) => b,
        }
    }

    /// The payload as text, decoding a binary body lossily
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            FrameBody::Empty => Cow::Borrowed(""),
            FrameBody::Text(s) => Cow::Borrowed(s),
            FrameBody::Binary(b) => String::from_utf8_lossy(b),
        }
    }

    /// Byte length of the payload
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the payload is zero bytes long
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the canonical representation is binary
    pub fn is_binary(&self) -> bool {
        matches!(self, FrameBody::Binary(_))
    }
}

impl From<String> for FrameBody {
    fn from(s: String) -> Self {
        FrameBody::Text(s)
    }
}

impl From<&str> for FrameBody {
    fn from(s: &str) -> Self {
        FrameBody::Text(s.to_string())
    }
}

impl From<Bytes> for FrameBody {
    fn from(b: Bytes) -> Self {
        FrameBody::Binary(b)
    }
}

impl From<Vec<u8>> for FrameBody {
    fn from(b: Vec<u8>) -> Self {
        FrameBody::Binary(Bytes::from(b))
    }
}

/// One complete protocol message
#[derive(Debug, Clone)]
pub struct Frame {
    /// Protocol verb
    pub command: Command,
    /// Ordered headers
    pub headers: HeaderMap,
    /// Payload
    pub body: FrameBody,
    escape_header_values: bool,
    skip_content_length: bool,
}

impl Frame {
    /// Create a frame with no headers and an empty body
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: HeaderMap::new(),
            body: FrameBody::Empty,
            escape_header_values: false,
            skip_content_length: false,
        }
    }

    /// Create a frame with headers and a body
    pub fn with_body(command: Command, headers: HeaderMap, body: impl Into<FrameBody>) -> Self {
        Self {
            command,
            headers,
            body: body.into(),
            escape_header_values: false,
            skip_content_length: false,
        }
    }

    /// Enable or disable header value escaping for serialization
    pub fn escaping(mut self, on: bool) -> Self {
        self.escape_header_values = on;
        self
    }

    /// Suppress the auto-computed `content-length` header.
    ///
    /// Also strips any caller-supplied `content-length` header from the
    /// serialized output. Binary bodies always carry `content-length`.
    pub fn skip_content_length(mut self, on: bool) -> Self {
        self.skip_content_length = on;
        self
    }

    /// Decode a raw parser frame into a frame.
    ///
    /// Header pairs are trimmed, deduplicated so the earliest occurrence of
    /// a key wins, and unescaped when `escape_header_values` is set and the
    /// command is not CONNECT/CONNECTED.
    pub fn from_raw_frame(raw: RawFrame, escape_header_values: bool) -> Result<Self, ProtocolError> {
        let name = raw.command.trim();
        if name.is_empty() {
            return Err(ProtocolError::MissingCommand);
        }
        let command = Command::from_name(name)
            .ok_or_else(|| ProtocolError::UnknownCommand(raw.command.clone()))?;

        let unescape = escape_header_values && !command.is_connect_family();
        let mut headers = HeaderMap::new();
        // Reverse scan: `set` replaces on repeat, so the first-written pair
        // is the one that survives.
        for (key, value) in raw.headers.iter().rev() {
            let key = key.trim();
            let value = if unescape {
                unescape_header_value(value.trim())
            } else {
                value.trim().to_string()
            };
            headers.set(key, value);
        }

        Ok(Self {
            command,
            headers,
            body: FrameBody::Binary(raw.body),
            escape_header_values,
            skip_content_length: false,
        })
    }

    /// Serialize to the exact wire byte sequence, NUL terminator included
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.body.len());
        self.write_command_and_headers(&mut buf);
        buf.extend_from_slice(self.body.as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }

    fn write_command_and_headers(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(self.command.as_str().as_bytes());
        buf.put_u8(b'\n');

        let escape = self.escape_header_values && !self.command.is_connect_family();
        for (name, value) in self.headers.iter() {
            if self.skip_content_length && name == CONTENT_LENGTH {
                continue;
            }
            let value = if escape {
                Cow::Owned(escape_header_value(value))
            } else {
                Cow::Borrowed(value)
            };
            buf.extend_from_slice(name.as_bytes());
            buf.put_u8(b':');
            buf.extend_from_slice(value.as_bytes());
            buf.put_u8(b'\n');
        }

        if self.body.is_binary() || (!self.body.is_empty() && !self.skip_content_length) {
            buf.extend_from_slice(CONTENT_LENGTH.as_bytes());
            buf.put_u8(b':');
            buf.extend_from_slice(self.body.len().to_string().as_bytes());
            buf.put_u8(b'\n');
        }

        buf.put_u8(b'\n');
    }
}

impl fmt::Display for Frame {
    /// Command and headers only; bodies are elided from logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)?;
        for (name, value) in self.headers.iter() {
            write!(f, " {}:{}", name, value)?;
        }
        Ok(())
    }
}

/// Escape a header value: `\` -> `\\`, CR -> `\r`, LF -> `\n`, `:` -> `\c`.
///
/// Backslash must be escaped first so the other replacements cannot be
/// re-escaped.
pub fn escape_header_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\r', "\\r")
        .replace('\n', "\\n")
        .replace(':', "\\c")
}

/// Reverse of `escape_header_value`, applied in the order `\r`, `\n`, `\c`,
/// `\\`.
pub fn unescape_header_value(value: &str) -> String {
    value
        .replace("\\r", "\r")
        .replace("\\n", "\n")
        .replace("\\c", ":")
        .replace("\\\\", "\\")
}
