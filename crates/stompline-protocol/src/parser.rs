//! Incremental frame parser
//!
//! A per-byte state machine that consumes arbitrary-sized chunks of the
//! incoming byte stream and emits decoded raw frames plus heartbeat pings.
//! Frame boundaries are never assumed to align with transport delivery
//! boundaries; a frame split into 1-byte chunks decodes identically to one
//! delivered whole.

use bytes::Bytes;
use tracing::debug;

const NUL: u8 = 0;
const LF: u8 = b'\n';
const CR: u8 = b'\r';
const COLON: u8 = b':';

/// A decoded frame before header dedup/unescaping.
///
/// Owned transiently by the parser's caller; converted to a
/// [`Frame`](crate::Frame) via `Frame::from_raw_frame`.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Command string exactly as read off the wire
    pub command: String,
    /// Raw `(key, value)` pairs in wire order, duplicates preserved
    pub headers: Vec<(String, String)>,
    /// Raw body bytes, NUL terminator excluded
    pub body: Bytes,
}

/// Output of feeding bytes to the parser
#[derive(Debug)]
pub enum ParseEvent {
    /// A complete frame was decoded
    Frame(RawFrame),
    /// A lone line-feed between frames: the server's heartbeat
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingFrameStart,
    CollectingCommand,
    CollectingHeaders,
    CollectingHeaderKey,
    CollectingHeaderValue,
    CollectingBodyFixedSize { remaining: usize },
    CollectingBodyNullTerminated,
}

/// Byte-driven incremental frame decoder
#[derive(Debug)]
pub struct Parser {
    state: State,
    token: Vec<u8>,
    command: String,
    headers: Vec<(String, String)>,
    header_key: String,
}

impl Parser {
    /// Create a parser awaiting the start of a frame
    pub fn new() -> Self {
        Self {
            state: State::AwaitingFrameStart,
            token: Vec::new(),
            command: String::new(),
            headers: Vec::new(),
            header_key: String::new(),
        }
    }

    /// Feed a binary chunk, returning the events it completed.
    ///
    /// `append_missing_null` feeds an extra NUL when the chunk does not end
    /// with one, a workaround for transports that strip trailing NULs.
    pub fn parse_chunk(&mut self, chunk: &[u8], append_missing_null: bool) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            self.on_byte(byte, &mut events);
        }
        if append_missing_null && chunk.last() != Some(&NUL) {
            self.on_byte(NUL, &mut events);
        }
        events
    }

    /// Feed a text chunk; re-encoded to bytes internally
    pub fn parse_text(&mut self, text: &str, append_missing_null: bool) -> Vec<ParseEvent> {
        self.parse_chunk(text.as_bytes(), append_missing_null)
    }

    fn on_byte(&mut self, byte: u8, events: &mut Vec<ParseEvent>) {
        // The loop exists only for byte reinjection: a state that realizes
        // the byte belongs to the next state re-processes it once.
        loop {
            match self.state {
                State::AwaitingFrameStart => {
                    match byte {
                        // NUL and CR occur between frames; discard
                        NUL | CR => {}
                        LF => events.push(ParseEvent::Ping),
                        _ => {
                            self.state = State::CollectingCommand;
                            continue;
                        }
                    }
                    return;
                }
                State::CollectingCommand => {
                    match byte {
                        CR => {}
                        LF => {
                            self.command = self.take_token_utf8();
                            self.state = State::CollectingHeaders;
                        }
                        _ => self.token.push(byte),
                    }
                    return;
                }
                State::CollectingHeaders => {
                    match byte {
                        CR => {}
                        LF => self.begin_body(),
                        _ => {
                            self.state = State::CollectingHeaderKey;
                            continue;
                        }
                    }
                    return;
                }
                State::CollectingHeaderKey => {
                    if byte == COLON {
                        self.header_key = self.take_token_utf8();
                        self.state = State::CollectingHeaderValue;
                    } else {
                        self.token.push(byte);
                    }
                    return;
                }
                State::CollectingHeaderValue => {
                    match byte {
                        CR => {}
                        LF => {
                            let value = self.take_token_utf8();
                            let key = std::mem::take(&mut self.header_key);
                            self.headers.push((key, value));
                            self.state = State::CollectingHeaders;
                        }
                        _ => self.token.push(byte),
                    }
                    return;
                }
                State::CollectingBodyFixedSize { remaining } => {
                    if remaining == 0 {
                        // Exactly content-length bytes consumed; this byte
                        // is the frame terminator and is discarded.
                        self.finish_frame(events);
                    } else {
                        self.state = State::CollectingBodyFixedSize {
                            remaining: remaining - 1,
                        };
                        self.token.push(byte);
                    }
                    return;
                }
                State::CollectingBodyNullTerminated => {
                    if byte == NUL {
                        self.finish_frame(events);
                    } else {
                        self.token.push(byte);
                    }
                    return;
                }
            }
        }
    }

    fn begin_body(&mut self) {
        let content_length = self
            .headers
            .iter()
            .find(|(key, _)| key == "content-length")
            .map(|(_, value)| value.as_str());

        self.state = match content_length {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(remaining) => State::CollectingBodyFixedSize { remaining },
                Err(_) => {
                    debug!("Ignoring unparseable content-length: {:?}", value);
                    State::CollectingBodyNullTerminated
                }
            },
            None => State::CollectingBodyNullTerminated,
        };
    }

    fn finish_frame(&mut self, events: &mut Vec<ParseEvent>) {
        let body = Bytes::from(std::mem::take(&mut self.token));
        events.push(ParseEvent::Frame(RawFrame {
            command: std::mem::take(&mut self.command),
            headers: std::mem::take(&mut self.headers),
            body,
        }));
        self.header_key.clear();
        self.state = State::AwaitingFrameStart;
    }

    fn take_token_utf8(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.token)).into_owned()
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}
