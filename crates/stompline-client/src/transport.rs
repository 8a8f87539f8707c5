//! Transport abstraction and the built-in TCP transport
//!
//! The connection handler drives a [`Transport`]: an ordered, message-ish
//! byte pipe with websocket-style lifecycle events. Custom transports
//! (websockets, in-memory test doubles) plug in through a
//! [`TransportFactory`] on the client.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ClientError;

/// Websocket-style lifecycle state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Opening handshake in progress
    Connecting,
    /// Open for traffic
    Open,
    /// Close initiated, not yet confirmed
    Closing,
    /// Fully closed
    Closed,
}

/// Details of a transport close, mirrored to the socket-close callback
#[derive(Debug, Clone)]
pub struct CloseInfo {
    /// Close code; 1000 for clean closes, 4001 for discarded sockets
    pub code: u16,
    /// Human-readable close reason
    pub reason: String,
    /// Whether the close completed a proper closing handshake
    pub clean: bool,
}

impl CloseInfo {
    /// A normal, handshake-complete close
    pub fn clean() -> Self {
        Self {
            code: 1000,
            reason: String::new(),
            clean: true,
        }
    }

    /// Synthetic close emitted when the socket is discarded after a
    /// communication failure
    pub fn discarded() -> Self {
        Self {
            code: 4001,
            reason: "Heartbeat failure, discarding the socket".to_string(),
            clean: false,
        }
    }
}

/// Event stream a transport delivers to the connection handler
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport finished opening and is ready for traffic
    Open,
    /// Inbound binary data
    Data(Bytes),
    /// Inbound text data
    Text(String),
    /// The transport closed; terminal
    Closed(CloseInfo),
    /// A transport-level error; a close usually follows
    Error(String),
}

/// An ordered byte pipe with lifecycle events
#[async_trait]
pub trait Transport: Send {
    /// Send a text chunk
    async fn send_text(&mut self, text: &str) -> Result<(), ClientError>;

    /// Send a binary chunk
    async fn send_binary(&mut self, data: Bytes) -> Result<(), ClientError>;

    /// Initiate a close; a `Closed` event must eventually follow
    async fn close(&mut self) -> Result<(), ClientError>;

    /// Current lifecycle state
    fn ready_state(&self) -> ReadyState;

    /// Next lifecycle or data event; `None` once the stream is exhausted
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Abandon the underlying socket without a closing handshake and
    /// synthesize a `Closed` event with code 4001. The OS-level socket may
    /// linger; the handler stops caring about it immediately.
    fn discard(&mut self);
}

/// Boxed transport as held by the connection handler
pub type BoxedTransport = Box<dyn Transport + Send>;

/// Future produced by a transport factory
pub type TransportFuture = Pin<Box<dyn Future<Output = Result<BoxedTransport, ClientError>> + Send>>;

/// Factory invoked on every connection attempt, initial and reconnect alike
pub type TransportFactory = Arc<dyn Fn() -> TransportFuture + Send + Sync>;

/// Plain TCP transport; the default when no factory is configured.
///
/// STOMP is self-delimiting (NUL terminators, content-length), so raw TCP
/// needs no extra framing layer.
pub struct TcpTransport {
    state: ReadyState,
    writer: Option<OwnedWriteHalf>,
    events: mpsc::Receiver<TransportEvent>,
    event_tx: mpsc::Sender<TransportEvent>,
    reader: JoinHandle<()>,
}

impl TcpTransport {
    /// Connect to `addr` and spawn the reader task
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut read_half, write_half) = stream.into_split();

        let (event_tx, events) = mpsc::channel(64);
        let _ = event_tx.send(TransportEvent::Open).await;

        let reader_tx = event_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug!("TCP peer closed the connection");
                        let _ = reader_tx.send(TransportEvent::Closed(CloseInfo::clean())).await;
                        break;
                    }
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        if reader_tx.send(TransportEvent::Data(data)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = reader_tx.send(TransportEvent::Error(err.to_string())).await;
                        let _ = reader_tx
                            .send(TransportEvent::Closed(CloseInfo {
                                code: 1006,
                                reason: err.to_string(),
                                clean: false,
                            }))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(Self {
            state: ReadyState::Open,
            writer: Some(write_half),
            events,
            event_tx,
            reader,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.send_binary(Bytes::copy_from_slice(text.as_bytes())).await
    }

    async fn send_binary(&mut self, data: Bytes) -> Result<(), ClientError> {
        let writer = self.writer.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(&data).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        if let Some(mut writer) = self.writer.take() {
            self.state = ReadyState::Closing;
            writer.shutdown().await?;
        }
        Ok(())
    }

    fn ready_state(&self) -> ReadyState {
        self.state
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        let event = self.events.recv().await;
        if matches!(event, Some(TransportEvent::Closed(_))) {
            self.state = ReadyState::Closed;
        }
        event
    }

    fn discard(&mut self) {
        self.reader.abort();
        self.writer = None;
        self.state = ReadyState::Closed;
        let _ = self
            .event_tx
            .try_send(TransportEvent::Closed(CloseInfo::discarded()));
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
