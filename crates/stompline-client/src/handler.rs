//! Connection handler: owns one transport session end to end
//!
//! A single task runs the handler loop: it multiplexes transport events,
//! caller commands, and heartbeat timers through one `select!`. All session
//! state (subscriptions, receipt watchers, negotiated version) lives inside
//! the handler, so no locking is needed; callers talk to it through a
//! [`SessionHandle`] command channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, Interval};
use tracing::{debug, warn};

use stompline_protocol::{version, Command, Frame, FrameBody, HeaderMap, ParseEvent, Parser};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::{ClientCallbacks, ReceiptCallback, SubscriptionCallback};
use crate::transport::{BoxedTransport, CloseInfo, ReadyState, TransportEvent};

/// Parameters of an outgoing SEND
pub struct Publish {
    /// Destination the broker routes on
    pub destination: String,
    /// Additional headers; `destination` is set from the field above
    pub headers: HeaderMap,
    /// Frame payload
    pub body: FrameBody,
    /// Suppress the automatic `content-length` header
    pub skip_content_length: bool,
}

impl Publish {
    /// A text message to `destination`
    pub fn text(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            headers: HeaderMap::new(),
            body: FrameBody::Text(body.into()),
            skip_content_length: false,
        }
    }

    /// A binary message to `destination`
    pub fn binary(destination: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            destination: destination.into(),
            headers: HeaderMap::new(),
            body: FrameBody::Binary(body.into()),
            skip_content_length: false,
        }
    }

    /// Attach extra headers
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Commands accepted by the handler loop
pub(crate) enum HandlerCommand {
    Publish(Publish),
    Subscribe {
        id: String,
        destination: String,
        headers: HeaderMap,
        callback: SubscriptionCallback,
    },
    Unsubscribe {
        id: String,
        headers: HeaderMap,
    },
    Begin {
        transaction: String,
    },
    Commit {
        transaction: String,
    },
    Abort {
        transaction: String,
    },
    Ack {
        ack_id: String,
        subscription: String,
        headers: HeaderMap,
    },
    Nack {
        ack_id: String,
        subscription: String,
        headers: HeaderMap,
    },
    WatchReceipt {
        receipt_id: String,
        callback: ReceiptCallback,
    },
    Dispose,
    ForceDisconnect,
}

/// Cheap, clonable handle to a running connection handler
#[derive(Clone)]
pub(crate) struct SessionHandle {
    tx: mpsc::UnboundedSender<HandlerCommand>,
    counter: Arc<AtomicU64>,
    connected: watch::Receiver<Option<String>>,
}

impl SessionHandle {
    fn send(&self, cmd: HandlerCommand) -> Result<(), ClientError> {
        self.tx.send(cmd).map_err(|_| ClientError::NotConnected)
    }

    /// Generated ids share one counter across subscriptions, transactions
    /// and receipts, so ids never collide within a session.
    pub(crate) fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.counter.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn connected(&self) -> bool {
        self.connected.borrow().is_some()
    }

    pub(crate) fn connected_version(&self) -> Option<String> {
        self.connected.borrow().clone()
    }

    pub(crate) fn publish(&self, publish: Publish) -> Result<(), ClientError> {
        self.send(HandlerCommand::Publish(publish))
    }

    pub(crate) fn subscribe(
        &self,
        destination: &str,
        headers: HeaderMap,
        callback: SubscriptionCallback,
    ) -> Result<Subscription, ClientError> {
        let id = match headers.get("id") {
            Some(id) => id.to_string(),
            None => self.next_id("sub"),
        };
        self.send(HandlerCommand::Subscribe {
            id: id.clone(),
            destination: destination.to_string(),
            headers,
            callback,
        })?;
        Ok(Subscription {
            id,
            handle: self.clone(),
        })
    }

    pub(crate) fn unsubscribe(&self, id: &str, headers: HeaderMap) -> Result<(), ClientError> {
        self.send(HandlerCommand::Unsubscribe {
            id: id.to_string(),
            headers,
        })
    }

    pub(crate) fn begin(&self, transaction: Option<&str>) -> Result<Transaction, ClientError> {
        let id = match transaction {
            Some(id) => id.to_string(),
            None => self.next_id("tx"),
        };
        self.send(HandlerCommand::Begin {
            transaction: id.clone(),
        })?;
        Ok(Transaction {
            id,
            handle: self.clone(),
        })
    }

    pub(crate) fn commit(&self, transaction: &str) -> Result<(), ClientError> {
        self.send(HandlerCommand::Commit {
            transaction: transaction.to_string(),
        })
    }

    pub(crate) fn abort(&self, transaction: &str) -> Result<(), ClientError> {
        self.send(HandlerCommand::Abort {
            transaction: transaction.to_string(),
        })
    }

    pub(crate) fn ack(
        &self,
        ack_id: &str,
        subscription: &str,
        headers: HeaderMap,
    ) -> Result<(), ClientError> {
        self.send(HandlerCommand::Ack {
            ack_id: ack_id.to_string(),
            subscription: subscription.to_string(),
            headers,
        })
    }

    pub(crate) fn nack(
        &self,
        ack_id: &str,
        subscription: &str,
        headers: HeaderMap,
    ) -> Result<(), ClientError> {
        self.send(HandlerCommand::Nack {
            ack_id: ack_id.to_string(),
            subscription: subscription.to_string(),
            headers,
        })
    }

    pub(crate) fn watch_for_receipt(
        &self,
        receipt_id: &str,
        callback: ReceiptCallback,
    ) -> Result<(), ClientError> {
        self.send(HandlerCommand::WatchReceipt {
            receipt_id: receipt_id.to_string(),
            callback,
        })
    }

    pub(crate) fn dispose(&self) -> Result<(), ClientError> {
        self.send(HandlerCommand::Dispose)
    }

    pub(crate) fn force_disconnect(&self) -> Result<(), ClientError> {
        self.send(HandlerCommand::ForceDisconnect)
    }
}

/// An active subscription; unsubscribes through its handle
pub struct Subscription {
    /// Subscription id, caller-provided or generated (`sub-{n}`)
    pub id: String,
    pub(crate) handle: SessionHandle,
}

impl Subscription {
    /// Remove the local callback and send UNSUBSCRIBE
    pub fn unsubscribe(self, headers: HeaderMap) -> Result<(), ClientError> {
        self.handle.unsubscribe(&self.id, headers)
    }
}

/// An open transaction; SEND/ACK/NACK join it via a `transaction` header
pub struct Transaction {
    /// Transaction id, caller-provided or generated (`tx-{n}`)
    pub id: String,
    pub(crate) handle: SessionHandle,
}

impl Transaction {
    /// Send COMMIT for this transaction
    pub fn commit(self) -> Result<(), ClientError> {
        self.handle.commit(&self.id)
    }

    /// Send ABORT for this transaction
    pub fn abort(self) -> Result<(), ClientError> {
        self.handle.abort(&self.id)
    }
}

/// An inbound MESSAGE delivered to a subscription callback
pub struct InboundMessage {
    /// The decoded MESSAGE frame
    pub frame: Frame,
    subscription: String,
    ack_id: Option<String>,
    handle: SessionHandle,
}

impl InboundMessage {
    /// Subscription id this message was routed on
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Acknowledge this message. Uses the `ack` header on protocol 1.2
    /// sessions and `message-id` on earlier versions.
    pub fn ack(&self, headers: HeaderMap) -> Result<(), ClientError> {
        let ack_id = self.ack_id.as_deref().ok_or(ClientError::MissingAckId)?;
        self.handle.ack(ack_id, &self.subscription, headers)
    }

    /// Reject this message
    pub fn nack(&self, headers: HeaderMap) -> Result<(), ClientError> {
        let ack_id = self.ack_id.as_deref().ok_or(ClientError::MissingAckId)?;
        self.handle.nack(ack_id, &self.subscription, headers)
    }
}

/// Negotiate heartbeat periods from the server's `heart-beat` header.
///
/// Returns `(ping_period_ms, pong_period_ms)`: each is the max of the local
/// offer and the peer's capability, and `None` when either side opts out
/// with zero.
fn negotiated_heartbeat(
    local_outgoing: u64,
    local_incoming: u64,
    heart_beat: &str,
) -> (Option<u64>, Option<u64>) {
    let mut parts = heart_beat
        .split(',')
        .map(|part| part.trim().parse::<u64>().unwrap_or(0));
    let server_outgoing = parts.next().unwrap_or(0);
    let server_incoming = parts.next().unwrap_or(0);

    let ping = (local_outgoing != 0 && server_incoming != 0)
        .then(|| local_outgoing.max(server_incoming));
    let pong = (local_incoming != 0 && server_outgoing != 0)
        .then(|| local_incoming.max(server_outgoing));
    (ping, pong)
}

/// Split serialized text on char boundaries into chunks of at most `max`
/// bytes. A chunk may exceed `max` only when a single char does.
fn chunk_text(text: &str, max: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = max.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest
                .chars()
                .next()
                .map(|c| c.len_utf8())
                .unwrap_or(rest.len());
        }
        chunks.push(&rest[..end]);
        rest = &rest[end..];
    }
    chunks
}

async fn tick_opt(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Drives one transport session: CONNECT handshake, frame dispatch,
/// heartbeats, receipts, and teardown.
pub(crate) struct ConnectionHandler {
    config: ClientConfig,
    callbacks: ClientCallbacks,
    transport: BoxedTransport,
    parser: Parser,
    cmd_rx: mpsc::UnboundedReceiver<HandlerCommand>,
    handle: SessionHandle,
    connected_tx: watch::Sender<Option<String>>,
    connected: bool,
    connected_version: Option<String>,
    escape_header_values: bool,
    subscriptions: HashMap<String, SubscriptionCallback>,
    receipt_watchers: HashMap<String, ReceiptCallback>,
    pending_disconnect_receipt: Option<String>,
    last_server_activity: Instant,
    pinger: Option<Interval>,
    ponger: Option<(Interval, Duration)>,
    close_info: Option<CloseInfo>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        config: ClientConfig,
        callbacks: ClientCallbacks,
        transport: BoxedTransport,
    ) -> (Self, SessionHandle) {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(None);
        let handle = SessionHandle {
            tx,
            counter: Arc::new(AtomicU64::new(0)),
            connected: connected_rx,
        };
        let handler = Self {
            config,
            callbacks,
            transport,
            parser: Parser::new(),
            cmd_rx,
            handle: handle.clone(),
            connected_tx,
            connected: false,
            connected_version: None,
            escape_header_values: false,
            subscriptions: HashMap::new(),
            receipt_watchers: HashMap::new(),
            pending_disconnect_receipt: None,
            last_server_activity: Instant::now(),
            pinger: None,
            ponger: None,
            close_info: None,
        };
        (handler, handle)
    }

    /// Run the session to completion; returns the close details
    pub(crate) async fn run(mut self) -> CloseInfo {
        let connection_timeout = self.config.connection_timeout;
        let mut timeout_armed = !connection_timeout.is_zero();
        let timeout_fuse = time::sleep(if timeout_armed {
            connection_timeout
        } else {
            Duration::from_secs(3600)
        });
        tokio::pin!(timeout_fuse);

        loop {
            tokio::select! {
                event = self.transport.next_event() => {
                    match event {
                        None => {
                            debug!("Transport event stream ended");
                            break;
                        }
                        Some(TransportEvent::Open) => self.send_connect_frame().await,
                        Some(TransportEvent::Data(data)) => self.handle_incoming(&data).await,
                        Some(TransportEvent::Text(text)) => {
                            self.handle_incoming(text.as_bytes()).await
                        }
                        Some(TransportEvent::Closed(info)) => {
                            self.close_info = Some(info);
                            break;
                        }
                        Some(TransportEvent::Error(err)) => {
                            warn!("Transport error: {}", err);
                            (self.callbacks.on_socket_error)(&err);
                        }
                    }
                }
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd).await,
                _ = tick_opt(self.pinger.as_mut()) => self.send_ping().await,
                _ = tick_opt(self.ponger.as_mut().map(|(interval, _)| interval)) => {
                    self.check_server_activity().await
                }
                _ = &mut timeout_fuse, if timeout_armed => {
                    timeout_armed = false;
                    if !self.connected {
                        debug!(
                            "No CONNECTED frame within {:?}, closing socket",
                            connection_timeout
                        );
                        self.close_or_discard().await;
                    }
                }
            }
        }

        self.cleanup();
        self.close_info.take().unwrap_or(CloseInfo {
            code: 1006,
            reason: "transport event stream ended".to_string(),
            clean: false,
        })
    }

    async fn send_connect_frame(&mut self) {
        debug!("Transport opened, sending CONNECT");
        let mut headers = self.config.connect_headers.clone();
        headers.set("accept-version", self.config.versions.supported_versions());
        headers.set(
            "heart-beat",
            format!(
                "{},{}",
                self.config.heartbeat_outgoing.as_millis(),
                self.config.heartbeat_incoming.as_millis()
            ),
        );
        self.transmit(Frame::with_body(Command::Connect, headers, FrameBody::Empty))
            .await;
    }

    async fn handle_incoming(&mut self, data: &[u8]) {
        self.last_server_activity = Instant::now();
        if self.config.log_raw_communication {
            debug!("<<< {}", String::from_utf8_lossy(data));
        }
        let events = self.parser.parse_chunk(data, self.config.append_missing_null);
        for event in events {
            match event {
                ParseEvent::Ping => debug!("<<< PONG"),
                ParseEvent::Frame(raw) => {
                    let frame = match Frame::from_raw_frame(raw, self.escape_header_values) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!("Dropping undecodable frame: {}", err);
                            continue;
                        }
                    };
                    if !self.config.log_raw_communication {
                        debug!("<<< {}", frame);
                    }
                    self.dispatch(frame).await;
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) {
        match frame.command {
            Command::Connected => self.on_connected(frame),
            Command::Message => self.on_message(frame),
            Command::Receipt => self.on_receipt(frame).await,
            Command::Error => (self.callbacks.on_stomp_error)(&frame),
            _ => (self.callbacks.on_unhandled_frame)(&frame),
        }
    }

    fn on_connected(&mut self, frame: Frame) {
        let version = frame
            .headers
            .get("version")
            .unwrap_or(version::V1_0)
            .to_string();
        debug!(
            "Connected to server {}, protocol {}",
            frame.headers.get("server").unwrap_or("<unknown>"),
            version
        );
        // Header escaping applies from protocol 1.2 on, in both directions
        if version == version::V1_2 {
            self.escape_header_values = true;
        }
        self.setup_heartbeat(&frame, &version);
        self.connected = true;
        self.connected_version = Some(version.clone());
        let _ = self.connected_tx.send(Some(version));
        (self.callbacks.on_connect)(&frame);
    }

    fn setup_heartbeat(&mut self, frame: &Frame, negotiated_version: &str) {
        if negotiated_version != version::V1_1 && negotiated_version != version::V1_2 {
            return;
        }
        let Some(heart_beat) = frame.headers.get("heart-beat") else {
            return;
        };
        let (ping, pong) = negotiated_heartbeat(
            self.config.heartbeat_outgoing.as_millis() as u64,
            self.config.heartbeat_incoming.as_millis() as u64,
            heart_beat,
        );
        if let Some(millis) = ping {
            debug!("Sending PING every {}ms", millis);
            let period = Duration::from_millis(millis);
            self.pinger = Some(time::interval_at(Instant::now() + period, period));
        }
        if let Some(millis) = pong {
            debug!("Checking server activity every {}ms", millis);
            let period = Duration::from_millis(millis);
            self.ponger = Some((time::interval_at(Instant::now() + period, period), period));
        }
    }

    async fn send_ping(&mut self) {
        if self.transport.ready_state() != ReadyState::Open {
            return;
        }
        match self.transport.send_text("\n").await {
            Ok(()) => debug!(">>> PING"),
            Err(err) => warn!("Failed to send heartbeat: {}", err),
        }
    }

    async fn check_server_activity(&mut self) {
        let Some((_, period)) = &self.ponger else {
            return;
        };
        // Two missed periods count as a dead peer
        let allowance = *period * 2;
        let idle = self.last_server_activity.elapsed();
        if idle > allowance {
            warn!("No server activity for {:?} (allowed {:?})", idle, allowance);
            self.close_or_discard().await;
        }
    }

    async fn close_or_discard(&mut self) {
        if self.config.discard_on_comm_failure {
            debug!("Discarding the transport; the underlying socket may linger");
            self.transport.discard();
        } else if let Err(err) = self.transport.close().await {
            warn!("Error closing transport: {}", err);
        }
    }

    fn on_message(&mut self, frame: Frame) {
        let subscription = frame
            .headers
            .get("subscription")
            .unwrap_or("")
            .to_string();
        // Protocol 1.2 acks by the `ack` header, older versions by
        // `message-id`
        let ack_header = if self.connected_version.as_deref() == Some(version::V1_2) {
            "ack"
        } else {
            "message-id"
        };
        let ack_id = frame.headers.get(ack_header).map(str::to_string);
        let message = InboundMessage {
            frame,
            subscription: subscription.clone(),
            ack_id,
            handle: self.handle.clone(),
        };
        match self.subscriptions.get_mut(&subscription) {
            Some(callback) => callback(message),
            None => (self.callbacks.on_unhandled_message)(message),
        }
    }

    async fn on_receipt(&mut self, frame: Frame) {
        let receipt_id = frame.headers.get("receipt-id").unwrap_or("").to_string();
        if self.pending_disconnect_receipt.as_deref() == Some(receipt_id.as_str()) {
            debug!("Disconnect receipt {} arrived, closing socket", receipt_id);
            self.pending_disconnect_receipt = None;
            if let Err(err) = self.transport.close().await {
                debug!("Ignoring error while closing after disconnect: {}", err);
            }
            self.cleanup();
            (self.callbacks.on_disconnect)(&frame);
            return;
        }
        match self.receipt_watchers.remove(&receipt_id) {
            Some(callback) => callback(&frame),
            None => (self.callbacks.on_unhandled_receipt)(&frame),
        }
    }

    async fn handle_command(&mut self, cmd: HandlerCommand) {
        match cmd {
            HandlerCommand::Publish(publish) => {
                let mut headers = publish.headers;
                headers.set("destination", publish.destination);
                let frame = Frame::with_body(Command::Send, headers, publish.body)
                    .skip_content_length(publish.skip_content_length);
                self.transmit(frame).await;
            }
            HandlerCommand::Subscribe {
                id,
                destination,
                mut headers,
                callback,
            } => {
                headers.set("id", id.clone());
                headers.set("destination", destination);
                self.subscriptions.insert(id, callback);
                self.transmit(Frame::with_body(
                    Command::Subscribe,
                    headers,
                    FrameBody::Empty,
                ))
                .await;
            }
            HandlerCommand::Unsubscribe { id, mut headers } => {
                self.subscriptions.remove(&id);
                headers.set("id", id);
                self.transmit(Frame::with_body(
                    Command::Unsubscribe,
                    headers,
                    FrameBody::Empty,
                ))
                .await;
            }
            HandlerCommand::Begin { transaction } => {
                self.transmit_transaction(Command::Begin, transaction).await;
            }
            HandlerCommand::Commit { transaction } => {
                self.transmit_transaction(Command::Commit, transaction).await;
            }
            HandlerCommand::Abort { transaction } => {
                self.transmit_transaction(Command::Abort, transaction).await;
            }
            HandlerCommand::Ack {
                ack_id,
                subscription,
                headers,
            } => {
                self.transmit_ack(Command::Ack, ack_id, subscription, headers)
                    .await;
            }
            HandlerCommand::Nack {
                ack_id,
                subscription,
                headers,
            } => {
                self.transmit_ack(Command::Nack, ack_id, subscription, headers)
                    .await;
            }
            HandlerCommand::WatchReceipt {
                receipt_id,
                callback,
            } => {
                self.receipt_watchers.insert(receipt_id, callback);
            }
            HandlerCommand::Dispose => self.dispose().await,
            HandlerCommand::ForceDisconnect => {
                if matches!(
                    self.transport.ready_state(),
                    ReadyState::Connecting | ReadyState::Open
                ) {
                    debug!("Forcing transport disconnect");
                    self.close_or_discard().await;
                }
            }
        }
    }

    async fn transmit_transaction(&mut self, command: Command, transaction: String) {
        let headers = HeaderMap::from_iter([("transaction".to_string(), transaction)]);
        self.transmit(Frame::with_body(command, headers, FrameBody::Empty))
            .await;
    }

    async fn transmit_ack(
        &mut self,
        command: Command,
        ack_id: String,
        subscription: String,
        mut headers: HeaderMap,
    ) {
        if self.connected_version.as_deref() == Some(version::V1_2) {
            headers.set("id", ack_id);
        } else {
            headers.set("message-id", ack_id);
        }
        headers.set("subscription", subscription);
        self.transmit(Frame::with_body(command, headers, FrameBody::Empty))
            .await;
    }

    /// Graceful shutdown: DISCONNECT with a receipt, then close the socket
    /// when the receipt arrives. If the session never connected, just close.
    async fn dispose(&mut self) {
        if self.connected {
            let mut headers = self.config.disconnect_headers.clone();
            let receipt = match headers.get("receipt") {
                Some(receipt) => receipt.to_string(),
                None => {
                    let receipt = self.handle.next_id("close");
                    headers.set("receipt", receipt.clone());
                    receipt
                }
            };
            self.pending_disconnect_receipt = Some(receipt);
            self.transmit(Frame::with_body(
                Command::Disconnect,
                headers,
                FrameBody::Empty,
            ))
            .await;
        } else if matches!(
            self.transport.ready_state(),
            ReadyState::Connecting | ReadyState::Open
        ) {
            if let Err(err) = self.transport.close().await {
                debug!("Ignoring error during disconnect: {}", err);
            }
        }
    }

    async fn transmit(&mut self, frame: Frame) {
        let frame = frame.escaping(self.escape_header_values);
        debug!(">>> {}", frame);
        let wire = frame.serialize();

        if self.config.force_binary_frames || frame.body.is_binary() {
            if let Err(err) = self.transport.send_binary(wire).await {
                warn!("Failed to send frame: {}", err);
            }
            return;
        }

        match String::from_utf8(wire.to_vec()) {
            Ok(text) => {
                if self.config.split_large_frames && text.len() > self.config.max_chunk_size {
                    let chunks = chunk_text(&text, self.config.max_chunk_size);
                    debug!("Splitting frame into {} chunks", chunks.len());
                    for chunk in chunks {
                        if let Err(err) = self.transport.send_text(chunk).await {
                            warn!("Failed to send frame chunk: {}", err);
                            return;
                        }
                    }
                } else if let Err(err) = self.transport.send_text(&text).await {
                    warn!("Failed to send frame: {}", err);
                }
            }
            Err(err) => {
                let wire = Bytes::from(err.into_bytes());
                if let Err(err) = self.transport.send_binary(wire).await {
                    warn!("Failed to send frame: {}", err);
                }
            }
        }
    }

    fn cleanup(&mut self) {
        self.connected = false;
        let _ = self.connected_tx.send(None);
        self.pinger = None;
        self.ponger = None;
    }
}
