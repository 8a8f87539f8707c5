//! End-to-end session scenarios against an in-memory transport
//!
//! The mock transport is a pair of channels; the test plays the broker
//! side, decoding outgoing chunks with the wire parser and injecting
//! responses. Tests run on a paused clock so heartbeat and reconnect
//! timing is deterministic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use stompline_client::{
    ActivationState, BoxedTransport, Client, ClientConfig, ClientError, CloseInfo, CompatClient,
    InboundMessage, LegacyConnectArg, Publish, ReadyState, Transport, TransportEvent,
    TransportFactory,
};
use stompline_protocol::{HeaderMap, ParseEvent, Parser, RawFrame};

struct MockTransport {
    state: ReadyState,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    outgoing: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.send_binary(Bytes::copy_from_slice(text.as_bytes())).await
    }

    async fn send_binary(&mut self, data: Bytes) -> Result<(), ClientError> {
        if self.state != ReadyState::Open {
            return Err(ClientError::Transport("transport closed".to_string()));
        }
        self.outgoing
            .send(data)
            .map_err(|_| ClientError::Transport("broker side dropped".to_string()))
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        if self.state == ReadyState::Open {
            self.state = ReadyState::Closing;
            let _ = self.event_tx.send(TransportEvent::Closed(CloseInfo::clean()));
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
        self.state = ReadyState::Closed;
        let _ = self
            .event_tx
            .send(TransportEvent::Closed(CloseInfo::discarded()));
    }
}

/// The broker end of one mock transport
struct BrokerSide {
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    outgoing: mpsc::UnboundedReceiver<Bytes>,
    parser: Parser,
}

impl BrokerSide {
    fn send_raw(&self, raw: &str) {
        let _ = self
            .event_tx
            .send(TransportEvent::Data(Bytes::copy_from_slice(raw.as_bytes())));
    }

    fn drop_connection(&self) {
        let _ = self.event_tx.send(TransportEvent::Closed(CloseInfo {
            code: 1006,
            reason: "broker went away".to_string(),
            clean: false,
        }));
    }

    /// Decode the next outgoing chunk into parse events
    async fn recv_events(&mut self) -> Vec<ParseEvent> {
        let chunk = self.outgoing.recv().await.expect("client closed transport");
        self.parser.parse_chunk(&chunk, false)
    }

    /// Next complete outgoing frame, skipping heartbeats
    async fn expect_frame(&mut self) -> RawFrame {
        loop {
            for event in self.recv_events().await {
                if let ParseEvent::Frame(raw) = event {
                    return raw;
                }
            }
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn header<'a>(raw: &'a RawFrame, name: &str) -> Option<&'a str> {
    raw.headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// A factory handing out fresh mock transports; each attempt surfaces its
/// broker side on the returned channel.
fn mock_factory() -> (TransportFactory, mpsc::UnboundedReceiver<BrokerSide>) {
    let (broker_tx, broker_rx) = mpsc::unbounded_channel();
    let factory: TransportFactory = Arc::new(move || {
        let broker_tx = broker_tx.clone();
        Box::pin(async move {
            let (event_tx, events) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let _ = event_tx.send(TransportEvent::Open);
            let _ = broker_tx.send(BrokerSide {
                event_tx: event_tx.clone(),
                outgoing: out_rx,
                parser: Parser::new(),
            });
            Ok(Box::new(MockTransport {
                state: ReadyState::Open,
                events,
                event_tx,
                outgoing: out_tx,
            }) as BoxedTransport)
        })
    });
    (factory, broker_rx)
}

fn quiet_config() -> ClientConfig {
    ClientConfig {
        heartbeat_outgoing: Duration::ZERO,
        heartbeat_incoming: Duration::ZERO,
        reconnect_delay: Duration::ZERO,
        ..ClientConfig::default()
    }
}

fn client_with(config: ClientConfig) -> (Client, mpsc::UnboundedReceiver<BrokerSide>) {
    init_tracing();
    let (factory, brokers) = mock_factory();
    let client = Client::new(config);
    client.set_transport_factory(factory);
    (client, brokers)
}

#[tokio::test(start_paused = true)]
async fn connect_publish_and_graceful_disconnect() {
    let (client, mut brokers) = client_with(quiet_config());

    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    client.configure_callbacks(|callbacks| {
        callbacks.on_connect = Arc::new(move |frame| {
            let version = frame.headers.get("version").unwrap_or("").to_string();
            let _ = connected_tx.send(version);
        });
    });

    client.activate().unwrap();
    let mut broker = brokers.recv().await.unwrap();

    let connect = broker.expect_frame().await;
    assert_eq!(connect.command, "CONNECT");
    assert_eq!(header(&connect, "accept-version"), Some("1.0,1.1,1.2"));
    assert_eq!(header(&connect, "heart-beat"), Some("0,0"));

    broker.send_raw("CONNECTED\nversion:1.2\nserver:mock/1.0\n\n\0");
    assert_eq!(connected_rx.recv().await.unwrap(), "1.2");
    assert!(client.connected());
    assert_eq!(client.connected_version().as_deref(), Some("1.2"));

    // 1.2 session: header values go out escaped
    let mut headers = HeaderMap::new();
    headers.set("tag", "a:b");
    client
        .publish(Publish::text("/queue/x", "hi").headers(headers))
        .unwrap();
    let send = broker.expect_frame().await;
    assert_eq!(send.command, "SEND");
    assert_eq!(header(&send, "destination"), Some("/queue/x"));
    assert_eq!(header(&send, "tag"), Some("a\\cb"));
    assert_eq!(header(&send, "content-length"), Some("2"));
    assert_eq!(send.body.as_ref(), b"hi");

    // Graceful shutdown waits for the disconnect receipt
    let closer = {
        let client = client.clone();
        tokio::spawn(async move { client.deactivate().await })
    };
    let disconnect = broker.expect_frame().await;
    assert_eq!(disconnect.command, "DISCONNECT");
    let receipt = header(&disconnect, "receipt").unwrap().to_string();
    assert!(receipt.starts_with("close-"));
    broker.send_raw(&format!("RECEIPT\nreceipt-id:{}\n\n\0", receipt));

    closer.await.unwrap().unwrap();
    assert_eq!(client.state(), ActivationState::Inactive);
    assert!(!client.connected());
}

#[tokio::test(start_paused = true)]
async fn messages_route_to_subscriptions() {
    let (client, mut brokers) = client_with(quiet_config());

    let (unhandled_tx, mut unhandled_rx) = mpsc::unbounded_channel();
    client.configure_callbacks(|callbacks| {
        callbacks.on_unhandled_message = Arc::new(move |message: InboundMessage| {
            let _ = unhandled_tx.send(message.subscription().to_string());
        });
    });

    client.activate().unwrap();
    let mut broker = brokers.recv().await.unwrap();
    broker.expect_frame().await; // CONNECT
    broker.send_raw("CONNECTED\nversion:1.1\n\n\0");

    let (message_tx, mut message_rx) = mpsc::unbounded_channel();
    let subscription = client
        .subscribe("/topic/news", HeaderMap::new(), move |message| {
            let _ = message_tx.send(message);
        })
        .unwrap();
    assert_eq!(subscription.id, "sub-0");

    let subscribe = broker.expect_frame().await;
    assert_eq!(subscribe.command, "SUBSCRIBE");
    assert_eq!(header(&subscribe, "id"), Some("sub-0"));
    assert_eq!(header(&subscribe, "destination"), Some("/topic/news"));

    broker.send_raw(
        "MESSAGE\nsubscription:sub-0\nmessage-id:m1\ndestination:/topic/news\n\nbreaking\0",
    );
    let message = message_rx.recv().await.unwrap();
    assert_eq!(message.frame.body.as_bytes(), b"breaking");

    // Pre-1.2 sessions ack by message-id
    message.ack(HeaderMap::new()).unwrap();
    let ack = broker.expect_frame().await;
    assert_eq!(ack.command, "ACK");
    assert_eq!(header(&ack, "message-id"), Some("m1"));
    assert_eq!(header(&ack, "subscription"), Some("sub-0"));

    // Unknown subscription id falls through to the unhandled hook
    broker.send_raw("MESSAGE\nsubscription:sub-99\nmessage-id:m2\n\nlost\0");
    assert_eq!(unhandled_rx.recv().await.unwrap(), "sub-99");

    subscription.unsubscribe(HeaderMap::new()).unwrap();
    let unsubscribe = broker.expect_frame().await;
    assert_eq!(unsubscribe.command, "UNSUBSCRIBE");
    assert_eq!(header(&unsubscribe, "id"), Some("sub-0"));
}

#[tokio::test(start_paused = true)]
async fn transactions_and_receipts() {
    let (client, mut brokers) = client_with(quiet_config());
    client.activate().unwrap();
    let mut broker = brokers.recv().await.unwrap();
    broker.expect_frame().await; // CONNECT
    broker.send_raw("CONNECTED\nversion:1.1\n\n\0");
    // Wait until the handshake is processed
    let transaction = loop {
        match client.begin(None) {
            Ok(transaction) => break transaction,
            Err(_) => tokio::time::sleep(Duration::from_millis(1)).await,
        }
    };
    assert_eq!(transaction.id, "tx-0");

    let begin = broker.expect_frame().await;
    assert_eq!(begin.command, "BEGIN");
    assert_eq!(header(&begin, "transaction"), Some("tx-0"));

    transaction.commit().unwrap();
    let commit = broker.expect_frame().await;
    assert_eq!(commit.command, "COMMIT");
    assert_eq!(header(&commit, "transaction"), Some("tx-0"));

    let (receipt_tx, mut receipt_rx) = mpsc::unbounded_channel();
    client
        .watch_for_receipt("r7", move |frame| {
            let _ = receipt_tx.send(frame.headers.get("receipt-id").unwrap_or("").to_string());
        })
        .unwrap();
    // Commands are processed in order: once the broker sees this SEND, the
    // receipt watcher registered before it is in place.
    client.publish(Publish::text("/queue/marker", "m")).unwrap();
    assert_eq!(broker.expect_frame().await.command, "SEND");
    broker.send_raw("RECEIPT\nreceipt-id:r7\n\n\0");
    assert_eq!(receipt_rx.recv().await.unwrap(), "r7");
}

#[tokio::test(start_paused = true)]
async fn stale_server_triggers_reconnect() {
    let mut config = quiet_config();
    config.heartbeat_incoming = Duration::from_millis(100);
    config.reconnect_delay = Duration::from_millis(50);
    let (client, mut brokers) = client_with(config);

    client.activate().unwrap();
    let mut broker = brokers.recv().await.unwrap();
    let connect = broker.expect_frame().await;
    assert_eq!(header(&connect, "heart-beat"), Some("0,100"));

    // Server promises heartbeats every 100ms, then goes silent; the client
    // declares the connection dead after two missed periods and reconnects.
    broker.send_raw("CONNECTED\nversion:1.1\nheart-beat:100,0\n\n\0");

    let mut second = brokers.recv().await.unwrap();
    let reconnect = second.expect_frame().await;
    assert_eq!(reconnect.command, "CONNECT");

    second.send_raw("CONNECTED\nversion:1.1\n\n\0");
    while !client.connected() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let closer = {
        let client = client.clone();
        tokio::spawn(async move { client.deactivate().await })
    };
    let disconnect = second.expect_frame().await;
    assert_eq!(disconnect.command, "DISCONNECT");
    second.send_raw(&format!(
        "RECEIPT\nreceipt-id:{}\n\n\0",
        header(&disconnect, "receipt").unwrap()
    ));
    closer.await.unwrap().unwrap();
    assert_eq!(client.state(), ActivationState::Inactive);
}

#[tokio::test(start_paused = true)]
async fn client_sends_pings_when_negotiated() {
    let mut config = quiet_config();
    config.heartbeat_outgoing = Duration::from_millis(100);
    let (client, mut brokers) = client_with(config);

    client.activate().unwrap();
    let mut broker = brokers.recv().await.unwrap();
    broker.expect_frame().await; // CONNECT
    broker.send_raw("CONNECTED\nversion:1.2\nheart-beat:0,100\n\n\0");

    // The next outgoing traffic is a lone LF heartbeat
    let mut saw_ping = false;
    for _ in 0..3 {
        for event in broker.recv_events().await {
            if matches!(event, ParseEvent::Ping) {
                saw_ping = true;
            }
        }
        if saw_ping {
            break;
        }
    }
    assert!(saw_ping);
    drop(client);
}

#[tokio::test(start_paused = true)]
async fn broker_drop_reconnects_and_resumes() {
    let mut config = quiet_config();
    config.reconnect_delay = Duration::from_millis(200);
    let (client, mut brokers) = client_with(config);

    let (close_tx, mut close_rx) = mpsc::unbounded_channel();
    client.configure_callbacks(|callbacks| {
        callbacks.on_socket_close = Arc::new(move |info: &CloseInfo| {
            let _ = close_tx.send(info.code);
        });
    });

    client.activate().unwrap();
    let mut broker = brokers.recv().await.unwrap();
    broker.expect_frame().await;
    broker.send_raw("CONNECTED\nversion:1.1\n\n\0");

    broker.drop_connection();
    assert_eq!(close_rx.recv().await.unwrap(), 1006);

    // A new attempt follows after the reconnect delay
    let mut second = brokers.recv().await.unwrap();
    let connect = second.expect_frame().await;
    assert_eq!(connect.command, "CONNECT");
}

#[tokio::test(start_paused = true)]
async fn deactivate_during_pending_connect_attempt() {
    init_tracing();
    let (inner_factory, mut brokers) = mock_factory();
    // A factory that takes a while, so deactivate can land mid-attempt
    let factory: TransportFactory = Arc::new(move || {
        let inner = inner_factory.clone();
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            inner().await
        })
    });
    let client = Client::new(quiet_config());
    client.set_transport_factory(factory);

    client.activate().unwrap();
    // Let the connect loop reach the factory await
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.deactivate().await.unwrap();
    assert_eq!(client.state(), ActivationState::Inactive);

    // The in-flight attempt must not leave a live handler behind: its
    // transport is closed without a CONNECT ever being sent.
    let mut stale = brokers.recv().await.unwrap();
    assert!(stale.outgoing.recv().await.is_none());

    // A fresh activate gets a fresh attempt
    client.activate().unwrap();
    let mut broker = brokers.recv().await.unwrap();
    assert_eq!(broker.expect_frame().await.command, "CONNECT");
    client.deactivate().await.unwrap();
    assert_eq!(client.state(), ActivationState::Inactive);
}

#[tokio::test(start_paused = true)]
async fn connection_timeout_forces_reconnect() {
    let mut config = quiet_config();
    config.connection_timeout = Duration::from_millis(500);
    config.reconnect_delay = Duration::from_millis(50);
    let (client, mut brokers) = client_with(config);

    client.activate().unwrap();
    let mut broker = brokers.recv().await.unwrap();
    assert_eq!(broker.expect_frame().await.command, "CONNECT");

    // CONNECTED is withheld; the client tears the socket down after the
    // timeout and the next attempt follows.
    let mut second = brokers.recv().await.unwrap();
    assert_eq!(second.expect_frame().await.command, "CONNECT");

    client.deactivate().await.unwrap();
    assert_eq!(client.state(), ActivationState::Inactive);
}

#[tokio::test(start_paused = true)]
async fn comm_failure_discards_socket() {
    let mut config = quiet_config();
    config.heartbeat_incoming = Duration::from_millis(100);
    config.discard_on_comm_failure = true;
    let (client, mut brokers) = client_with(config);

    let (close_tx, mut close_rx) = mpsc::unbounded_channel();
    client.configure_callbacks(|callbacks| {
        callbacks.on_socket_close = Arc::new(move |info: &CloseInfo| {
            let _ = close_tx.send((info.code, info.clean));
        });
    });

    client.activate().unwrap();
    let mut broker = brokers.recv().await.unwrap();
    broker.expect_frame().await; // CONNECT
    broker.send_raw("CONNECTED\nversion:1.1\nheart-beat:100,0\n\n\0");

    // Silence past two heartbeat periods: the socket is discarded rather
    // than closed, surfacing the synthesized 4001 unclean close.
    let (code, clean) = close_rx.recv().await.unwrap();
    assert_eq!(code, 4001);
    assert!(!clean);
}

#[tokio::test(start_paused = true)]
async fn lifecycle_edge_cases() {
    let (client, mut brokers) = client_with(quiet_config());

    // Operations without a session fail fast
    assert!(matches!(
        client.publish(Publish::text("/queue/x", "hi")),
        Err(ClientError::NotConnected)
    ));

    // Deactivating an inactive client is a no-op
    client.deactivate().await.unwrap();
    assert_eq!(client.state(), ActivationState::Inactive);

    client.activate().unwrap();
    // Activating twice is a no-op
    client.activate().unwrap();
    assert_eq!(client.state(), ActivationState::Active);

    // Deactivate before CONNECTED: the socket closes without a DISCONNECT
    let mut broker = brokers.recv().await.unwrap();
    broker.expect_frame().await; // CONNECT
    client.deactivate().await.unwrap();
    assert_eq!(client.state(), ActivationState::Inactive);
}

#[tokio::test(start_paused = true)]
async fn compat_connect_and_send() {
    let (factory, mut brokers) = mock_factory();
    let compat = CompatClient::new(factory);
    assert_eq!(compat.reconnect_delay(), Duration::ZERO);
    compat.set_heartbeat(Duration::ZERO, Duration::ZERO);

    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    let on_connect: stompline_client::events::FrameCallback = Arc::new(move |_| {
        let _ = connected_tx.send(());
    });
    compat
        .connect(vec![
            LegacyConnectArg::Str("guest".to_string()),
            LegacyConnectArg::Str("secret".to_string()),
            LegacyConnectArg::Frame(on_connect),
        ])
        .unwrap();

    let mut broker = brokers.recv().await.unwrap();
    let connect = broker.expect_frame().await;
    assert_eq!(connect.command, "CONNECT");
    assert_eq!(header(&connect, "login"), Some("guest"));
    assert_eq!(header(&connect, "passcode"), Some("secret"));

    broker.send_raw("CONNECTED\nversion:1.1\n\n\0");
    connected_rx.recv().await.unwrap();

    // content-length:false suppresses the automatic header
    let mut headers = HeaderMap::new();
    headers.set("content-length", "false");
    compat.send("/queue/legacy", headers, "payload").unwrap();
    let send = broker.expect_frame().await;
    assert_eq!(send.command, "SEND");
    assert_eq!(header(&send, "content-length"), None);
    assert_eq!(send.body.as_ref(), b"payload");

    let closer = {
        let client = compat.client().clone();
        tokio::spawn(async move { client.deactivate().await })
    };
    let disconnect = broker.expect_frame().await;
    assert_eq!(disconnect.command, "DISCONNECT");
    broker.send_raw(&format!(
        "RECEIPT\nreceipt-id:{}\n\n\0",
        header(&disconnect, "receipt").unwrap()
    ));
    closer.await.unwrap().unwrap();
    assert!(!compat.connected());
}
