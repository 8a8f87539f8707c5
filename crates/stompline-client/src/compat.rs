//! Legacy-API facade
//!
//! Wraps [`Client`] behind the older calling conventions: positional
//! connect arguments, a 16 KiB split threshold, and reconnection off by
//! default. New code should use [`Client`] directly.

use std::time::Duration;

use stompline_protocol::{Frame, FrameBody, HeaderMap};

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::{CloseCallback, FrameCallback, MessageCallback};
use crate::handler::{InboundMessage, Publish, Subscription};
use crate::transport::TransportFactory;

/// One positional argument of the legacy `connect` call
pub enum LegacyConnectArg {
    /// A credential or host string (login, passcode, or vhost)
    Str(String),
    /// A header map, only valid as the first argument
    Headers(HeaderMap),
    /// A frame callback (connect or error slot, by position)
    Frame(FrameCallback),
    /// A close callback
    Close(CloseCallback),
}

#[derive(Default)]
struct ParsedConnect {
    headers: HeaderMap,
    on_connect: Option<FrameCallback>,
    on_error: Option<FrameCallback>,
    on_close: Option<CloseCallback>,
}

/// Disambiguate the two historical `connect` signatures by the type of the
/// second argument:
///
/// * `(headers, on_connect, on_error?, on_close?)` when it is a callback
/// * `(login, passcode, on_connect, on_error?, on_close?, host?)` otherwise
fn parse_connect_args(args: Vec<LegacyConnectArg>) -> Result<ParsedConnect, ClientError> {
    if args.len() < 2 {
        return Err(ClientError::BadConnectArgs(
            "connect requires at least two arguments",
        ));
    }
    let header_form = matches!(args.get(1), Some(LegacyConnectArg::Frame(_)));
    let mut parsed = ParsedConnect::default();

    if header_form {
        for (idx, arg) in args.into_iter().enumerate() {
            match (idx, arg) {
                (0, LegacyConnectArg::Headers(headers)) => parsed.headers = headers,
                (1, LegacyConnectArg::Frame(callback)) => parsed.on_connect = Some(callback),
                (2, LegacyConnectArg::Frame(callback)) => parsed.on_error = Some(callback),
                (3, LegacyConnectArg::Close(callback)) => parsed.on_close = Some(callback),
                _ => {
                    return Err(ClientError::BadConnectArgs(
                        "expected (headers, on_connect, on_error?, on_close?)",
                    ))
                }
            }
        }
    } else {
        for (idx, arg) in args.into_iter().enumerate() {
            match (idx, arg) {
                (0, LegacyConnectArg::Str(login)) => parsed.headers.set("login", login),
                (1, LegacyConnectArg::Str(passcode)) => parsed.headers.set("passcode", passcode),
                (2, LegacyConnectArg::Frame(callback)) => parsed.on_connect = Some(callback),
                (3, LegacyConnectArg::Frame(callback)) => parsed.on_error = Some(callback),
                (4, LegacyConnectArg::Close(callback)) => parsed.on_close = Some(callback),
                (5, LegacyConnectArg::Str(host)) => parsed.headers.set("host", host),
                _ => {
                    return Err(ClientError::BadConnectArgs(
                        "expected (login, passcode, on_connect, on_error?, on_close?, host?)",
                    ))
                }
            }
        }
    }
    Ok(parsed)
}

/// Drop-in adapter for applications written against the legacy API
pub struct CompatClient {
    client: Client,
}

impl CompatClient {
    /// Wrap a transport factory with the legacy defaults: frame splitting
    /// at 16 KiB and no automatic reconnection.
    pub fn new(factory: TransportFactory) -> Self {
        let config = ClientConfig {
            split_large_frames: true,
            max_chunk_size: 16 * 1024,
            reconnect_delay: Duration::ZERO,
            ..ClientConfig::default()
        };
        let client = Client::new(config);
        client.set_transport_factory(factory);
        Self { client }
    }

    /// The wrapped modern client, for callers migrating incrementally
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Legacy positional connect; see [`LegacyConnectArg`] for the accepted
    /// argument shapes. Activates the client.
    pub fn connect(&self, args: Vec<LegacyConnectArg>) -> Result<(), ClientError> {
        let parsed = parse_connect_args(args)?;
        self.client.configure_callbacks(|callbacks| {
            if let Some(on_connect) = parsed.on_connect {
                callbacks.on_connect = on_connect;
            }
            if let Some(on_error) = parsed.on_error {
                callbacks.on_stomp_error = on_error;
            }
            if let Some(on_close) = parsed.on_close {
                callbacks.on_socket_close = on_close;
            }
        });
        self.client
            .update_config(|config| config.connect_headers = parsed.headers);
        self.client.activate()
    }

    /// Legacy disconnect: optional completion callback, then deactivate
    pub async fn disconnect(
        &self,
        callback: Option<FrameCallback>,
        headers: HeaderMap,
    ) -> Result<(), ClientError> {
        if let Some(callback) = callback {
            self.client
                .configure_callbacks(|callbacks| callbacks.on_disconnect = callback);
        }
        self.client.set_disconnect_headers(headers);
        self.client.deactivate().await
    }

    /// Legacy send. A `content-length: false` header suppresses the
    /// automatic content-length instead of being sent.
    pub fn send(
        &self,
        destination: &str,
        mut headers: HeaderMap,
        body: &str,
    ) -> Result<(), ClientError> {
        let skip_content_length = headers.get("content-length") == Some("false");
        if skip_content_length {
            headers.remove("content-length");
        }
        self.client.publish(Publish {
            destination: destination.to_string(),
            headers,
            body: FrameBody::Text(body.to_string()),
            skip_content_length,
        })
    }

    /// Legacy subscribe; same semantics as [`Client::subscribe`]
    pub fn subscribe(
        &self,
        destination: &str,
        headers: HeaderMap,
        callback: impl FnMut(InboundMessage) + Send + 'static,
    ) -> Result<Subscription, ClientError> {
        self.client.subscribe(destination, headers, callback)
    }

    /// Legacy unsubscribe by id
    pub fn unsubscribe(&self, id: &str, headers: HeaderMap) -> Result<(), ClientError> {
        self.client.unsubscribe(id, headers)
    }

    /// Fallback handler for messages no subscription matches
    pub fn set_onreceive(&self, callback: MessageCallback) {
        self.client
            .configure_callbacks(|callbacks| callbacks.on_unhandled_message = callback);
    }

    /// Fallback handler for receipts nobody watched for
    pub fn set_onreceipt(&self, callback: FrameCallback) {
        self.client
            .configure_callbacks(|callbacks| callbacks.on_unhandled_receipt = callback);
    }

    /// Fire `callback` once when the matching RECEIPT arrives
    pub fn watch_for_receipt(
        &self,
        receipt_id: &str,
        callback: impl FnOnce(&Frame) + Send + 'static,
    ) -> Result<(), ClientError> {
        self.client.watch_for_receipt(receipt_id, callback)
    }

    /// Delay between reconnection attempts; zero means disabled
    pub fn reconnect_delay(&self) -> Duration {
        self.client.config().reconnect_delay
    }

    /// Enable or disable automatic reconnection
    pub fn set_reconnect_delay(&self, delay: Duration) {
        self.client.set_reconnect_delay(delay);
    }

    /// Heartbeat intervals as `(outgoing, incoming)`
    pub fn heartbeat(&self) -> (Duration, Duration) {
        let config = self.client.config();
        (config.heartbeat_outgoing, config.heartbeat_incoming)
    }

    /// Change the heartbeat intervals offered on the next CONNECT
    pub fn set_heartbeat(&self, outgoing: Duration, incoming: Duration) {
        self.client.set_heartbeat(outgoing, incoming);
    }

    /// Negotiated protocol version of the current session
    pub fn version(&self) -> Option<String> {
        self.client.connected_version()
    }

    /// Whether a broker session is established
    pub fn connected(&self) -> bool {
        self.client.connected()
    }
}
