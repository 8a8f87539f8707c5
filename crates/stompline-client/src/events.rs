//! Callback surface of the client
//!
//! Every hook has a no-op default, so applications register only what they
//! care about. Callbacks are `Arc`ed so the connect loop can snapshot them
//! per attempt; changes between attempts apply to the next attempt.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use stompline_protocol::Frame;

use crate::client::ActivationState;
use crate::handler::InboundMessage;
use crate::transport::CloseInfo;

/// Callback receiving a decoded frame
pub type FrameCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Callback receiving an inbound MESSAGE with its ack handle
pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Callback receiving the transport close details
pub type CloseCallback = Arc<dyn Fn(&CloseInfo) + Send + Sync>;

/// Callback receiving a transport error description
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback receiving activation state changes
pub type StateCallback = Arc<dyn Fn(ActivationState) + Send + Sync>;

/// Async hook awaited before every connection attempt
pub type BeforeConnectHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-subscription message callback, owned by the connection handler
pub type SubscriptionCallback = Box<dyn FnMut(InboundMessage) + Send>;

/// One-shot callback fired when a watched receipt arrives
pub type ReceiptCallback = Box<dyn FnOnce(&Frame) + Send>;

/// All client lifecycle and fallback hooks
#[derive(Clone)]
pub struct ClientCallbacks {
    /// Awaited before each connection attempt; refresh tokens here
    pub before_connect: BeforeConnectHook,
    /// Broker accepted the session (CONNECTED received)
    pub on_connect: FrameCallback,
    /// Graceful disconnect completed (DISCONNECT receipt received)
    pub on_disconnect: FrameCallback,
    /// Broker sent an ERROR frame
    pub on_stomp_error: FrameCallback,
    /// MESSAGE whose subscription id matches no registered subscription
    pub on_unhandled_message: MessageCallback,
    /// RECEIPT nobody watched for
    pub on_unhandled_receipt: FrameCallback,
    /// Frame with a command the dispatcher has no slot for
    pub on_unhandled_frame: FrameCallback,
    /// Underlying transport closed, cleanly or not
    pub on_socket_close: CloseCallback,
    /// Underlying transport reported an error
    pub on_socket_error: ErrorCallback,
    /// Activation state transitioned
    pub on_change_state: StateCallback,
}

impl Default for ClientCallbacks {
    fn default() -> Self {
        Self {
            before_connect: Arc::new(|| Box::pin(async {})),
            on_connect: Arc::new(|_| {}),
            on_disconnect: Arc::new(|_| {}),
            on_stomp_error: Arc::new(|_| {}),
            on_unhandled_message: Arc::new(|_| {}),
            on_unhandled_receipt: Arc::new(|_| {}),
            on_unhandled_frame: Arc::new(|_| {}),
            on_socket_close: Arc::new(|_| {}),
            on_socket_error: Arc::new(|_| {}),
            on_change_state: Arc::new(|_| {}),
        }
    }
}

impl fmt::Debug for ClientCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCallbacks").finish_non_exhaustive()
    }
}
