//! Client lifecycle: activation, reconnect loop, deactivation
//!
//! A [`Client`] owns the connect loop. `activate` spawns it; it runs
//! connection attempts (with the optional `before_connect` hook) and, on
//! loss, schedules the next attempt after `reconnect_delay`. `deactivate`
//! requests a graceful disconnect and resolves once the loop has fully
//! stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stompline_protocol::{Frame, HeaderMap};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::ClientCallbacks;
use crate::handler::{
    ConnectionHandler, InboundMessage, Publish, SessionHandle, Subscription, Transaction,
};
use crate::transport::{BoxedTransport, TcpTransport, TransportFactory};

/// Lifecycle state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    /// Connect loop running; connected or between attempts
    Active,
    /// Graceful shutdown in progress
    Deactivating,
    /// No connect loop running
    Inactive,
}

struct ClientInner {
    config: RwLock<ClientConfig>,
    callbacks: RwLock<ClientCallbacks>,
    transport_factory: RwLock<Option<TransportFactory>>,
    state_tx: watch::Sender<ActivationState>,
    session: Mutex<Option<SessionHandle>>,
    reconnect_cancel: Mutex<CancellationToken>,
    // Serializes activate/deactivate transitions
    lifecycle: Mutex<()>,
}

/// A STOMP client with automatic reconnection
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create an inactive client with the given configuration
    pub fn new(config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ActivationState::Inactive);
        Self {
            inner: Arc::new(ClientInner {
                config: RwLock::new(config),
                callbacks: RwLock::new(ClientCallbacks::default()),
                transport_factory: RwLock::new(None),
                state_tx,
                session: Mutex::new(None),
                reconnect_cancel: Mutex::new(CancellationToken::new()),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Replace the transport factory; applies from the next attempt
    pub fn set_transport_factory(&self, factory: TransportFactory) {
        *self
            .inner
            .transport_factory
            .write()
            .expect("factory lock poisoned") = Some(factory);
    }

    /// Mutate the callback set; applies from the next attempt
    pub fn configure_callbacks(&self, configure: impl FnOnce(&mut ClientCallbacks)) {
        let mut callbacks = self
            .inner
            .callbacks
            .write()
            .expect("callbacks lock poisoned");
        configure(&mut callbacks);
    }

    /// Mutate the configuration; connection-attempt settings apply from the
    /// next attempt, `reconnect_delay` from the next scheduling decision
    pub fn update_config(&self, update: impl FnOnce(&mut ClientConfig)) {
        let mut config = self.inner.config.write().expect("config lock poisoned");
        update(&mut config);
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> ClientConfig {
        self.inner
            .config
            .read()
            .expect("config lock poisoned")
            .clone()
    }

    /// Change the delay between reconnection attempts; zero disables them
    pub fn set_reconnect_delay(&self, delay: Duration) {
        self.update_config(|config| config.reconnect_delay = delay);
    }

    /// Change the heartbeat intervals offered on the next CONNECT
    pub fn set_heartbeat(&self, outgoing: Duration, incoming: Duration) {
        self.update_config(|config| {
            config.heartbeat_outgoing = outgoing;
            config.heartbeat_incoming = incoming;
        });
    }

    /// Replace the headers sent with DISCONNECT
    pub fn set_disconnect_headers(&self, headers: HeaderMap) {
        self.update_config(|config| config.disconnect_headers = headers);
    }

    /// Current activation state
    pub fn state(&self) -> ActivationState {
        *self.inner.state_tx.borrow()
    }

    /// Whether the connect loop is running
    pub fn active(&self) -> bool {
        self.state() == ActivationState::Active
    }

    /// Whether a broker session is currently established
    pub fn connected(&self) -> bool {
        self.session().map(|handle| handle.connected()).unwrap_or(false)
    }

    /// Protocol version negotiated by the current session, if connected
    pub fn connected_version(&self) -> Option<String> {
        self.session().and_then(|handle| handle.connected_version())
    }

    /// Start the connect loop.
    ///
    /// A no-op when already active; an error while a previous deactivation
    /// is still draining.
    pub fn activate(&self) -> Result<(), ClientError> {
        let _guard = self.inner.lifecycle.lock().expect("lifecycle lock poisoned");
        match self.state() {
            ActivationState::Deactivating => {
                debug!("Still DEACTIVATING, can not activate yet");
                Err(ClientError::StillDeactivating)
            }
            ActivationState::Active => {
                debug!("Already ACTIVE, ignoring request to activate");
                Ok(())
            }
            ActivationState::Inactive => {
                change_state(&self.inner, ActivationState::Active);
                let cancel = CancellationToken::new();
                *self
                    .inner
                    .reconnect_cancel
                    .lock()
                    .expect("cancel lock poisoned") = cancel.clone();
                let inner = Arc::clone(&self.inner);
                tokio::spawn(run_loop(inner, cancel));
                Ok(())
            }
        }
    }

    /// Gracefully stop: DISCONNECT with receipt, close the transport, halt
    /// the connect loop. Resolves once the client is fully INACTIVE. A
    /// no-op when not active.
    pub async fn deactivate(&self) -> Result<(), ClientError> {
        let handle;
        {
            let _guard = self.inner.lifecycle.lock().expect("lifecycle lock poisoned");
            let state = self.state();
            if state != ActivationState::Active {
                debug!("Already {:?}, ignoring call to deactivate", state);
                return Ok(());
            }
            change_state(&self.inner, ActivationState::Deactivating);
            self.inner
                .reconnect_cancel
                .lock()
                .expect("cancel lock poisoned")
                .cancel();
            handle = self.session();
        }

        if let Some(handle) = handle {
            let _ = handle.dispose();
        }
        // Only the connect loop transitions to INACTIVE; wait for it to
        // confirm. With no session handle the loop is mid-attempt or between
        // attempts, and picks the transition up from the cancelled token or
        // its own state re-checks.
        let mut state_rx = self.inner.state_tx.subscribe();
        while *state_rx.borrow_and_update() != ActivationState::Inactive {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Sever the transport without a DISCONNECT frame. The connect loop
    /// stays active, so reconnection proceeds as after any other loss.
    pub fn force_disconnect(&self) -> Result<(), ClientError> {
        self.require_session()?.force_disconnect()
    }

    /// Send a message
    pub fn publish(&self, publish: Publish) -> Result<(), ClientError> {
        self.require_session()?.publish(publish)
    }

    /// Register a callback and send SUBSCRIBE. When `headers` carries no
    /// `id`, one is generated.
    pub fn subscribe(
        &self,
        destination: &str,
        headers: HeaderMap,
        callback: impl FnMut(InboundMessage) + Send + 'static,
    ) -> Result<Subscription, ClientError> {
        self.require_session()?
            .subscribe(destination, headers, Box::new(callback))
    }

    /// Drop the callback for `id` and send UNSUBSCRIBE
    pub fn unsubscribe(&self, id: &str, headers: HeaderMap) -> Result<(), ClientError> {
        self.require_session()?.unsubscribe(id, headers)
    }

    /// Open a transaction; generates a `tx-{n}` id when none is given
    pub fn begin(&self, transaction: Option<&str>) -> Result<Transaction, ClientError> {
        self.require_session()?.begin(transaction)
    }

    /// Commit a transaction by id
    pub fn commit(&self, transaction: &str) -> Result<(), ClientError> {
        self.require_session()?.commit(transaction)
    }

    /// Abort a transaction by id
    pub fn abort(&self, transaction: &str) -> Result<(), ClientError> {
        self.require_session()?.abort(transaction)
    }

    /// Acknowledge a message by its ack id
    pub fn ack(
        &self,
        ack_id: &str,
        subscription: &str,
        headers: HeaderMap,
    ) -> Result<(), ClientError> {
        self.require_session()?.ack(ack_id, subscription, headers)
    }

    /// Reject a message by its ack id
    pub fn nack(
        &self,
        ack_id: &str,
        subscription: &str,
        headers: HeaderMap,
    ) -> Result<(), ClientError> {
        self.require_session()?.nack(ack_id, subscription, headers)
    }

    /// Fire `callback` once when a RECEIPT with `receipt_id` arrives
    pub fn watch_for_receipt(
        &self,
        receipt_id: &str,
        callback: impl FnOnce(&Frame) + Send + 'static,
    ) -> Result<(), ClientError> {
        self.require_session()?
            .watch_for_receipt(receipt_id, Box::new(callback))
    }

    fn session(&self) -> Option<SessionHandle> {
        self.inner
            .session
            .lock()
            .expect("session lock poisoned")
            .clone()
    }

    fn require_session(&self) -> Result<SessionHandle, ClientError> {
        self.session().ok_or(ClientError::NotConnected)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

fn change_state(inner: &ClientInner, next: ActivationState) {
    let changed = inner.state_tx.send_if_modified(|state| {
        if *state != next {
            *state = next;
            true
        } else {
            false
        }
    });
    if changed {
        debug!("Client state is now {:?}", next);
        let callback = inner
            .callbacks
            .read()
            .expect("callbacks lock poisoned")
            .on_change_state
            .clone();
        callback(next);
    }
}

async fn run_loop(inner: Arc<ClientInner>, cancel: CancellationToken) {
    loop {
        let before_connect = inner
            .callbacks
            .read()
            .expect("callbacks lock poisoned")
            .before_connect
            .clone();
        before_connect().await;

        // The hook may have taken a while; deactivate could have landed
        if *inner.state_tx.borrow() != ActivationState::Active {
            debug!("Client no longer ACTIVE, abandoning connect attempt");
            change_state(&inner, ActivationState::Inactive);
            break;
        }

        let config = inner.config.read().expect("config lock poisoned").clone();
        let factory = inner
            .transport_factory
            .read()
            .expect("factory lock poisoned")
            .clone();

        info!("Opening transport to {}", config.broker_addr);
        let transport = match factory {
            Some(factory) => factory().await,
            None => TcpTransport::connect(&config.broker_addr)
                .await
                .map(|transport| Box::new(transport) as BoxedTransport),
        };

        match transport {
            Ok(mut transport) => {
                // deactivate may have landed while the factory was pending
                if *inner.state_tx.borrow() != ActivationState::Active {
                    debug!("Client no longer ACTIVE, dropping the fresh transport");
                    if let Err(err) = transport.close().await {
                        debug!("Ignoring error closing abandoned transport: {}", err);
                    }
                    change_state(&inner, ActivationState::Inactive);
                    break;
                }
                let callbacks = snapshot_callbacks(&inner);
                let (handler, handle) = ConnectionHandler::new(config, callbacks, transport);
                *inner.session.lock().expect("session lock poisoned") = Some(handle.clone());
                // A deactivate that read the session slot before the handle
                // landed there could not dispose it; finish that here.
                if *inner.state_tx.borrow() != ActivationState::Active {
                    let _ = handle.dispose();
                }

                let close_info = handler.run().await;

                inner.session.lock().expect("session lock poisoned").take();
                debug!(
                    "Transport closed: code {}, clean {}",
                    close_info.code, close_info.clean
                );
                let on_socket_close = inner
                    .callbacks
                    .read()
                    .expect("callbacks lock poisoned")
                    .on_socket_close
                    .clone();
                on_socket_close(&close_info);
            }
            Err(err) => {
                warn!("Failed to open transport: {}", err);
                let on_socket_error = inner
                    .callbacks
                    .read()
                    .expect("callbacks lock poisoned")
                    .on_socket_error
                    .clone();
                on_socket_error(&err.to_string());
            }
        }

        // Copy the state out so the watch read guard drops before
        // change_state needs the write half of the same lock.
        let state = *inner.state_tx.borrow();
        match state {
            ActivationState::Deactivating => {
                change_state(&inner, ActivationState::Inactive);
                break;
            }
            ActivationState::Inactive => break,
            ActivationState::Active => {}
        }

        let delay = inner
            .config
            .read()
            .expect("config lock poisoned")
            .reconnect_delay;
        if delay.is_zero() {
            debug!("Reconnection disabled, connect loop stopping");
            change_state(&inner, ActivationState::Inactive);
            break;
        }

        info!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Reconnect wait cancelled");
                change_state(&inner, ActivationState::Inactive);
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Snapshot the callbacks for one attempt, wrapping `on_connect` so a
/// deactivate issued while the handshake was in flight turns the fresh
/// session straight into a graceful disconnect.
fn snapshot_callbacks(inner: &Arc<ClientInner>) -> ClientCallbacks {
    let mut callbacks = inner
        .callbacks
        .read()
        .expect("callbacks lock poisoned")
        .clone();
    let user_on_connect = callbacks.on_connect.clone();
    let state_rx = inner.state_tx.subscribe();
    let inner_for_connect = Arc::clone(inner);
    let disconnect_issued = AtomicBool::new(false);
    callbacks.on_connect = Arc::new(move |frame| {
        if *state_rx.borrow() != ActivationState::Active {
            if !disconnect_issued.swap(true, Ordering::SeqCst) {
                debug!("Connected while deactivate was issued, disconnecting now");
                let handle = inner_for_connect
                    .session
                    .lock()
                    .expect("session lock poisoned")
                    .clone();
                if let Some(handle) = handle {
                    let _ = handle.dispose();
                }
            }
            return;
        }
        user_on_connect(frame);
    });
    callbacks
}
