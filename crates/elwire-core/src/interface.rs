//! The caller-facing façade and its per-connection dispatch worker.
//!
//! An [`Interface`] owns one transport for its whole life. `start` spawns a
//! worker task that connects, performs the `server.version` handshake and
//! then feeds every inbound envelope through the router. Callers talk to the
//! server with [`Interface::send`] (callback based) or
//! [`Interface::synchronous_get`] (awaits ordered results).
//!
//! Callbacks run inline on whichever task delivered the reply: the worker
//! for socket traffic and polls, the sending task for replies an HTTP
//! exchange returns directly. They must not block.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::InterfaceConfig;
use crate::error::CoreError;
use crate::proxy::ProxyConfig;
use crate::registry::Registry;
use crate::router::{self, Delivery};
use crate::rpc::protocol::{server_error, Envelope, WireRequest};
use crate::rpc::{transport_for, Inbound, Transport};
use crate::types::{Callback, ConnectionState, Endpoint, Event, Message, Response};

const VERSION_METHOD: &str = "server.version";

/// Handle to one server connection. Clones share the same connection.
#[derive(Clone)]
pub struct Interface {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: InterfaceConfig,
    label: String,
    registry: Mutex<Registry>,
    state: watch::Sender<ConnectionState>,
    server_version: Mutex<Option<Value>>,
    version_callback: Callback,
    stop: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Interface {
    /// Build an interface for `endpoint`, picking the transport from its
    /// protocol. Nothing is dialed until [`start`](Self::start).
    pub fn new(
        endpoint: &Endpoint,
        proxy: Option<ProxyConfig>,
        config: InterfaceConfig,
    ) -> Result<Self, CoreError> {
        let transport = transport_for(endpoint, proxy.as_ref(), &config)?;
        Ok(Self::with_transport(transport, config))
    }

    /// Build an interface around an already constructed transport.
    pub fn with_transport(transport: Arc<dyn Transport>, config: InterfaceConfig) -> Self {
        let label = transport.describe();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            transport,
            config,
            label,
            registry: Mutex::new(Registry::default()),
            state,
            server_version: Mutex::new(None),
            version_callback: version_callback(weak.clone()),
            stop: Notify::new(),
            worker: Mutex::new(None),
        });
        Self { shared }
    }

    // ==========================================================================
    // Lifecycle
    // ==========================================================================

    /// Spawn the connection worker. Must be called from within a tokio
    /// runtime.
    ///
    /// Allowed only from `Disconnected`: a fresh interface, or one whose
    /// previous connection ended. Requests left unanswered by that previous
    /// connection are abandoned; subscriptions are kept and the id counter
    /// keeps counting.
    pub fn start(&self) -> Result<(), CoreError> {
        let shared = &self.shared;
        if !shared.advance(ConnectionState::Disconnected, ConnectionState::Connecting) {
            return Err(CoreError::AlreadyStarted);
        }

        let abandoned = lock(&shared.registry).pending.abandon_all();
        if abandoned > 0 {
            info!(
                endpoint = %shared.label,
                abandoned,
                "abandoning requests from previous connection"
            );
        }

        let handle = tokio::spawn(run(Arc::clone(shared)));
        *lock(&shared.worker) = Some(handle);
        Ok(())
    }

    /// Stop for good: close the transport, wait for the worker to exit, and
    /// send every subscriber the closed signal. No callback runs afterwards
    /// except that final signal.
    pub async fn stop(&self) {
        let shared = &self.shared;
        if shared.mark_stopped() {
            info!(endpoint = %shared.label, "stopping interface");
        }
        shared.stop.notify_one();
        shared.transport.close().await;

        let worker = lock(&shared.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(endpoint = %shared.label, error = %e, "connection worker panicked");
            }
        }
        self.stop_subscriptions();
    }

    /// Clear the subscription registry, invoking each subscriber once with
    /// [`Event::Closed`].
    pub fn stop_subscriptions(&self) {
        let subscribers = lock(&self.shared.registry).subscriptions.drain();
        debug!(subscribers = subscribers.len(), "closing subscriptions");
        for callback in subscribers {
            callback.call(Event::Closed);
        }
    }

    // ==========================================================================
    // Requests
    // ==========================================================================

    /// Register `messages` for `callback` and put them on the wire.
    ///
    /// Subscription methods are recorded even while disconnected, so they
    /// survive until the next connection. Returns the assigned ids in input
    /// order, or `None` when nothing was sent (not connected, or the write
    /// failed).
    pub async fn send(&self, messages: &[Message], callback: &Callback) -> Option<Vec<u64>> {
        self.shared.send(messages, callback).await
    }

    /// Re-send every registered subscription with its own callback, e.g.
    /// after a restart. Returns how many requests went out.
    pub async fn resubscribe(&self) -> usize {
        let entries = lock(&self.shared.registry).subscriptions.entries();
        let mut sent = 0;
        for (callback, requests) in entries {
            if let Some(ids) = self.shared.send(&requests, &callback).await {
                sent += ids.len();
            }
        }
        sent
    }

    /// Send `requests` and wait up to `timeout` for all of their replies.
    /// Results come back in request order.
    ///
    /// Subscription methods are answered once; the call does not stay
    /// subscribed, so later notifications go to regular subscribers.
    pub async fn synchronous_get(
        &self,
        requests: &[Message],
        timeout: Duration,
    ) -> Result<Vec<Value>, CoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
        let callback = Callback::new(move |event| {
            if let Event::Reply(response) = event {
                let _ = tx.send(response);
            }
        });
        let _unsubscribe = ForgetOnDrop {
            shared: &self.shared,
            callback: callback.clone(),
        };

        let ids = self
            .send(requests, &callback)
            .await
            .ok_or(CoreError::NotConnected)?;

        let mut replies: HashMap<u64, Response> = HashMap::with_capacity(ids.len());
        while replies.len() < ids.len() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(response)) => {
                    if let Some(id) = response.id.filter(|id| ids.contains(id)) {
                        replies.insert(id, response);
                    }
                }
                Ok(None) => return Err(CoreError::NotConnected),
                Err(_) => {
                    let outstanding: Vec<u64> = ids
                        .iter()
                        .copied()
                        .filter(|id| !replies.contains_key(id))
                        .collect();
                    lock(&self.shared.registry).pending.discard(&outstanding);
                    return Err(CoreError::Timeout {
                        waited: timeout,
                        outstanding: outstanding.len(),
                    });
                }
            }
        }

        ids.iter()
            .map(|id| {
                let response = replies.remove(id).ok_or(CoreError::NotConnected)?;
                match response.error {
                    Some(error) => Err(server_error(&error).into()),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                }
            })
            .collect()
    }

    // ==========================================================================
    // Accessors
    // ==========================================================================

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// `true` when no request is waiting for its reply.
    pub fn is_up_to_date(&self) -> bool {
        lock(&self.shared.registry).pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared.registry).pending.len()
    }

    /// Result of the last `server.version` exchange.
    pub fn server_version(&self) -> Option<Value> {
        lock(&self.shared.server_version).clone()
    }

    pub fn describe(&self) -> &str {
        &self.shared.label
    }

    pub fn bytes_received(&self) -> u64 {
        self.shared.transport.bytes_received()
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.shared.transport.round_trip_time()
    }
}

impl Shared {
    // ==========================================================================
    // State Transitions
    // ==========================================================================

    /// Compare-and-set `from -> to`. Returns whether this call made the
    /// change.
    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            info!(endpoint = %self.label, %from, %to, "connection state changed");
        }
        changed
    }

    /// Any live state becomes `Disconnected`; `Stopped` stays put.
    fn mark_disconnected(&self) -> bool {
        let mut previous = None;
        let changed = self.state.send_if_modified(|state| match *state {
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Running => {
                previous = Some(*state);
                *state = ConnectionState::Disconnected;
                true
            }
            ConnectionState::Disconnected | ConnectionState::Stopped => false,
        });
        if let Some(from) = previous {
            info!(
                endpoint = %self.label,
                %from,
                to = %ConnectionState::Disconnected,
                "connection state changed"
            );
        }
        changed
    }

    fn mark_stopped(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Stopped {
                false
            } else {
                *state = ConnectionState::Stopped;
                true
            }
        })
    }

    fn is_stopped(&self) -> bool {
        *self.state.borrow() == ConnectionState::Stopped
    }

    // ==========================================================================
    // Outbound
    // ==========================================================================

    /// Register the batch under the registry lock. Pending entries are only
    /// created while connected.
    fn register_outbound(
        &self,
        messages: &[Message],
        callback: &Callback,
    ) -> Option<(Vec<u64>, Vec<WireRequest>)> {
        let mut registry = lock(&self.registry);
        if !self.state.borrow().is_connected() {
            registry.register_subscriptions(messages, callback);
            debug!(
                endpoint = %self.label,
                rpc.batch_size = messages.len(),
                "not connected; batch not sent"
            );
            return None;
        }

        let ids = registry.register_batch(messages, callback);
        let requests = messages
            .iter()
            .zip(&ids)
            .map(|(message, &id)| WireRequest {
                id,
                method: message.method.clone(),
                params: message.params.clone(),
            })
            .collect();
        Some((ids, requests))
    }

    async fn send(&self, messages: &[Message], callback: &Callback) -> Option<Vec<u64>> {
        let (ids, requests) = self.register_outbound(messages, callback)?;
        if requests.is_empty() {
            return Some(ids);
        }

        for request in &requests {
            debug!(rpc.id = request.id, rpc.method = %request.method, "send");
        }
        match self.transport.send_batch(&requests).await {
            Ok(inline) => {
                self.dispatch(inline);
                Some(ids)
            }
            Err(err) => {
                warn!(endpoint = %self.label, error = %err, "failed to send batch");
                lock(&self.registry).pending.discard(&ids);
                None
            }
        }
    }

    async fn send_version(&self) {
        let message = Message::new(VERSION_METHOD, self.config.version_params());
        if self.send(&[message], &self.version_callback).await.is_none() {
            debug!(endpoint = %self.label, "server.version not sent");
        }
    }

    // ==========================================================================
    // Inbound
    // ==========================================================================

    fn dispatch(&self, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            let delivery = {
                let mut registry = lock(&self.registry);
                router::route(&mut registry, envelope)
            };
            if let Some(delivery) = delivery {
                self.deliver(delivery);
            }
        }
    }

    fn deliver(&self, delivery: Delivery) {
        if self.is_stopped() {
            debug!(rpc.method = %delivery.response.method, "stopped; reply discarded");
            return;
        }
        delivery.callback.call(Event::Reply(delivery.response));
    }

    /// Connect, handshake, then pump inbound traffic until the connection
    /// ends. `Ok` covers orderly endings (peer close, stop during setup).
    async fn session(&self) -> Result<(), CoreError> {
        self.transport.connect().await?;
        if !self.advance(ConnectionState::Connecting, ConnectionState::Connected) {
            return Ok(());
        }

        self.send_version().await;
        if !self.advance(ConnectionState::Connected, ConnectionState::Running) {
            return Ok(());
        }

        loop {
            match self.transport.receive().await? {
                Inbound::Messages(envelopes) => self.dispatch(envelopes),
                Inbound::Idle => {
                    debug!(endpoint = %self.label, "read timed out; probing server");
                    self.send_version().await;
                }
                Inbound::Closed => {
                    info!(endpoint = %self.label, "connection closed by peer");
                    return Ok(());
                }
            }
        }
    }
}

/// Body of the connection worker. Nothing escapes it: failures are logged
/// and end in `Disconnected` (or leave `Stopped` untouched).
async fn run(shared: Arc<Shared>) {
    let outcome = tokio::select! {
        _ = shared.stop.notified() => Ok(()),
        result = shared.session() => result,
    };
    if let Err(err) = outcome {
        warn!(endpoint = %shared.label, error = %err, "connection failed");
    }

    shared.transport.close().await;
    shared.mark_disconnected();
}

/// Drops a one-shot callback's subscriptions however the call ends,
/// including when its future is cancelled.
struct ForgetOnDrop<'a> {
    shared: &'a Shared,
    callback: Callback,
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        lock(&self.shared.registry)
            .subscriptions
            .remove(&self.callback);
    }
}

fn version_callback(shared: Weak<Shared>) -> Callback {
    Callback::new(move |event| {
        let Event::Reply(response) = event else {
            return;
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if let Some(error) = response.error {
            warn!(endpoint = %shared.label, %error, "server.version failed");
            return;
        }
        if let Some(version) = response.result {
            debug!(endpoint = %shared.label, server.version = %version, "server version");
            *lock(&shared.server_version) = Some(version);
        }
    })
}
