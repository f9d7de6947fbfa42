//! Transport abstraction layer.
//!
//! Defines the [`Transport`] capability trait shared by the persistent
//! socket transport ([`TcpTransport`], plain or TLS, optionally proxied) and
//! the session-based HTTP poller ([`HttpPoller`]), plus a scripted test
//! double (`mock::MockTransport`).

mod http_adapter;
#[cfg(test)]
pub mod mock;
pub mod protocol;
mod tcp_adapter;

pub use http_adapter::HttpPoller;
pub use protocol::{Envelope, WireRequest};
pub use tcp_adapter::TcpTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::InterfaceConfig;
use crate::error::CoreError;
use crate::proxy::ProxyConfig;
use crate::types::Endpoint;

/// What one call to [`Transport::receive`] produced.
#[derive(Debug)]
pub enum Inbound {
    /// Zero or more decoded envelopes, in arrival order.
    Messages(Vec<Envelope>),
    /// Nothing arrived within the read timeout; the connection should be
    /// probed.
    Idle,
    /// The peer closed the connection or the session is gone.
    Closed,
}

/// The capability set the dispatch loop needs from a connection.
///
/// Only the interface's worker calls `connect` and `receive`. `send_batch`
/// may be called from any task; implementations serialize writes
/// internally.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection. A failure leaves the transport unusable until
    /// the next `connect`; nothing is retried here.
    async fn connect(&self) -> Result<(), CoreError>;

    /// Put a batch of requests on the wire. Transports that answer inline
    /// (HTTP) return the decoded replies; streaming transports return an
    /// empty vec and deliver replies through `receive`.
    async fn send_batch(&self, requests: &[WireRequest]) -> Result<Vec<Envelope>, CoreError>;

    /// Wait for the next inbound messages. An `Err` is a hard failure that
    /// ends the connection.
    async fn receive(&self) -> Result<Inbound, CoreError>;

    /// Shut the connection down and unblock any pending `receive` or
    /// `send_batch`. Must not wait on a peer that stopped reading.
    async fn close(&self);

    /// Human readable connection label for logs and status displays.
    fn describe(&self) -> String;

    /// Total inbound payload bytes seen so far.
    fn bytes_received(&self) -> u64;

    /// Duration of the last completed request/response exchange, where the
    /// transport can measure one.
    fn round_trip_time(&self) -> Option<Duration> {
        None
    }
}

/// Pick the transport variant for `endpoint`'s protocol.
pub fn transport_for(
    endpoint: &Endpoint,
    proxy: Option<&ProxyConfig>,
    config: &InterfaceConfig,
) -> Result<Arc<dyn Transport>, CoreError> {
    if endpoint.protocol.is_socket() {
        Ok(Arc::new(TcpTransport::new(endpoint.clone(), proxy.cloned(), config)))
    } else {
        Ok(Arc::new(HttpPoller::new(endpoint, proxy, config)?))
    }
}
