//! Shared domain types for the client core.
//!
//! Contains the connection target (`Endpoint`, `Protocol`), outbound calls
//! (`Message`), the normalized envelope handed to callers (`Response`,
//! `Event`), the callback handle, and the connection lifecycle enum.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

// ==============================================================================
// Endpoint
// ==============================================================================

/// Wire protocol spoken with a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Tcp,
    TcpTls,
    Http,
    Https,
}

impl Protocol {
    /// Persistent socket protocols (as opposed to HTTP session polling).
    pub fn is_socket(self) -> bool {
        matches!(self, Self::Tcp | Self::TcpTls)
    }

    pub fn uses_tls(self) -> bool {
        matches!(self, Self::TcpTls | Self::Https)
    }

    /// Single-letter code used in `host:port:p` server strings.
    pub fn code(self) -> char {
        match self {
            Self::Tcp => 't',
            Self::TcpTls => 's',
            Self::Http => 'h',
            Self::Https => 'g',
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::TcpTls => write!(f, "tcp-tls"),
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
        }
    }
}

impl FromStr for Protocol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "t" | "tcp" => Ok(Self::Tcp),
            "s" | "ssl" | "tls" | "tcp-tls" => Ok(Self::TcpTls),
            "h" | "http" => Ok(Self::Http),
            "g" | "https" => Ok(Self::Https),
            other => Err(CoreError::InvalidEndpoint(format!(
                "unknown protocol `{other}`; expected one of t, s, h, g"
            ))),
        }
    }
}

/// A resolved server address. Immutable once an `Interface` is built from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }
}

/// Parses the `host:port:p` server string form.
impl FromStr for Endpoint {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, ':');
        let (Some(protocol), Some(port), Some(host)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CoreError::InvalidEndpoint(format!(
                "`{s}` must look like `host:port:protocol`"
            )));
        };
        if host.is_empty() {
            return Err(CoreError::InvalidEndpoint(format!("`{s}` has an empty host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| CoreError::InvalidEndpoint(format!("invalid port `{port}`: {e}")))?;

        Ok(Self::new(host, port, protocol.parse()?))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.protocol.code())
    }
}

// ==============================================================================
// Outbound Messages
// ==============================================================================

/// Method names ending with this suffix register a standing subscription.
pub const SUBSCRIBE_SUFFIX: &str = ".subscribe";

/// A single outbound call, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub method: String,
    pub params: Vec<Value>,
}

impl Message {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn is_subscription(&self) -> bool {
        self.method.ends_with(SUBSCRIBE_SUFFIX)
    }
}

// ==============================================================================
// Inbound Delivery
// ==============================================================================

/// The normalized envelope a callback receives.
///
/// `id` is `None` for notifications. Exactly one of `result` / `error` is
/// normally set, but servers may omit both (`result: null`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub method: String,
    pub params: Vec<Value>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub id: Option<u64>,
}

impl Response {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// What a callback is invoked with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Reply(Response),
    /// Sent once per subscriber when subscriptions are torn down.
    Closed,
}

/// A shareable callback handle. Identity (not behavior) is what the
/// subscription registry keys on, so clones of one handle are "the same
/// callback" while two separately built handles never are.
#[derive(Clone)]
pub struct Callback(Arc<dyn Fn(Event) + Send + Sync>);

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, event: Event) {
        (self.0)(event)
    }

    pub fn same(&self, other: &Callback) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Arc::as_ptr(&self.0))
    }
}

// ==============================================================================
// Connection State
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Running,
    Stopped,
}

impl ConnectionState {
    /// Whether requests may be dispatched in this state.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Running)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
