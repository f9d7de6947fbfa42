use std::time::Duration;

/// Failures raised while talking to a server over one of the transports.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("HTTP transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("proxy negotiation failed: {0}")]
    Proxy(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("server error {code}: {message}")]
    ServerError { code: i64, message: String },

    #[error("server did not assign an HTTP session")]
    SessionMissing,

    #[error("connection closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("RPC communication failure: {0}")]
    Rpc(#[from] RpcError),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("interface is not connected")]
    NotConnected,

    #[error("timed out after {waited:?} waiting for {outstanding} replies")]
    Timeout { waited: Duration, outstanding: usize },

    #[error("interface already started or stopped")]
    AlreadyStarted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
