use std::time::Duration;

/// Protocol version announced in the `server.version` handshake.
pub const PROTOCOL_VERSION: &str = "1.4";

/// How the TLS transport treats the server's certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Encrypt, but accept any certificate. Most servers on this network
    /// present self-signed certificates, so this is the default.
    #[default]
    AcceptAny,
    /// Require a chain to one of the bundled web PKI roots matching the
    /// host name.
    WebPki,
}

/// Tunables for one `Interface`. The defaults match what public servers
/// expect from a desktop wallet.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Bounds socket connect, proxy negotiation and TLS handshake together.
    pub connect_timeout: Duration,
    /// A read that yields nothing for this long triggers a liveness probe.
    pub read_timeout: Duration,
    /// Per-request timeout for the HTTP poller.
    pub http_timeout: Duration,
    /// Certificate checking for `tcp-tls` endpoints.
    pub tls: TlsPolicy,
    pub poll_interval_min: Duration,
    pub poll_interval_max: Duration,
    pub poll_interval_step: Duration,
    pub client_version: String,
    pub protocol_version: String,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(60),
            http_timeout: Duration::from_secs(5),
            tls: TlsPolicy::default(),
            poll_interval_min: Duration::from_secs(1),
            poll_interval_max: Duration::from_secs(15),
            poll_interval_step: Duration::from_secs(1),
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
            protocol_version: PROTOCOL_VERSION.to_owned(),
        }
    }
}

impl InterfaceConfig {
    /// Params of the `server.version` handshake / liveness probe.
    pub fn version_params(&self) -> Vec<serde_json::Value> {
        vec![
            serde_json::json!(self.client_version),
            serde_json::json!(self.protocol_version),
        ]
    }
}
