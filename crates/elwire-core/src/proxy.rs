//! Proxy descriptor parsing.
//!
//! Accepts the compact `mode:host:port` form (any trailing part may be
//! omitted), the literal `none`, or an already structured descriptor.
//! Parsing never fails: anything malformed degrades to defaults.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PROXY_HOST: &str = "localhost";
const DEFAULT_SOCKS_PORT: u16 = 1080;
const DEFAULT_HTTP_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Socks4,
    #[default]
    Socks5,
    Http,
}

impl ProxyMode {
    /// Case-insensitive match against the fixed set of mode names.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "socks4" => Some(Self::Socks4),
            "socks5" => Some(Self::Socks5),
            "http" => Some(Self::Http),
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => DEFAULT_HTTP_PORT,
            Self::Socks4 | Self::Socks5 => DEFAULT_SOCKS_PORT,
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socks4 => write!(f, "socks4"),
            Self::Socks5 => write!(f, "socks5"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// A normalized proxy descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub mode: ProxyMode,
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    pub fn new(mode: ProxyMode, host: impl Into<String>, port: u16) -> Self {
        Self {
            mode,
            host: host.into(),
            port,
        }
    }

    /// Proxy URL understood by `reqwest::Proxy`. SOCKS5 resolves names on
    /// the proxy side.
    pub fn url(&self) -> String {
        let scheme = match self.mode {
            ProxyMode::Socks4 => "socks4",
            ProxyMode::Socks5 => "socks5h",
            ProxyMode::Http => "http",
        };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.mode, self.host, self.port)
    }
}

/// Proxy setting as it arrives from configuration: either the compact
/// string or a structured descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxySetting {
    Compact(String),
    Structured(ProxyConfig),
}

impl ProxySetting {
    pub fn resolve(&self) -> Option<ProxyConfig> {
        match self {
            Self::Compact(s) => parse_proxy(s),
            Self::Structured(config) => Some(config.clone()),
        }
    }
}

/// Parse the compact proxy form.
///
/// - `none` (any case) yields `None`.
/// - The first token is taken as the mode when it names one. A lone token
///   and the first of three tokens are always mode positions, so an
///   unrecognized word there falls back to `socks5`.
/// - Missing or unparsable ports fall back to 8080 for `http`, else 1080.
pub fn parse_proxy(s: &str) -> Option<ProxyConfig> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("none") {
        return None;
    }

    let args: Vec<&str> = s.split(':').collect();
    let (mode, rest) = match (ProxyMode::from_token(args[0]), args.len()) {
        (Some(mode), _) => (mode, &args[1..]),
        (None, 1 | 3) => (ProxyMode::default(), &args[1..]),
        (None, _) => (ProxyMode::default(), &args[..]),
    };

    let host = rest
        .first()
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .unwrap_or(DEFAULT_PROXY_HOST);
    let port = rest
        .get(1)
        .and_then(|p| p.trim().parse::<u16>().ok())
        .unwrap_or_else(|| mode.default_port());

    Some(ProxyConfig::new(mode, host, port))
}
