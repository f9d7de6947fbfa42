use clap::Parser;
use serde_json::Value;

use elwire_core::{Endpoint, Message, TlsPolicy};

/// elwire: talk JSON-RPC to an Electrum-style ledger server over TCP, TLS or
/// HTTP polling.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    /// Server as `host:port:protocol` (t = tcp, s = tls, h = http, g = https).
    #[arg(long, env = "ELWIRE_SERVER")]
    pub server: Endpoint,

    /// Proxy as `mode:host:port` (mode is socks4, socks5 or http), or `none`.
    #[arg(long, default_value = "none", env = "ELWIRE_PROXY")]
    pub proxy: String,

    /// Bound on socket connect, proxy handshake and TLS handshake together.
    #[arg(long, default_value = "2000")]
    pub connect_timeout_ms: u64,

    /// Require a certificate chain to a public root for TLS servers. By
    /// default self-signed certificates are accepted.
    #[arg(long, env = "ELWIRE_VERIFY_TLS")]
    pub verify_tls: bool,

    /// Method for a one-shot call, e.g. `blockchain.transaction.get`.
    #[arg(long)]
    pub call: Option<String>,

    /// Parameter for `--call` (repeatable). Values that are not valid JSON
    /// are sent as strings.
    #[arg(long = "param", value_parser = parse_param)]
    pub params: Vec<Value>,

    /// Follow new block headers.
    #[arg(long)]
    pub headers: bool,

    /// Follow status changes of an address (repeatable).
    #[arg(long = "address")]
    pub addresses: Vec<String>,

    /// How long `--call` waits for its reply.
    #[arg(long, default_value = "10")]
    pub timeout_secs: u64,
}

impl Cli {
    pub fn tls_policy(&self) -> TlsPolicy {
        if self.verify_tls {
            TlsPolicy::WebPki
        } else {
            TlsPolicy::AcceptAny
        }
    }

    pub fn call_message(&self) -> Option<Message> {
        self.call
            .as_ref()
            .map(|method| Message::new(method.clone(), self.params.clone()))
    }

    pub fn subscriptions(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        if self.headers {
            messages.push(Message::new("blockchain.headers.subscribe", vec![]));
        }
        for address in &self.addresses {
            messages.push(Message::new(
                "blockchain.address.subscribe",
                vec![Value::String(address.clone())],
            ));
        }
        messages
    }
}

fn parse_param(raw: &str) -> Result<Value, String> {
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned())))
}
