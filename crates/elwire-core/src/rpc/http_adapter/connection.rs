use std::time::Duration;

use reqwest::Url;

use crate::config::TlsPolicy;
use crate::error::{CoreError, RpcError};
use crate::proxy::ProxyConfig;
use crate::types::{Endpoint, Protocol};

/// Poll URL for an `http`/`https` endpoint.
pub(super) fn endpoint_url(endpoint: &Endpoint) -> Result<String, CoreError> {
    let scheme = match endpoint.protocol {
        Protocol::Http => "http",
        Protocol::Https => "https",
        other => {
            return Err(CoreError::InvalidEndpoint(format!(
                "protocol `{other}` is not served by the HTTP poller"
            )))
        }
    };
    let host = if endpoint.host.contains(':') && !endpoint.host.starts_with('[') {
        format!("[{}]", endpoint.host)
    } else {
        endpoint.host.clone()
    };
    let url = format!("{scheme}://{host}:{}", endpoint.port);

    Url::parse(&url)
        .map_err(|e| CoreError::InvalidEndpoint(format!("invalid poll URL `{url}`: {e}")))?;
    Ok(url)
}

/// Build the HTTP client. Session cookies are handled by the poller itself,
/// so no cookie store is attached.
pub(super) fn build_client(
    proxy: Option<&ProxyConfig>,
    connect_timeout: Duration,
    request_timeout: Duration,
    tls: TlsPolicy,
) -> Result<reqwest::Client, CoreError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(request_timeout)
        .danger_accept_invalid_certs(tls == TlsPolicy::AcceptAny)
        .tcp_nodelay(true);
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy.url()).map_err(RpcError::Transport)?;
        builder = builder.proxy(proxy);
    }
    Ok(builder.build().map_err(RpcError::Transport)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyMode;

    #[test]
    fn endpoint_url_uses_protocol_scheme() {
        let plain = endpoint_url(&Endpoint::new("electrum.example.org", 8081, Protocol::Http))
            .expect("http endpoint");
        assert_eq!(plain, "http://electrum.example.org:8081");

        let tls = endpoint_url(&Endpoint::new("electrum.example.org", 8082, Protocol::Https))
            .expect("https endpoint");
        assert_eq!(tls, "https://electrum.example.org:8082");
    }

    #[test]
    fn endpoint_url_brackets_ipv6_hosts() {
        let url = endpoint_url(&Endpoint::new("::1", 8081, Protocol::Http)).expect("ipv6 endpoint");
        assert_eq!(url, "http://[::1]:8081");
    }

    #[test]
    fn endpoint_url_rejects_socket_protocols() {
        let err = endpoint_url(&Endpoint::new("electrum.example.org", 50001, Protocol::Tcp))
            .expect_err("tcp must be rejected");
        assert!(err.to_string().contains("not served by the HTTP poller"));
    }

    #[test]
    fn build_client_accepts_every_proxy_mode() {
        for mode in [ProxyMode::Socks4, ProxyMode::Socks5, ProxyMode::Http] {
            let proxy = ProxyConfig::new(mode, "localhost", mode.default_port());
            build_client(
                Some(&proxy),
                Duration::from_secs(2),
                Duration::from_secs(5),
                TlsPolicy::WebPki,
            )
            .expect("proxied client must build");
        }
    }
}
