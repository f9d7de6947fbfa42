use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::debug;

use crate::config::TlsPolicy;
use crate::error::{CoreError, RpcError};
use crate::proxy::{ProxyConfig, ProxyMode};
use crate::types::Endpoint;

/// Upper bound on the header block of an HTTP `CONNECT` reply.
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

pub(super) trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub(super) type BoxedStream = Box<dyn Stream>;

/// Open a stream to `endpoint`: socket (to the proxy when one is set),
/// proxy negotiation, then TLS when the protocol requires it.
pub(super) async fn dial(
    endpoint: &Endpoint,
    proxy: Option<&ProxyConfig>,
    tls: TlsPolicy,
) -> Result<BoxedStream, CoreError> {
    let (host, port) = match proxy {
        Some(proxy) => (proxy.host.as_str(), proxy.port),
        None => (endpoint.host.as_str(), endpoint.port),
    };
    let socket = open_socket(host, port).await?;

    let socket = match proxy {
        Some(proxy) => negotiate_proxy(socket, proxy, &endpoint.host, endpoint.port).await?,
        None => socket,
    };

    if endpoint.protocol.uses_tls() {
        let stream = tls_handshake(socket, &endpoint.host, tls).await?;
        Ok(Box::new(stream))
    } else {
        Ok(Box::new(socket))
    }
}

/// Resolve `host:port` and try each address until one accepts. Keep-alive
/// is enabled before connecting.
async fn open_socket(host: &str, port: u16) -> Result<TcpStream, CoreError> {
    let addrs = tokio::net::lookup_host((host, port)).await?;

    let mut last_err = None;
    for addr in addrs {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        match socket.connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!(%addr, "socket connected");
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err
        .unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {host}:{port}"),
            )
        })
        .into())
}

async fn negotiate_proxy(
    socket: TcpStream,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<TcpStream, CoreError> {
    debug!(proxy = %proxy, target.host = host, target.port = port, "negotiating proxy");
    match proxy.mode {
        ProxyMode::Socks5 => Socks5Stream::connect_with_socket(socket, (host, port))
            .await
            .map(Socks5Stream::into_inner)
            .map_err(|e| RpcError::Proxy(format!("socks5: {e}")).into()),
        ProxyMode::Socks4 => Socks4Stream::connect_with_socket(socket, (host, port))
            .await
            .map(Socks4Stream::into_inner)
            .map_err(|e| RpcError::Proxy(format!("socks4: {e}")).into()),
        ProxyMode::Http => http_connect(socket, host, port).await,
    }
}

/// Open a tunnel with `CONNECT host:port`. The reply header block is read
/// byte by byte so no tunneled bytes are consumed.
async fn http_connect(mut socket: TcpStream, host: &str, port: u16) -> Result<TcpStream, CoreError> {
    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    socket.write_all(request.as_bytes()).await?;

    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(RpcError::Proxy("CONNECT reply headers too large".into()).into());
        }
        if socket.read(&mut byte).await? == 0 {
            return Err(RpcError::Proxy("proxy closed the connection during CONNECT".into()).into());
        }
        head.push(byte[0]);
    }

    connect_status(&head)?;
    Ok(socket)
}

/// Accept only a `200` status line from the proxy.
fn connect_status(head: &[u8]) -> Result<(), CoreError> {
    let text = String::from_utf8_lossy(head);
    let status_line = text.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some("200")) if version.starts_with("HTTP/") => Ok(()),
        _ => Err(RpcError::Proxy(format!("CONNECT refused: `{status_line}`")).into()),
    }
}

/// Skips chain and host name checks but still verifies handshake
/// signatures against the presented certificate.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_connector(policy: TlsPolicy) -> Result<TlsConnector, CoreError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| RpcError::Tls(format!("configure TLS: {e}")))?;
    let config = match policy {
        TlsPolicy::AcceptAny => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth(),
        TlsPolicy::WebPki => builder
            .with_root_certificates(RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            })
            .with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn tls_handshake<S>(
    stream: S,
    host: &str,
    policy: TlsPolicy,
) -> Result<tokio_rustls::client::TlsStream<S>, CoreError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| RpcError::Tls(format!("invalid server name `{host}`: {e}")))?;
    tls_connector(policy)?
        .connect(server_name, stream)
        .await
        .map_err(|e| RpcError::Tls(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_status_accepts_200() {
        connect_status(b"HTTP/1.1 200 Connection established\r\n\r\n").expect("200 must pass");
        connect_status(b"HTTP/1.0 200 OK\r\nProxy-Agent: x\r\n\r\n").expect("200 must pass");
    }

    #[test]
    fn connect_status_rejects_other_codes() {
        let err = connect_status(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .expect_err("407 must fail");
        assert!(err.to_string().contains("407"));
        assert!(connect_status(b"garbage\r\n\r\n").is_err());
    }

    #[test]
    fn tls_connector_builds_for_every_policy() {
        tls_connector(TlsPolicy::AcceptAny).expect("accept-any TLS config must build");
        tls_connector(TlsPolicy::WebPki).expect("web PKI TLS config must build");
    }

    #[tokio::test]
    async fn http_connect_leaves_tunneled_bytes_unread() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind must succeed");
        let addr = listener.local_addr().expect("listener has an address");

        let proxy = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.expect("accept must succeed");
            let mut buf = vec![0u8; 256];
            let n = conn.read(&mut buf).await.expect("read CONNECT");
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            conn.write_all(b"HTTP/1.1 200 Connection established\r\n\r\nhello\n")
                .await
                .expect("write reply");
            request
        });

        let socket = TcpStream::connect(addr).await.expect("connect to fake proxy");
        let mut tunnel = http_connect(socket, "electrum.example.org", 50001)
            .await
            .expect("CONNECT must succeed");

        let mut tail = [0u8; 6];
        tunnel.read_exact(&mut tail).await.expect("tunneled bytes remain");
        assert_eq!(&tail, b"hello\n");

        let request = proxy.await.expect("proxy task must finish");
        assert!(request.starts_with("CONNECT electrum.example.org:50001 HTTP/1.1\r\n"));
    }

    /// Minimal SOCKS5 server: no auth, accepts one CONNECT and reports the
    /// requested target, then writes `greeting` into the tunnel.
    async fn socks5_stub(
        listener: tokio::net::TcpListener,
        greeting: &'static [u8],
    ) -> (String, u16) {
        let (mut conn, _) = listener.accept().await.expect("accept must succeed");
        let mut head = [0u8; 2];
        conn.read_exact(&mut head).await.expect("method header");
        assert_eq!(head[0], 5, "SOCKS version 5");
        let mut methods = vec![0u8; usize::from(head[1])];
        conn.read_exact(&mut methods).await.expect("methods");
        conn.write_all(&[5, 0]).await.expect("choose no-auth");

        let mut request = [0u8; 4];
        conn.read_exact(&mut request).await.expect("request header");
        assert_eq!(&request[..3], &[5, 1, 0], "CONNECT command");
        let host = match request[3] {
            1 => {
                let mut ip = [0u8; 4];
                conn.read_exact(&mut ip).await.expect("ipv4");
                std::net::Ipv4Addr::from(ip).to_string()
            }
            3 => {
                let len = conn.read_u8().await.expect("name length");
                let mut name = vec![0u8; usize::from(len)];
                conn.read_exact(&mut name).await.expect("name");
                String::from_utf8(name).expect("ascii name")
            }
            other => panic!("unexpected address type {other}"),
        };
        let port = conn.read_u16().await.expect("port");
        conn.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0])
            .await
            .expect("CONNECT reply");
        conn.write_all(greeting).await.expect("tunneled bytes");
        (host, port)
    }

    #[tokio::test]
    async fn socks5_negotiation_tunnels_to_the_named_host() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind must succeed");
        let addr = listener.local_addr().expect("listener has an address");
        let stub = tokio::spawn(socks5_stub(listener, b"hello\n"));

        let proxy = ProxyConfig::new(ProxyMode::Socks5, "127.0.0.1", addr.port());
        let socket = TcpStream::connect(addr).await.expect("connect to stub");
        let mut tunnel = negotiate_proxy(socket, &proxy, "electrum.example.org", 50002)
            .await
            .expect("SOCKS5 CONNECT must succeed");

        let mut tail = [0u8; 6];
        tunnel.read_exact(&mut tail).await.expect("tunneled bytes");
        assert_eq!(&tail, b"hello\n");
        assert_eq!(
            stub.await.expect("stub task"),
            ("electrum.example.org".to_owned(), 50002)
        );
    }

    #[tokio::test]
    async fn socks4_negotiation_uses_4a_for_host_names() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind must succeed");
        let addr = listener.local_addr().expect("listener has an address");
        let stub = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.expect("accept must succeed");
            let mut request = [0u8; 8];
            conn.read_exact(&mut request).await.expect("request header");
            let mut rest = Vec::new();
            // user id, then the host name: both NUL terminated.
            while rest.iter().filter(|&&b| b == 0).count() < 2 {
                rest.push(conn.read_u8().await.expect("request tail"));
            }
            conn.write_all(&[0, 0x5a, 0, 0, 0, 0, 0, 0])
                .await
                .expect("grant");
            (request, rest)
        });

        let proxy = ProxyConfig::new(ProxyMode::Socks4, "127.0.0.1", addr.port());
        let socket = TcpStream::connect(addr).await.expect("connect to stub");
        negotiate_proxy(socket, &proxy, "electrum.example.org", 50001)
            .await
            .expect("SOCKS4a CONNECT must succeed");

        let (request, rest) = stub.await.expect("stub task");
        assert_eq!(&request[..2], &[4, 1]);
        assert_eq!(u16::from_be_bytes([request[2], request[3]]), 50001);
        assert_eq!(&request[4..7], &[0, 0, 0], "4a marker address");
        let host = rest.split(|&b| b == 0).nth(1).expect("host name field");
        assert_eq!(host, b"electrum.example.org");
    }

    #[tokio::test]
    async fn refused_socks5_connect_is_a_proxy_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind must succeed");
        let addr = listener.local_addr().expect("listener has an address");
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.expect("accept must succeed");
            let mut head = [0u8; 3];
            conn.read_exact(&mut head).await.expect("method header");
            // No acceptable authentication method.
            conn.write_all(&[5, 0xff]).await.expect("reject");
        });

        let proxy = ProxyConfig::new(ProxyMode::Socks5, "127.0.0.1", addr.port());
        let socket = TcpStream::connect(addr).await.expect("connect to stub");
        let err = negotiate_proxy(socket, &proxy, "electrum.example.org", 50002)
            .await
            .expect_err("rejected methods must fail");
        assert!(matches!(err, CoreError::Rpc(RpcError::Proxy(_))), "got {err:?}");
    }
}
