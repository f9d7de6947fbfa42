use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace, warn};

use crate::config::{InterfaceConfig, TlsPolicy};
use crate::error::{CoreError, RpcError};
use crate::proxy::ProxyConfig;
use crate::types::Endpoint;

use super::super::protocol::{decode_line, encode_lines, Envelope, WireRequest};
use super::super::{Inbound, Transport};
use super::connection::{dial, BoxedStream};
use super::framing::LineBuffer;

const READ_CHUNK: usize = 4096;

/// Pause before retrying a read or write that reported a transient error.
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on the orderly shutdown of a closed stream. A peer that
/// stopped reading must not hold `close` hostage.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

struct Reader {
    half: ReadHalf<BoxedStream>,
    lines: LineBuffer,
}

/// Line-delimited JSON-RPC over a TCP (optionally TLS, optionally proxied)
/// stream.
///
/// The stream is split after connecting: the read half belongs to whoever
/// drives `receive` (the dispatch worker), the write half sits behind its
/// own lock so concurrent `send_batch` calls never interleave frames.
///
/// Blocked reads and writes race against the `closing` flag, so `close`
/// never waits on a peer that stopped reading or writing.
pub struct TcpTransport {
    endpoint: Endpoint,
    proxy: Option<ProxyConfig>,
    tls: TlsPolicy,
    connect_timeout: Duration,
    read_timeout: Duration,
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    closing: watch::Sender<bool>,
    bytes_received: AtomicU64,
}

impl TcpTransport {
    pub fn new(endpoint: Endpoint, proxy: Option<ProxyConfig>, config: &InterfaceConfig) -> Self {
        Self {
            endpoint,
            proxy,
            tls: config.tls,
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            closing: watch::channel(false).0,
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Resolves once `close` has been called for the current connection.
    async fn closed(&self) {
        let mut closing = self.closing.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = closing.wait_for(|closing| *closing).await;
    }
}

async fn write_payload(
    writer: &mut WriteHalf<BoxedStream>,
    payload: &[u8],
) -> Result<(), CoreError> {
    let mut written = 0;
    while written < payload.len() {
        match writer.write(&payload[written..]).await {
            Ok(0) => return Err(RpcError::Closed.into()),
            Ok(n) => written += n,
            Err(e) if is_transient(&e) => {
                debug!(error = %e, "transient write error; retrying");
                tokio::time::sleep(TRANSIENT_RETRY_DELAY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    writer.flush().await?;
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<(), CoreError> {
        debug!(endpoint = %self.endpoint, proxy = ?self.proxy, tls = ?self.tls, "dialing");
        self.closing.send_replace(false);
        let stream = tokio::time::timeout(
            self.connect_timeout,
            dial(&self.endpoint, self.proxy.as_ref(), self.tls),
        )
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", self.connect_timeout),
            )
        })??;

        let (read_half, write_half) = tokio::io::split(stream);
        *self.reader.lock().await = Some(Reader {
            half: read_half,
            lines: LineBuffer::default(),
        });
        *self.writer.lock().await = Some(write_half);
        Ok(())
    }

    async fn send_batch(&self, requests: &[WireRequest]) -> Result<Vec<Envelope>, CoreError> {
        let payload = encode_lines(requests)?;
        let mut guard = tokio::select! {
            biased;
            _ = self.closed() => return Err(RpcError::Closed.into()),
            guard = self.writer.lock() => guard,
        };
        let writer = guard.as_mut().ok_or(CoreError::NotConnected)?;

        tokio::select! {
            biased;
            _ = self.closed() => {
                debug!(bytes = payload.len(), "connection closed while writing");
                return Err(RpcError::Closed.into());
            }
            written = write_payload(writer, &payload) => written?,
        }

        trace!(
            rpc.batch_size = requests.len(),
            bytes = payload.len(),
            "batch written"
        );
        Ok(Vec::new())
    }

    async fn receive(&self) -> Result<Inbound, CoreError> {
        let mut guard = tokio::select! {
            biased;
            _ = self.closed() => return Ok(Inbound::Closed),
            guard = self.reader.lock() => guard,
        };
        let reader = guard.as_mut().ok_or(CoreError::NotConnected)?;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let read = tokio::select! {
                biased;
                _ = self.closed() => return Ok(Inbound::Closed),
                read = tokio::time::timeout(self.read_timeout, reader.half.read(&mut chunk)) => read,
            };
            let n = match read {
                Err(_) => return Ok(Inbound::Idle),
                Ok(Ok(0)) => return Ok(Inbound::Closed),
                Ok(Ok(n)) => n,
                Ok(Err(e)) if is_transient(&e) => {
                    debug!(error = %e, "transient read error; retrying");
                    tokio::time::sleep(TRANSIENT_RETRY_DELAY).await;
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
            };

            self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            reader.lines.extend(&chunk[..n])?;

            let mut messages = Vec::new();
            while let Some(line) = reader.lines.next_line() {
                match decode_line(&line) {
                    Ok(envelope) => messages.push(envelope),
                    Err(err) => warn!(error = %err, "dropping malformed line"),
                }
            }
            trace!(
                bytes = n,
                decoded = messages.len(),
                buffered = reader.lines.buffered(),
                "read chunk"
            );
            if !messages.is_empty() {
                return Ok(Inbound::Messages(messages));
            }
        }
    }

    /// Wake every blocked reader and writer, then rejoin both halves and
    /// shut the stream down.
    async fn close(&self) {
        self.closing.send_replace(true);
        let writer = self.writer.lock().await.take();
        let reader = self.reader.lock().await.take();

        let shutdown = match (reader, writer) {
            (Some(reader), Some(writer)) => {
                let mut stream = reader.half.unsplit(writer);
                tokio::time::timeout(SHUTDOWN_GRACE, stream.shutdown()).await
            }
            (None, Some(mut writer)) => {
                tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await
            }
            (_, None) => return,
        };
        match shutdown {
            Ok(Ok(())) => debug!(endpoint = %self.endpoint, "stream shut down"),
            Ok(Err(e)) => debug!(error = %e, "stream shutdown failed"),
            Err(_) => debug!("stream shutdown timed out; dropping it"),
        }
    }

    fn describe(&self) -> String {
        match &self.proxy {
            Some(proxy) => format!(
                "{}:{} using proxy {proxy}",
                self.endpoint.host, self.endpoint.port
            ),
            None => format!("{}:{}", self.endpoint.host, self.endpoint.port),
        }
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
