use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::{CoreError, RpcError};

use super::protocol::{Envelope, WireRequest};
use super::{Inbound, Transport};

/// A scripted transport for driving an `Interface` in tests. Inbound
/// traffic is pushed through the paired [`MockHandle`]; every outbound
/// request is captured.
pub struct MockTransport {
    refuse_connect: bool,
    fail_sends: bool,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    sent: Arc<Mutex<Vec<WireRequest>>>,
    connects: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    bytes_received: AtomicU64,
}

impl MockTransport {
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder {
            refuse_connect: false,
            fail_sends: false,
        }
    }
}

pub struct MockTransportBuilder {
    refuse_connect: bool,
    fail_sends: bool,
}

impl MockTransportBuilder {
    pub fn with_refused_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    pub fn with_failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    pub fn build(self) -> (Arc<MockTransport>, MockHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        let transport = MockTransport {
            refuse_connect: self.refuse_connect,
            fail_sends: self.fail_sends,
            inbound: tokio::sync::Mutex::new(rx),
            sent: Arc::clone(&sent),
            connects: Arc::clone(&connects),
            closed: Arc::clone(&closed),
            bytes_received: AtomicU64::new(0),
        };
        let handle = MockHandle {
            inbound: tx,
            sent,
            connects,
            closed,
        };
        (Arc::new(transport), handle)
    }
}

/// Test-side controls for a [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    inbound: mpsc::UnboundedSender<Inbound>,
    sent: Arc<Mutex<Vec<WireRequest>>>,
    connects: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl MockHandle {
    pub fn push(&self, inbound: Inbound) {
        self.inbound
            .send(inbound)
            .expect("mock transport must still be alive");
    }

    pub fn push_json(&self, value: Value) {
        let envelope: Envelope = serde_json::from_value(value).expect("test envelope must decode");
        self.push(Inbound::Messages(vec![envelope]));
    }

    pub fn reply(&self, id: u64, result: Value) {
        self.push_json(json!({"id": id, "result": result}));
    }

    pub fn notify(&self, method: &str, params: Value) {
        self.push_json(json!({"method": method, "params": params}));
    }

    pub fn idle(&self) {
        self.push(Inbound::Idle);
    }

    pub fn hang_up(&self) {
        self.push(Inbound::Closed);
    }

    pub fn sent(&self) -> Vec<WireRequest> {
        self.sent.lock().expect("sent log lock").clone()
    }

    /// Wait until at least `count` requests were written, then return them.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<WireRequest> {
        for _ in 0..200 {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} sent requests, saw {:?}", self.sent());
    }

    /// Id of the most recent request for `method`.
    pub async fn last_id_of(&self, method: &str) -> u64 {
        for _ in 0..200 {
            if let Some(request) = self.sent().iter().rev().find(|r| r.method == method) {
                return request.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no `{method}` request was sent");
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), CoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect {
            return Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into());
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_batch(&self, requests: &[WireRequest]) -> Result<Vec<Envelope>, CoreError> {
        if self.fail_sends {
            return Err(RpcError::Closed.into());
        }
        self.sent
            .lock()
            .expect("sent log lock")
            .extend_from_slice(requests);
        Ok(Vec::new())
    }

    async fn receive(&self) -> Result<Inbound, CoreError> {
        let inbound = self.inbound.lock().await.recv().await;
        let inbound = inbound.unwrap_or(Inbound::Closed);
        if let Inbound::Messages(messages) = &inbound {
            self.bytes_received
                .fetch_add(messages.len() as u64, Ordering::Relaxed);
        }
        Ok(inbound)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "mock".to_owned()
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}
