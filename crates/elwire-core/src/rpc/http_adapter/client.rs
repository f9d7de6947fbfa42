use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::InterfaceConfig;
use crate::error::{CoreError, RpcError};
use crate::proxy::ProxyConfig;
use crate::types::Endpoint;

use super::super::protocol::{decode_body, Envelope, WireRequest};
use super::super::{Inbound, Transport};
use super::connection::{build_client, endpoint_url};

const SESSION_COOKIE: &str = "SESSION";

/// Adaptive poll interval bounds.
#[derive(Debug, Clone, Copy)]
struct PollSchedule {
    min: Duration,
    max: Duration,
    step: Duration,
}

impl PollSchedule {
    /// Reset to the floor after a poll that carried messages, otherwise back
    /// off by one step up to the ceiling.
    fn next(&self, current: Duration, got_messages: bool) -> Duration {
        if got_messages {
            self.min
        } else {
            (current + self.step).min(self.max)
        }
    }
}

#[derive(Debug)]
struct PollState {
    session_id: Option<String>,
    interval: Duration,
    /// Messages that arrived on the session-opening poll.
    backlog: Vec<Envelope>,
}

/// Session-based JSON-RPC over HTTP(S) polling.
///
/// Every exchange holds the session lock for the whole request/response, so
/// outbound batches and polls are strictly one at a time.
pub struct HttpPoller {
    client: reqwest::Client,
    url: String,
    schedule: PollSchedule,
    state: Mutex<PollState>,
    active: AtomicBool,
    bytes_received: AtomicU64,
    /// Nanoseconds of the last exchange; zero until one completes.
    last_round_trip: AtomicU64,
}

impl HttpPoller {
    pub fn new(
        endpoint: &Endpoint,
        proxy: Option<&ProxyConfig>,
        config: &InterfaceConfig,
    ) -> Result<Self, CoreError> {
        let url = endpoint_url(endpoint)?;
        let client = build_client(
            proxy,
            config.connect_timeout,
            config.http_timeout,
            config.tls,
        )?;
        let schedule = PollSchedule {
            min: config.poll_interval_min,
            max: config.poll_interval_max,
            step: config.poll_interval_step,
        };

        Ok(Self {
            client,
            url,
            schedule,
            state: Mutex::new(PollState {
                session_id: None,
                interval: schedule.min,
                backlog: Vec::new(),
            }),
            active: AtomicBool::new(false),
            bytes_received: AtomicU64::new(0),
            last_round_trip: AtomicU64::new(0),
        })
    }

    /// One request/response. An empty batch is a bodiless GET poll.
    async fn exchange(
        &self,
        state: &mut PollState,
        requests: &[WireRequest],
    ) -> Result<Vec<Envelope>, CoreError> {
        let started = Instant::now();

        let mut builder = if requests.is_empty() {
            self.client
                .get(&self.url)
                .header(header::CONTENT_TYPE, "application/json")
        } else {
            self.client
                .post(&self.url)
                .header(header::CONTENT_TYPE, "application/json")
                .json(requests)
        };
        if let Some(session) = &state.session_id {
            builder = builder.header(header::COOKIE, format!("{SESSION_COOKIE}={session}"));
        }

        let response = builder.send().await.map_err(RpcError::Transport)?;
        let status = response.status();
        if let Some(cookie) = response.cookies().find(|c| c.name() == SESSION_COOKIE) {
            if state.session_id.as_deref() != Some(cookie.value()) {
                debug!(session = cookie.value(), "http session assigned");
            }
            state.session_id = Some(cookie.value().to_owned());
        }

        let body = response.text().await.map_err(RpcError::Transport)?;
        self.bytes_received
            .fetch_add(body.len() as u64, Ordering::Relaxed);
        debug!(
            rpc.batch_size = requests.len(),
            %status,
            body_len = body.len(),
            "http exchange"
        );
        trace!(body = %body, "http response body");

        if !status.is_success() {
            return Err(
                RpcError::InvalidResponse(format!("HTTP status {status}; body={body}")).into(),
            );
        }

        let envelopes = decode_body(&body)?;
        state.interval = self.schedule.next(state.interval, !envelopes.is_empty());

        let elapsed = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_round_trip.store(elapsed.max(1), Ordering::Relaxed);
        Ok(envelopes)
    }
}

#[async_trait]
impl Transport for HttpPoller {
    async fn connect(&self) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        state.session_id = None;
        state.interval = self.schedule.min;

        let envelopes = self.exchange(&mut state, &[]).await?;
        if state.session_id.is_none() {
            return Err(RpcError::SessionMissing.into());
        }
        state.backlog = envelopes;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_batch(&self, requests: &[WireRequest]) -> Result<Vec<Envelope>, CoreError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(CoreError::NotConnected);
        }
        let mut state = self.state.lock().await;
        self.exchange(&mut state, requests).await
    }

    async fn receive(&self) -> Result<Inbound, CoreError> {
        let interval = {
            let mut state = self.state.lock().await;
            if !state.backlog.is_empty() {
                return Ok(Inbound::Messages(std::mem::take(&mut state.backlog)));
            }
            state.interval
        };
        tokio::time::sleep(interval).await;

        if !self.active.load(Ordering::SeqCst) {
            return Ok(Inbound::Closed);
        }
        let mut state = self.state.lock().await;
        if state.session_id.is_none() {
            return Ok(Inbound::Closed);
        }
        let envelopes = self.exchange(&mut state, &[]).await?;
        Ok(Inbound::Messages(envelopes))
    }

    async fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        self.url.clone()
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    fn round_trip_time(&self) -> Option<Duration> {
        match self.last_round_trip.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }
}
