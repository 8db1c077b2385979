//! Connection supervision and single-flight request issuance.

use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vserial_proto::channel::Channel;
use vserial_proto::envelope::{RequestEnvelope, ResponseEnvelope, unix_timestamp};
use vserial_proto::error::{TransportError, WireError};
use vserial_proto::http::{self, DEFAULT_MAX_BODY_BYTES, Method, Request, header};

use crate::HostConfig;
use crate::error::ClientError;

/// The one request allowed in flight on the channel at a time.
#[derive(Debug)]
struct Pending {
    request_id: String,
    sent_at: Instant,
    deadline: Instant,
    body_size: usize,
}

/// Host client over one virtio-serial Unix socket.
///
/// An internal mutex serializes concurrent callers: the channel is a single
/// byte stream, and interleaved request writes would corrupt framing.
pub struct Client {
    config: HostConfig,
    channel: Mutex<Option<Channel<UnixStream>>>,
}

impl Client {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            channel: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Open the socket if not already open. Idempotent.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut guard = self.channel.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        Ok(())
    }

    /// Close the channel. A later `request` reconnects when
    /// `auto_reconnect` is set, otherwise fails with `NotConnected`.
    pub async fn disconnect(&self) {
        let mut guard = self.channel.lock().await;
        if let Some(mut ch) = guard.take() {
            ch.shutdown().await;
            info!("disconnected");
        }
    }

    async fn open(&self) -> Result<Channel<UnixStream>, ClientError> {
        debug!(socket = %self.config.socket_path.display(), "connecting");
        let stream = timeout(
            self.config.connect_timeout,
            UnixStream::connect(&self.config.socket_path),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(TransportError::from_connect_io)?;
        info!(socket = %self.config.socket_path.display(), "connected");
        Ok(Channel::new(stream))
    }

    /// Issue one request and await its response, applying the retry policy:
    /// lost channels and timeouts retry with exponential backoff, envelope
    /// errors and protocol faults go straight back to the caller.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&RequestEnvelope>,
        read_timeout: Option<Duration>,
    ) -> Result<ResponseEnvelope, ClientError> {
        let mut guard = self.channel.lock().await;

        let mut attempt = 0u32;
        loop {
            let result = self
                .request_once(&mut guard, method, path, body, read_timeout)
                .await;

            match result {
                Ok(env) if env.is_success() => return Ok(env),
                Ok(env) => return Err(ClientError::from_envelope(env)),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "request failed, retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.config.backoff_factor.max(1.0).powi(attempt as i32);
        self.config.retry_interval.mul_f64(factor)
    }

    async fn request_once(
        &self,
        guard: &mut Option<Channel<UnixStream>>,
        method: Method,
        path: &str,
        body: Option<&RequestEnvelope>,
        read_timeout: Option<Duration>,
    ) -> Result<ResponseEnvelope, ClientError> {
        if guard.is_none() {
            if !self.config.auto_reconnect {
                return Err(TransportError::NotConnected.into());
            }
            *guard = Some(self.open().await?);
        }
        let Some(ch) = guard.as_mut() else {
            return Err(TransportError::NotConnected.into());
        };

        let mut req = Request::new(method, path);
        let request_id = Uuid::new_v4().to_string();
        req.headers.set(header::REQUEST_ID, request_id.clone());
        req.headers.set(header::TIMESTAMP, unix_timestamp().to_string());
        req.headers.set(header::CONTENT_TYPE, header::JSON_UTF8);
        if let Some(env) = body {
            req.body = env.encode()?;
        }

        let now = Instant::now();
        let pending = Pending {
            request_id,
            sent_at: now,
            deadline: now + read_timeout.unwrap_or(self.config.read_timeout),
            body_size: req.body.len(),
        };
        debug!(
            request_id = %pending.request_id,
            body_size = pending.body_size,
            "{method} {path}"
        );

        let write_deadline = pending.sent_at + self.config.write_timeout;
        if let Err(e) = http::write_request(ch, &req, Some(write_deadline)).await {
            return Err(self.fail_channel(guard, e));
        }

        let resp = match http::read_response(ch, DEFAULT_MAX_BODY_BYTES, Some(pending.deadline)).await
        {
            Ok(resp) => resp,
            Err(e) => return Err(self.fail_channel(guard, e)),
        };

        // single in-flight invariant: anything not carrying our id is a
        // stale response, and the only resynchronization is a fresh channel
        match resp.headers.get(header::REQUEST_ID) {
            Some(id) if id == pending.request_id => {}
            other => {
                warn!(expected = %pending.request_id, got = ?other, "response correlation mismatch");
                return Err(self.fail_channel(
                    guard,
                    TransportError::ConnectionLost("response correlation mismatch".to_string())
                        .into(),
                ));
            }
        }

        debug!(
            request_id = %pending.request_id,
            status = resp.status,
            elapsed_ms = pending.sent_at.elapsed().as_millis() as u64,
            "response received"
        );

        Ok(ResponseEnvelope::decode(&resp.body)?)
    }

    /// Drop the channel after a wire fault. Even a timeout poisons it: the
    /// abandoned response would arrive in front of the next one.
    fn fail_channel(&self, guard: &mut Option<Channel<UnixStream>>, e: WireError) -> ClientError {
        *guard = None;
        match e {
            WireError::Transport(t) => t.into(),
            WireError::Protocol(p) => p.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_progression() {
        let client = Client::new(HostConfig {
            retry_interval: Duration::from_secs(1),
            backoff_factor: 2.0,
            ..HostConfig::for_socket("/nonexistent")
        });
        assert_eq!(client.backoff(0), Duration::from_secs(1));
        assert_eq!(client.backoff(1), Duration::from_secs(2));
        assert_eq!(client.backoff(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn connect_to_missing_socket_is_refused() {
        let client = Client::new(HostConfig::for_socket("/tmp/vserial-test-no-such.sock"));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::ConnectionRefused(_))
        ));
    }

    #[tokio::test]
    async fn request_without_connection_and_no_reconnect() {
        let client = Client::new(HostConfig {
            auto_reconnect: false,
            ..HostConfig::for_socket("/tmp/vserial-test-no-such.sock")
        });
        let err = client
            .request(Method::Get, "/api/v1/ping", None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::NotConnected)
        ));
    }
}
