//! Guest server: owns the channel and serves requests sequentially.
//!
//! Lifecycle: `Initializing → Running ⇄ Reconnecting → Stopping → Stopped`.
//! A lost channel moves the server to `Reconnecting`, where it reopens the
//! device with doubling backoff; the stop signal drains the in-flight
//! request and exits. Requests on one channel are strictly sequential: the
//! device is a single byte stream and interleaved writes would corrupt
//! framing.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout_at};
use uuid::Uuid;
use vserial_proto::channel::Channel;
use vserial_proto::envelope::{Code, RequestEnvelope, ResponseEnvelope};
use vserial_proto::error::{ProtocolError, TransportError, WireError};
use vserial_proto::http::{self, Request, Response, header};

use crate::GuestConfig;
use crate::policy::RateLimiter;
use crate::router::{HandlerContext, MAX_HANDLER_SECONDS, Router};

/// Extra wall-clock a handler gets past its deadline to unwind before the
/// server abandons it and synthesizes a timeout response.
const GRACE: Duration = Duration::from_secs(5);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Longest error detail forwarded to the wire.
const MAX_DETAIL: usize = 512;

/// Lifecycle of the serving loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Initializing,
    Running,
    Reconnecting,
    Stopping,
    Stopped,
}

/// Pluggable request authentication for routes flagged `auth_required`.
/// Consulted only when the config enables auth; the default accepts
/// everything.
pub trait Authenticator: Send + Sync {
    fn verify(&self, request: &Request) -> bool;
}

pub struct AllowAll;

impl Authenticator for AllowAll {
    fn verify(&self, _request: &Request) -> bool {
        true
    }
}

/// How one channel's serving loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    Stopped,
    ConnectionLost,
}

enum Next {
    Shutdown,
    Request(Result<Request, WireError>),
}

pub struct Server {
    config: GuestConfig,
    router: Arc<Router>,
    auth: Arc<dyn Authenticator>,
    limiter: Option<RateLimiter>,
}

impl Server {
    pub fn new(config: GuestConfig, router: Router) -> Self {
        let limiter = config.rate_limit.clone().map(RateLimiter::new);
        Self {
            config,
            router: Arc::new(router),
            auth: Arc::new(AllowAll),
            limiter,
        }
    }

    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    /// Run until the shutdown signal fires.
    ///
    /// Opening the character device succeeds even with no host connected;
    /// reads then block until the host writes. Open failures (missing
    /// device node) are retried on the same backoff as reconnects.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut state = ServerState::Initializing;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let opened = tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.config.device_path)
                .await;

            match opened {
                Ok(device) => {
                    backoff = INITIAL_BACKOFF;
                    transition(&mut state, ServerState::Running);
                    info!("channel open on {}", self.config.device_path.display());

                    let channel = Channel::with_capacity(device, self.config.buffer_size);
                    match self.serve_channel(channel, &mut shutdown_rx).await {
                        ServeOutcome::Stopped => {
                            transition(&mut state, ServerState::Stopped);
                            return;
                        }
                        ServeOutcome::ConnectionLost => {
                            transition(&mut state, ServerState::Reconnecting);
                        }
                    }
                }
                Err(e) => {
                    transition(&mut state, ServerState::Reconnecting);
                    warn!(
                        "cannot open {}: {e}, retrying in {backoff:?}",
                        self.config.device_path.display()
                    );
                }
            }

            // backoff, interruptible by the stop signal
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    transition(&mut state, ServerState::Stopped);
                    return;
                }
                _ = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Serve one established byte stream until it dies or the stop signal
    /// fires. Public so tests and alternative transports can drive the
    /// request loop directly.
    pub async fn serve_connection<S>(
        &self,
        stream: S,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) -> ServeOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let channel = Channel::with_capacity(stream, self.config.buffer_size);
        self.serve_channel(channel, shutdown_rx).await
    }

    async fn serve_channel<S>(
        &self,
        mut ch: Channel<S>,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) -> ServeOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let next = tokio::select! {
                _ = shutdown_rx.recv() => Next::Shutdown,
                r = http::read_request(&mut ch, self.config.max_request_size, None) => Next::Request(r),
            };

            match next {
                Next::Shutdown => {
                    debug!("stop signal received, closing channel");
                    ch.shutdown().await;
                    return ServeOutcome::Stopped;
                }
                Next::Request(Ok(req)) => {
                    let resp = self.dispatch(req).await;
                    if let Err(e) = http::write_response(&mut ch, &resp, None).await {
                        warn!("response write failed: {e}");
                        return ServeOutcome::ConnectionLost;
                    }
                }
                Next::Request(Err(WireError::Transport(TransportError::Timeout))) => {
                    // no read deadline is armed between requests; keep waiting
                    continue;
                }
                Next::Request(Err(WireError::Transport(e))) => {
                    debug!("channel read failed: {e}");
                    return ServeOutcome::ConnectionLost;
                }
                Next::Request(Err(WireError::Protocol(e))) => {
                    // framing is unrecoverable mid-stream: answer 400 and
                    // resynchronize on a fresh channel
                    warn!("protocol fault: {e}");
                    let _ = http::write_response(&mut ch, &protocol_fault_response(&e), None).await;
                    ch.shutdown().await;
                    return ServeOutcome::ConnectionLost;
                }
            }
        }
    }

    /// Turn one parsed request into a response. Never fails: every error
    /// becomes an envelope.
    pub async fn dispatch(&self, req: Request) -> Response {
        let received = Instant::now();
        let request_id = req
            .headers
            .get(header::REQUEST_ID)
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        debug!("{} {} [{request_id}]", req.method, req.path);
        let (status, envelope) = self.handle(&req, &request_id, received).await;
        if !envelope.is_success() {
            info!(
                "{} {} [{request_id}] -> {} ({})",
                req.method, req.path, envelope.code, envelope.message
            );
        }

        let mut resp = Response::new(status);
        resp.headers.set(header::REQUEST_ID, request_id);
        resp.headers.set(header::CONTENT_TYPE, header::JSON_UTF8);
        resp.headers.set(
            header::RESPONSE_TIME,
            received.elapsed().as_millis().to_string(),
        );
        resp.body = envelope.encode().unwrap_or_else(|e| {
            error!("envelope encoding failed: {e}");
            ResponseEnvelope::failure(Code::InternalError, "internal error", "encoding failure")
                .encode()
                .unwrap_or_default()
        });
        resp
    }

    async fn handle(
        &self,
        req: &Request,
        request_id: &str,
        received: Instant,
    ) -> (u16, ResponseEnvelope) {
        let Some(entry) = self.router.resolve(req.method, req.route_path()) else {
            return (
                404,
                ResponseEnvelope::failure(
                    Code::EndpointNotFound,
                    "endpoint not found",
                    req.route_path(),
                ),
            );
        };

        if req.body.len() > entry.options.max_body_bytes {
            return (
                400,
                ResponseEnvelope::failure(
                    Code::InvalidParams,
                    "invalid parameters",
                    format!("body exceeds {} bytes", entry.options.max_body_bytes),
                ),
            );
        }

        if entry.options.auth_required && self.config.enable_auth && !self.auth.verify(req) {
            return (
                200,
                ResponseEnvelope::failure(
                    Code::PermissionDenied,
                    "permission denied",
                    "authentication failed",
                ),
            );
        }

        let _slot = match &self.limiter {
            Some(limiter) => match limiter.acquire() {
                Ok(slot) => Some(slot),
                Err(e) => {
                    return (200, ResponseEnvelope::failure(e.code, e.message(), e.detail));
                }
            },
            None => None,
        };

        let envelope = match RequestEnvelope::decode(&req.body) {
            Ok(env) => env,
            Err(e) => {
                return (
                    200,
                    ResponseEnvelope::failure(
                        Code::JsonParseError,
                        "invalid json body",
                        bounded(e.to_string()),
                    ),
                );
            }
        };

        let timeout_secs = [
            envelope.timeout,
            Some(entry.options.default_timeout.as_secs()),
            Some(MAX_HANDLER_SECONDS),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(MAX_HANDLER_SECONDS)
        .max(1);
        let deadline = received + Duration::from_secs(timeout_secs);

        let ctx = HandlerContext {
            query: req.query(),
            action: envelope.action,
            params: envelope.params,
            request_id: request_id.to_string(),
            deadline,
        };

        let handler = entry.handler.clone();
        let mut task = tokio::spawn(async move { handler.call(&ctx).await });

        match timeout_at(deadline + GRACE, &mut task).await {
            Err(_) => {
                // grace exhausted: abandon the handler, discard whatever it
                // still produces
                task.abort();
                warn!("[{request_id}] handler overran deadline + grace, abandoned");
                (
                    200,
                    ResponseEnvelope::failure(
                        Code::CmdTimeout,
                        "command timed out",
                        "handler exceeded its deadline",
                    ),
                )
            }
            Ok(Err(join_err)) => {
                let detail = if join_err.is_panic() {
                    "handler panicked".to_string()
                } else {
                    join_err.to_string()
                };
                error!("[{request_id}] handler failed: {detail}");
                (
                    500,
                    ResponseEnvelope::failure(Code::InternalError, "internal error", bounded(detail)),
                )
            }
            Ok(Ok(Ok(reply))) => (200, ResponseEnvelope::success(reply.message, reply.data)),
            Ok(Ok(Err(err))) => (
                200,
                ResponseEnvelope::failure(err.code, err.message(), bounded(err.detail)),
            ),
        }
    }
}

fn transition(state: &mut ServerState, to: ServerState) {
    debug!("server state {state:?} -> {to:?}");
    *state = to;
}

fn protocol_fault_response(e: &ProtocolError) -> Response {
    let envelope =
        ResponseEnvelope::failure(Code::InvalidParams, "malformed request", bounded(e.to_string()));
    let mut resp = Response::new(400);
    resp.headers.set(header::CONTENT_TYPE, header::JSON_UTF8);
    resp.body = envelope.encode().unwrap_or_default();
    resp
}

fn bounded(s: String) -> String {
    if s.len() <= MAX_DETAIL {
        s
    } else {
        s.chars().take(MAX_DETAIL).collect()
    }
}
