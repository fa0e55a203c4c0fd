pub mod http;
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

pub use http::ReqwestTransport;

pub const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Post,
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Post => reqwest::Method::POST,
        }
    }
}

/// A single request against the paste API.
///
/// `path` is relative to the configured API base (`id/request`, not
/// `/1/id/request`); the transport owns URL resolution and query encoding.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub content_type: Option<&'static str>,
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body: None,
            content_type: None,
            timeout: None,
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: Bytes, content_type: &'static str) -> Self {
        self.body = Some(body);
        self.content_type = Some(content_type);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// How a request ended. Every attempt produces exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(String),
    HttpError { status: u16, body: String },
    /// The request never produced a response; carries the cause for logs.
    NetworkError(String),
    Aborted,
    Timeout,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::HttpError { .. } => "http_error",
            Outcome::NetworkError(_) => "network_error",
            Outcome::Aborted => "aborted",
            Outcome::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(body) => write!(f, "ok: {body}"),
            Outcome::HttpError { status, body } if body.is_empty() => write!(f, "HTTP {status}"),
            Outcome::HttpError { status, body } => write!(f, "HTTP {status}: {body}"),
            Outcome::NetworkError(cause) => write!(f, "network error: {cause}"),
            Outcome::Aborted => f.write_str("aborted"),
            Outcome::Timeout => f.write_str("timed out"),
        }
    }
}

/// Request execution against the paste server.
///
/// `execute` is the normal asynchronous path. The two synchronous methods
/// exist for teardown, when no further turns of the async runtime can be
/// relied upon.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> Outcome;

    /// Runs the request to completion on the calling thread.
    fn execute_blocking(&self, request: TransportRequest) -> Outcome;

    /// Hands the request off for delivery that outlives the caller without
    /// blocking it. Returns `false` when beacon delivery is unavailable, in
    /// which case nothing was sent.
    fn beacon(&self, request: TransportRequest) -> bool {
        let _ = request;
        false
    }

    /// Waits up to `grace` for queued beacon deliveries; returns how many
    /// were still running when the grace period ran out.
    async fn flush_beacons(&self, grace: Duration) -> usize {
        let _ = grace;
        0
    }
}

/// Cancels the attempts bound to the paired [`CancelSignal`].
///
/// Dropping the handle cancels as well, so an owner that disappears never
/// leaves an upload loop running behind it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug)]
pub struct CancelSignal {
    rx: oneshot::Receiver<()>,
    fired: bool,
}

impl CancelSignal {
    pub fn is_cancelled(&mut self) -> bool {
        if !self.fired {
            self.fired = !matches!(
                self.rx.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            );
        }
        self.fired
    }

    /// Resolves once the paired handle cancels or is dropped.
    pub async fn cancelled(&mut self) {
        if self.fired {
            return;
        }
        let _ = (&mut self.rx).await;
        self.fired = true;
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = oneshot::channel();
    (
        CancelHandle { tx: Some(tx) },
        CancelSignal { rx, fired: false },
    )
}

/// Executes one attempt unless `cancel` fires first.
///
/// A cancelled attempt resolves to [`Outcome::Aborted`] and the in-flight
/// request is dropped, so no later outcome can be observed for it.
pub async fn send_cancellable(
    transport: &dyn Transport,
    request: TransportRequest,
    cancel: &mut CancelSignal,
) -> Outcome {
    if cancel.is_cancelled() {
        return Outcome::Aborted;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Outcome::Aborted,
        outcome = transport.execute(request) => outcome,
    }
}
