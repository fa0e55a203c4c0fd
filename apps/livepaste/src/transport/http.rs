use super::{Outcome, Transport, TransportRequest};
use crate::config::ClientConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};
use url::Url;

/// Upper bound for teardown requests that carry no timeout of their own.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const BEACON_POLL: Duration = Duration::from_millis(10);

/// HTTP transport backed by reqwest.
///
/// Asynchronous requests share one pooled client. Blocking and beacon
/// deliveries run on dedicated threads with their own blocking client, so
/// they work whether or not a Tokio runtime is still alive.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    api_base: Url,
    connect_timeout: Duration,
    beacon_enabled: bool,
    beacons: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base().clone(),
            connect_timeout: config.connect_timeout,
            beacon_enabled: config.beacon,
            beacons: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    fn resolve(&self, request: &TransportRequest) -> Result<Url, String> {
        resolve(&self.api_base, request)
    }
}

fn resolve(base: &Url, request: &TransportRequest) -> Result<Url, String> {
    let mut url = base
        .join(request.path.trim_start_matches('/'))
        .map_err(|err| format!("invalid endpoint '{}': {err}", request.path))?;
    if !request.query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &request.query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

fn classify(status: StatusCode, body: String) -> Outcome {
    if status.is_success() {
        Outcome::Success(body)
    } else {
        Outcome::HttpError {
            status: status.as_u16(),
            body,
        }
    }
}

fn from_error(err: reqwest::Error) -> Outcome {
    if err.is_timeout() {
        Outcome::Timeout
    } else {
        Outcome::NetworkError(err.to_string())
    }
}

fn send_blocking(url: Url, request: TransportRequest, connect_timeout: Duration) -> Outcome {
    let client = match reqwest::blocking::Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(request.timeout.unwrap_or(TEARDOWN_TIMEOUT))
        .no_proxy()
        .build()
    {
        Ok(client) => client,
        Err(err) => return Outcome::NetworkError(err.to_string()),
    };
    let mut builder = client.request(request.method.into(), url);
    if let Some(content_type) = request.content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    if let Some(body) = request.body {
        builder = builder.body(body.to_vec());
    }
    match builder.send() {
        Ok(response) => {
            let status = response.status();
            match response.text() {
                Ok(body) => classify(status, body),
                Err(err) => from_error(err),
            }
        }
        Err(err) => from_error(err),
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: TransportRequest) -> Outcome {
        let url = match self.resolve(&request) {
            Ok(url) => url,
            Err(cause) => return Outcome::NetworkError(cause),
        };
        trace!(target: "livepaste::transport", path = %request.path, "sending request");

        let mut builder = self.client.request(request.method.into(), url);
        if let Some(content_type) = request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                match response.text().await {
                    Ok(body) => classify(status, body),
                    Err(err) => from_error(err),
                }
            }
            Err(err) => from_error(err),
        }
    }

    fn execute_blocking(&self, request: TransportRequest) -> Outcome {
        let url = match self.resolve(&request) {
            Ok(url) => url,
            Err(cause) => return Outcome::NetworkError(cause),
        };
        let connect_timeout = self.connect_timeout;
        // The blocking client owns an internal runtime that must not be
        // created or dropped on an async worker thread.
        let worker = thread::Builder::new()
            .name("livepaste-blocking".into())
            .spawn(move || send_blocking(url, request, connect_timeout));
        match worker {
            Ok(handle) => handle.join().unwrap_or_else(|_| {
                Outcome::NetworkError("blocking request thread panicked".into())
            }),
            Err(err) => Outcome::NetworkError(format!("unable to spawn request thread: {err}")),
        }
    }

    fn beacon(&self, request: TransportRequest) -> bool {
        if !self.beacon_enabled {
            return false;
        }
        let url = match self.resolve(&request) {
            Ok(url) => url,
            Err(cause) => {
                warn!(target: "livepaste::transport", %cause, "beacon not sent");
                return false;
            }
        };
        let connect_timeout = self.connect_timeout;
        let path = request.path.clone();
        let spawned = thread::Builder::new()
            .name("livepaste-beacon".into())
            .spawn(move || {
                let outcome = send_blocking(url, request, connect_timeout);
                debug!(
                    target: "livepaste::transport",
                    %path,
                    outcome = outcome.label(),
                    "beacon delivered"
                );
            });
        match spawned {
            Ok(handle) => {
                self.beacons.lock().push(handle);
                true
            }
            Err(err) => {
                warn!(target: "livepaste::transport", error = %err, "unable to queue beacon");
                false
            }
        }
    }

    async fn flush_beacons(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let pending = {
                let mut beacons = self.beacons.lock();
                let (finished, running): (Vec<_>, Vec<_>) =
                    beacons.drain(..).partition(|handle| handle.is_finished());
                *beacons = running;
                for handle in finished {
                    let _ = handle.join();
                }
                beacons.len()
            };
            if pending == 0 {
                return 0;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    target: "livepaste::transport",
                    pending,
                    "beacon deliveries still running at exit"
                );
                return pending;
            }
            tokio::time::sleep(BEACON_POLL).await;
        }
    }
}
