pub mod controller;
pub mod upload;

use crate::transport::{Outcome, Transport, TransportRequest};
use clap::ValueEnum;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use controller::{
    ControllerError, SessionController, SessionInfo, SessionStatus, StatusSnapshot,
};

/// Endpoint naming scheme spoken by the server.
#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum ApiFlavor {
    /// `id/request`, `file/upload`, `id/retire`
    #[default]
    V1,
    /// `token/request`, `upload`, `token/cancel`
    Legacy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoints {
    pub request: &'static str,
    pub upload: &'static str,
    pub retire: &'static str,
    pub download: &'static str,
}

impl ApiFlavor {
    pub fn endpoints(self) -> Endpoints {
        match self {
            ApiFlavor::V1 => Endpoints {
                request: "id/request",
                upload: "file/upload",
                retire: "id/retire",
                download: "file/download",
            },
            ApiFlavor::Legacy => Endpoints {
                request: "token/request",
                upload: "upload",
                retire: "token/cancel",
                download: "file/download",
            },
        }
    }
}

/// The (identifier, secret) pair issued for one session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    id: String,
    secret: String,
}

impl SessionCredentials {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Tags `request` with the `id` and `secret` query parameters.
    pub(crate) fn authorize(&self, request: TransportRequest) -> TransportRequest {
        request
            .query("id", self.id.as_str())
            .query("secret", self.secret.as_str())
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session request failed: {0}")]
    NegotiationFailed(Outcome),
    #[error("invalid session response: {0}")]
    InvalidResponse(String),
}

/// How an exit-time retirement was handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetireDelivery {
    Beacon,
    Blocking(Outcome),
}

/// Acquires and retires sessions on the paste server.
#[derive(Clone)]
pub struct Negotiator {
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
    request_timeout: Option<Duration>,
}

impl Negotiator {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoints: Endpoints,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            endpoints,
            request_timeout,
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    /// Requests a new session sized for `declared_length` bytes.
    ///
    /// No retry happens here; a failed negotiation is reported as-is.
    pub async fn request_session(
        &self,
        declared_length: usize,
    ) -> Result<SessionCredentials, SessionError> {
        let request = TransportRequest::post(self.endpoints.request)
            .query("length", declared_length.to_string())
            .timeout(self.request_timeout);
        match self.transport.execute(request).await {
            Outcome::Success(body) => {
                let credentials = parse_credentials(&body)?;
                debug!(
                    target: "livepaste::session",
                    session_id = %credentials.id(),
                    declared_length,
                    "session issued"
                );
                Ok(credentials)
            }
            outcome => {
                warn!(
                    target: "livepaste::session",
                    outcome = outcome.label(),
                    declared_length,
                    "session request failed"
                );
                Err(SessionError::NegotiationFailed(outcome))
            }
        }
    }

    /// Retires a session over the normal asynchronous path.
    pub async fn retire(&self, credentials: &SessionCredentials) -> Outcome {
        let outcome = self
            .transport
            .execute(self.retire_request(credentials))
            .await;
        self.log_retirement(credentials, &outcome);
        outcome
    }

    /// Retires a session, blocking the calling thread until the server answers.
    pub fn retire_blocking(&self, credentials: &SessionCredentials) -> Outcome {
        let outcome = self
            .transport
            .execute_blocking(self.retire_request(credentials));
        self.log_retirement(credentials, &outcome);
        outcome
    }

    /// Retires a session during teardown: beacon when the transport offers
    /// one, otherwise a blocking request.
    pub fn retire_on_teardown(&self, credentials: &SessionCredentials) -> RetireDelivery {
        if self.transport.beacon(self.retire_request(credentials)) {
            debug!(
                target: "livepaste::session",
                session_id = %credentials.id(),
                "retirement queued as beacon"
            );
            return RetireDelivery::Beacon;
        }
        RetireDelivery::Blocking(self.retire_blocking(credentials))
    }

    fn retire_request(&self, credentials: &SessionCredentials) -> TransportRequest {
        credentials
            .authorize(TransportRequest::post(self.endpoints.retire))
            .timeout(self.request_timeout)
    }

    fn log_retirement(&self, credentials: &SessionCredentials, outcome: &Outcome) {
        if outcome.is_success() {
            debug!(
                target: "livepaste::session",
                session_id = %credentials.id(),
                "session retired"
            );
        } else {
            warn!(
                target: "livepaste::session",
                session_id = %credentials.id(),
                outcome = %outcome,
                "session retirement failed"
            );
        }
    }
}

/// Parses the `<identifier>,<secret>` body returned by a session request.
pub fn parse_credentials(body: &str) -> Result<SessionCredentials, SessionError> {
    let mut fields = body.trim().split(',').map(str::trim);
    match (fields.next(), fields.next(), fields.next()) {
        (Some(id), Some(secret), None) if !id.is_empty() && !secret.is_empty() => {
            Ok(SessionCredentials::new(id, secret))
        }
        _ => Err(SessionError::InvalidResponse(format!(
            "expected '<id>,<secret>', got {:?}",
            truncate(body, 64)
        ))),
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::ScriptedTransport;

    fn negotiator(transport: &Arc<ScriptedTransport>) -> Negotiator {
        Negotiator::new(
            transport.clone(),
            ApiFlavor::V1.endpoints(),
            Some(Duration::from_secs(5)),
        )
    }

    #[test]
    fn parses_identifier_and_secret() {
        let credentials = parse_credentials("Ab3xYz,S3cr3t\n").unwrap();
        assert_eq!(credentials.id(), "Ab3xYz");
        assert_eq!(credentials.secret(), "S3cr3t");
    }

    #[test]
    fn rejects_malformed_bodies() {
        for body in ["", "only-id", "id,", ",secret", "a,b,c", " , "] {
            assert!(
                matches!(parse_credentials(body), Err(SessionError::InvalidResponse(_))),
                "{body:?}"
            );
        }
    }

    #[test]
    fn debug_output_redacts_secret() {
        let rendered = format!("{:?}", SessionCredentials::new("id1", "sec1"));
        assert!(rendered.contains("id1"));
        assert!(!rendered.contains("sec1"));
    }

    #[test]
    fn legacy_flavor_uses_token_paths() {
        let endpoints = ApiFlavor::Legacy.endpoints();
        assert_eq!(endpoints.request, "token/request");
        assert_eq!(endpoints.upload, "upload");
        assert_eq!(endpoints.retire, "token/cancel");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn request_session_declares_byte_length() {
        let transport = ScriptedTransport::new();
        transport.script("id/request", [Outcome::Success("id1,sec1".into())]);

        let credentials = negotiator(&transport)
            .request_session("😀".len())
            .await
            .unwrap();

        assert_eq!(credentials, SessionCredentials::new("id1", "sec1"));
        let sent = transport.requests("id/request");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].query_value("length"), Some("4"));
        assert!(sent[0].body.is_none());
        assert_eq!(sent[0].timeout, Some(Duration::from_secs(5)));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn request_session_surfaces_transport_failure_without_retry() {
        let transport = ScriptedTransport::new();
        transport.script(
            "id/request",
            [Outcome::HttpError {
                status: 400,
                body: "Content is too long".into(),
            }],
        );

        let err = negotiator(&transport).request_session(10).await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::NegotiationFailed(Outcome::HttpError { status: 400, .. })
        ));
        assert_eq!(transport.requests("id/request").len(), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn retire_tags_request_with_credentials() {
        let transport = ScriptedTransport::new();
        transport.script("id/retire", [Outcome::Success(String::new())]);
        let credentials = SessionCredentials::new("id1", "sec1");

        let outcome = negotiator(&transport).retire(&credentials).await;

        assert!(outcome.is_success());
        let sent = transport.requests("id/retire");
        assert_eq!(sent[0].query_value("id"), Some("id1"));
        assert_eq!(sent[0].query_value("secret"), Some("sec1"));
    }

    #[test]
    fn teardown_prefers_beacon_and_falls_back_to_blocking() {
        let transport = ScriptedTransport::new();
        let negotiator = negotiator(&transport);
        let credentials = SessionCredentials::new("id1", "sec1");

        assert_eq!(
            negotiator.retire_on_teardown(&credentials),
            RetireDelivery::Beacon
        );
        assert_eq!(transport.beacons().len(), 1);
        assert!(transport.blocking_requests().is_empty());

        transport.set_beacon_supported(false);
        assert_eq!(
            negotiator.retire_on_teardown(&credentials),
            RetireDelivery::Blocking(Outcome::Success(String::new()))
        );
        let blocking = transport.blocking_requests();
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].path, "id/retire");
        assert_eq!(blocking[0].query_value("secret"), Some("sec1"));
    }
}
