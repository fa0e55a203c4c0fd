use crate::session::ApiFlavor;
use crate::session::upload::{ErrorCounter, RetryPolicy};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:3000";
pub const DEFAULT_API_PREFIX: &str = "1";
/// Mirrors the server's default `max_content_length`.
pub const DEFAULT_MAX_LENGTH: usize = 1024 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server url cannot be empty")]
    EmptyServer,
    #[error("invalid server url '{url}': {reason}")]
    InvalidServer { url: String, reason: String },
}

/// Client settings shared by the transport, negotiator and controller.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    api_base: Url,
    download: Url,
    pub flavor: ApiFlavor,
    pub max_consecutive_errors: u32,
    pub upload_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Client-side cap on the snapshot size; `None` leaves it to the server.
    pub max_length: Option<usize>,
    pub retry: RetryPolicy,
    /// Prefer beacon delivery when retiring on exit.
    pub beacon: bool,
}

impl ClientConfig {
    /// Builds a config for `server` with API paths rooted at `<server>/<api_prefix>/`.
    ///
    /// Bare hosts get a scheme inferred from the address: plain http for
    /// loopback and private ranges, https otherwise.
    pub fn new(server: impl AsRef<str>, api_prefix: &str) -> Result<Self, ConfigError> {
        let raw = server.as_ref().trim();
        if raw.is_empty() {
            return Err(ConfigError::EmptyServer);
        }
        let candidate = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("{}{raw}", infer_scheme(raw))
        };
        let invalid = |reason: String| ConfigError::InvalidServer {
            url: raw.to_string(),
            reason,
        };
        let mut api_base = Url::parse(&candidate).map_err(|err| invalid(err.to_string()))?;
        if !matches!(api_base.scheme(), "http" | "https") || api_base.cannot_be_a_base() {
            return Err(invalid("expected an http or https url".into()));
        }

        let mut path = api_base.path().trim_end_matches('/').to_string();
        let prefix = api_prefix.trim_matches('/');
        if !prefix.is_empty() {
            path.push('/');
            path.push_str(prefix);
        }
        path.push('/');
        api_base.set_path(&path);
        api_base.set_query(None);
        api_base.set_fragment(None);

        let flavor = ApiFlavor::default();
        let download = api_base
            .join(flavor.endpoints().download)
            .map_err(|err| invalid(err.to_string()))?;

        Ok(Self {
            api_base,
            download,
            flavor,
            max_consecutive_errors: ErrorCounter::DEFAULT_THRESHOLD,
            upload_timeout: None,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_length: Some(DEFAULT_MAX_LENGTH),
            retry: RetryPolicy::Immediate,
            beacon: true,
        })
    }

    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    /// Switches endpoint paths; the download path is shared by both flavors.
    pub fn with_flavor(mut self, flavor: ApiFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn with_max_consecutive_errors(mut self, threshold: u32) -> Self {
        self.max_consecutive_errors = threshold.max(1);
        self
    }

    pub fn with_upload_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.upload_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_length(mut self, limit: Option<usize>) -> Self {
        self.max_length = limit;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_beacon(mut self, enabled: bool) -> Self {
        self.beacon = enabled;
        self
    }

    /// Shareable link for a session identifier.
    pub fn download_link(&self, id: &str) -> Url {
        let mut link = self.download.clone();
        link.query_pairs_mut().append_pair("id", id);
        link
    }
}

fn infer_scheme(base: &str) -> &'static str {
    let authority = base.split('/').next().unwrap_or(base);
    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or(bracketed)
    } else {
        authority.split(':').next().unwrap_or(authority)
    };
    let host = host.to_ascii_lowercase();

    let private_172 = host
        .strip_prefix("172.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|octet| octet.parse::<u8>().ok())
        .is_some_and(|octet| (16..32).contains(&octet));
    let local = host == "localhost"
        || host == "0.0.0.0"
        || host == "::1"
        || host.starts_with("127.")
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || private_172;

    if local { "http://" } else { "https://" }
}
