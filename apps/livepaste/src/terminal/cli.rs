use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{
    ClientConfig, ConfigError, DEFAULT_API_PREFIX, DEFAULT_MAX_LENGTH, DEFAULT_SERVER,
};
use crate::session::ApiFlavor;
use crate::session::upload::{ErrorCounter, RetryPolicy};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "livepaste",
    about = "📋 Share a text buffer as a live download link",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[command(flatten)]
    pub client: ClientArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Share a file or stdin (default when no subcommand given)
    Share(ShareArgs),
    /// Print the download link for a session id without contacting the server
    Link(LinkArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(
        long,
        global = true,
        env = "LIVEPASTE_SERVER",
        default_value = DEFAULT_SERVER,
        help = "Base URL of the paste server"
    )]
    pub server: String,

    #[arg(
        long = "api-prefix",
        global = true,
        env = "LIVEPASTE_API_PREFIX",
        default_value = DEFAULT_API_PREFIX,
        value_name = "PREFIX",
        help = "Path segment between the server URL and the API endpoints"
    )]
    pub api_prefix: String,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = ApiFlavor::V1,
        help = "Endpoint naming scheme spoken by the server"
    )]
    pub flavor: ApiFlavor,

    #[arg(
        long = "max-errors",
        global = true,
        value_name = "COUNT",
        default_value_t = ErrorCounter::DEFAULT_THRESHOLD,
        help = "Consecutive failed uploads before the session is abandoned"
    )]
    pub max_errors: u32,

    #[arg(
        long = "upload-timeout-secs",
        global = true,
        value_name = "SECS",
        help = "Per-attempt upload timeout (unbounded when omitted)"
    )]
    pub upload_timeout_secs: Option<u64>,

    #[arg(
        long = "request-timeout-secs",
        global = true,
        value_name = "SECS",
        default_value_t = 10,
        help = "Timeout for session request and retirement calls (0 disables)"
    )]
    pub request_timeout_secs: u64,

    #[arg(
        long = "connect-timeout-secs",
        global = true,
        value_name = "SECS",
        default_value_t = 3,
        help = "TCP/TLS connect timeout"
    )]
    pub connect_timeout_secs: u64,

    #[arg(
        long = "max-length",
        global = true,
        value_name = "BYTES",
        default_value_t = DEFAULT_MAX_LENGTH,
        help = "Refuse pastes larger than this many bytes (0 disables the check)"
    )]
    pub max_length: usize,

    #[arg(
        long = "retry-backoff",
        global = true,
        value_enum,
        default_value_t = BackoffMode::None,
        help = "Delay between consecutive failed uploads"
    )]
    pub retry_backoff: BackoffMode,

    #[arg(
        long = "no-beacon",
        global = true,
        action = clap::ArgAction::SetTrue,
        help = "Retire on exit with a blocking request instead of a background beacon"
    )]
    pub no_beacon: bool,
}

impl ClientArgs {
    pub fn to_config(&self) -> Result<ClientConfig, ConfigError> {
        let request_timeout =
            (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs));
        Ok(ClientConfig::new(&self.server, &self.api_prefix)?
            .with_flavor(self.flavor)
            .with_max_consecutive_errors(self.max_errors)
            .with_upload_timeout(self.upload_timeout_secs.map(Duration::from_secs))
            .with_request_timeout(request_timeout)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .with_max_length((self.max_length > 0).then_some(self.max_length))
            .with_retry(self.retry_backoff.policy())
            .with_beacon(!self.no_beacon))
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum BackoffMode {
    /// Resend immediately after a failure
    #[default]
    None,
    /// 250ms doubling up to 30s between consecutive failures
    Exponential,
}

impl BackoffMode {
    pub fn policy(self) -> RetryPolicy {
        match self {
            BackoffMode::None => RetryPolicy::Immediate,
            BackoffMode::Exponential => RetryPolicy::Exponential {
                base: Duration::from_millis(250),
                max: Duration::from_secs(30),
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "LIVEPASTE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "LIVEPASTE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct ShareArgs {
    #[arg(value_name = "FILE", help = "File to share (reads stdin when omitted)")]
    pub file: Option<PathBuf>,

    #[arg(
        long = "output",
        value_enum,
        default_value_t = OutputFormat::Default,
        help = "Print the link as a banner or as a json envelope"
    )]
    pub output: OutputFormat,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Default,
    Json,
}

#[derive(Args, Debug)]
pub struct LinkArgs {
    #[arg(value_name = "ID", help = "Session id issued by the server")]
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_shares_stdin_with_defaults() {
        let cli = Cli::try_parse_from(["livepaste"]).unwrap();
        assert!(cli.command.is_none());

        let config = cli.client.to_config().unwrap();
        assert_eq!(config.api_base().as_str(), "http://127.0.0.1:3000/1/");
        assert_eq!(config.max_consecutive_errors, 20);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.max_length, Some(DEFAULT_MAX_LENGTH));
        assert_eq!(config.retry, RetryPolicy::Immediate);
        assert!(config.beacon);
    }

    #[test]
    fn share_flags_map_onto_client_config() {
        let cli = Cli::try_parse_from([
            "livepaste",
            "share",
            "notes.txt",
            "--output",
            "json",
            "--server",
            "paste.example.com",
            "--flavor",
            "legacy",
            "--max-errors",
            "5",
            "--upload-timeout-secs",
            "30",
            "--request-timeout-secs",
            "0",
            "--max-length",
            "0",
            "--retry-backoff",
            "exponential",
            "--no-beacon",
        ])
        .unwrap();

        let Some(Command::Share(share)) = &cli.command else {
            panic!("expected share command");
        };
        assert_eq!(share.file.as_deref(), Some(std::path::Path::new("notes.txt")));
        assert_eq!(share.output, OutputFormat::Json);

        let config = cli.client.to_config().unwrap();
        assert_eq!(config.api_base().as_str(), "https://paste.example.com/1/");
        assert_eq!(config.flavor, ApiFlavor::Legacy);
        assert_eq!(config.max_consecutive_errors, 5);
        assert_eq!(config.upload_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.max_length, None);
        assert!(matches!(config.retry, RetryPolicy::Exponential { .. }));
        assert!(!config.beacon);
    }

    #[test]
    fn link_takes_an_id() {
        let cli = Cli::try_parse_from(["livepaste", "link", "Ab3xYz"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Link(LinkArgs { ref id })) if id == "Ab3xYz"));
    }
}
