pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Full `EnvFilter` directive string; replaces the level-derived default.
    pub const FILTER_ENV: &str = "LIVEPASTE_LOG_FILTER";
    /// When truthy, the HTTP stack logs at the same level as livepaste.
    pub const TRACE_DEPS_ENV: &str = "LIVEPASTE_TRACE_DEPS";

    /// Every livepaste event uses a `livepaste::*` target.
    const OWN_TARGET: &str = "livepaste";
    const HTTP_STACK: &[&str] = &["reqwest", "hyper", "hyper_util", "h2", "rustls"];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Append to this file instead of writing to stderr.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let directives = match std::env::var(FILTER_ENV) {
            Ok(custom) => custom,
            Err(_) => default_directives(config.level, http_stack_requested()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(&directives))
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        tracing::debug!(target: "livepaste::cli", %directives, "log filter installed");
        Ok(())
    }

    fn http_stack_requested() -> bool {
        std::env::var(TRACE_DEPS_ENV).is_ok_and(|value| !value.is_empty() && value != "0")
    }

    /// Dependencies stay at `warn` unless `with_http_stack` is set; only
    /// livepaste's own targets follow `level` past that.
    fn default_directives(level: LogLevel, with_http_stack: bool) -> String {
        if level <= LogLevel::Warn {
            return level.as_str().to_owned();
        }
        let level = level.as_str();
        let mut directives = vec![format!("warn,{OWN_TARGET}={level}")];
        if with_http_stack {
            directives.extend(HTTP_STACK.iter().map(|target| format!("{target}={level}")));
        }
        directives.join(",")
    }

}
