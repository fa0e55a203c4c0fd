use clap::Parser;
use livepaste_client_core::telemetry::logging;
use livepaste_client_core::terminal::{app, cli::Cli, error::CliError};
use tracing::debug;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(
        target: "livepaste::cli",
        log_level = log_config.level.as_str(),
        log_file = ?log_config.file,
        "logging configured"
    );
    app::run(cli).await
}
