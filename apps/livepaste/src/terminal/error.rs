use crate::config::ConfigError;
use crate::session::ControllerError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Session(#[from] ControllerError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("http client setup failed: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("output failed: {0}")]
    Output(String),
    #[error("session abandoned after repeated upload failures")]
    Abandoned,
    #[error("interrupted before the session started")]
    Interrupted,
}
