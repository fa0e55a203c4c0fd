pub mod buffer;
pub mod config;
pub mod notify;
pub mod session;
pub mod telemetry;
pub mod terminal;
pub mod transport;
