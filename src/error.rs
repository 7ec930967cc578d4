//! Error types for TapNat Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TapNatError {
    #[error("Engine not running")]
    NotRunning,

    #[error("Engine already running")]
    AlreadyRunning,

    #[error("Lock error")]
    LockError,

    #[error("Socket error: {0}")]
    SocketError(String),

    #[error("No local port available")]
    PortsExhausted,

    #[error("SOCKS5 error: {0}")]
    Socks5Error(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<std::io::Error> for TapNatError {
    fn from(e: std::io::Error) -> Self {
        TapNatError::IoError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TapNatError>;
