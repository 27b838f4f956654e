//! Error types shared by all connection variants.
use std::time::Duration;

/// Represents all possible errors that can occur while talking to a meter.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `tokio_modbus::Error` (transport or framing failure).
    #[error(transparent)]
    TokioError(#[from] tokio_modbus::Error),

    /// The device answered with a Modbus exception.
    #[error(transparent)]
    TokioExceptionError(#[from] tokio_modbus::ExceptionCode),

    /// Opening or using the transport failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// No connection or response within the configured timeout.
    #[error("Modbus operation timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid connection configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Wraps `serde_yaml::Error`.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Returns `true` if the error was caused by a request or connect timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Io(err) => err.kind() == std::io::ErrorKind::TimedOut,
            Error::TokioError(tokio_modbus::Error::Transport(err)) => {
                err.kind() == std::io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }
}

/// The result type for connection operations.
pub type Result<T> = std::result::Result<T, Error>;
