//! Error types for the connector

use thiserror::Error;

/// Coarse classification of a [`ConnectorError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    AlreadyExists,
    ExchangeRejected,
    Transport,
    GapRecovery,
    Shutdown,
    Internal,
}

/// Connector errors
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Exchange rejected request ({code}): {message}")]
    ExchangeRejected { code: i64, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Gap recovery failed for {symbol}: {reason}")]
    GapRecovery { symbol: String, reason: String },

    #[error("Component is shutting down")]
    Shutdown,

    #[error("Failed to parse message: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ConnectorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::ExchangeRejected { .. } => ErrorKind::ExchangeRejected,
            Self::Transport(_) => ErrorKind::Transport,
            Self::GapRecovery { .. } => ErrorKind::GapRecovery,
            Self::Shutdown => ErrorKind::Shutdown,
            Self::Parse(_) | Self::Config(_) | Self::Ipc(_) | Self::Serialization(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ConnectorError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        ConnectorError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        ConnectorError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for ConnectorError {
    fn from(err: std::io::Error) -> Self {
        ConnectorError::Ipc(err.to_string())
    }
}

impl From<rust_decimal::Error> for ConnectorError {
    fn from(err: rust_decimal::Error) -> Self {
        ConnectorError::InvalidInput(format!("malformed decimal: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
