//! Error types for podforward

use thiserror::Error;

/// Main error type for podforward
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{}", format_dial(.status, .message))]
    Dial {
        status: Option<u16>,
        message: String,
    },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Tunnel stopped before it became ready")]
    Cancelled,

    #[error("Timeout after {0:.1} seconds")]
    Timeout(f64),

    #[error("Failed to listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Coarse classification of [`TunnelError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing connection parameters
    Configuration,
    /// Malformed target or port pair
    Validation,
    /// The upgrade handshake did not complete
    Dial,
    /// Failure after the streams were established
    Stream,
    /// Stopped or timed out before the tunnel was ready
    Cancelled,
    /// Local socket failure
    Io,
}

impl TunnelError {
    /// Shorthand for a dial failure that has no HTTP status attached
    pub fn dial(message: impl Into<String>) -> Self {
        TunnelError::Dial {
            status: None,
            message: message.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Config(_) | TunnelError::UrlParse(_) => ErrorKind::Configuration,
            TunnelError::Validation(_) => ErrorKind::Validation,
            TunnelError::Dial { .. } => ErrorKind::Dial,
            TunnelError::Stream(_) => ErrorKind::Stream,
            TunnelError::Cancelled | TunnelError::Timeout(_) => ErrorKind::Cancelled,
            TunnelError::Listen { .. } | TunnelError::Io(_) => ErrorKind::Io,
        }
    }

    /// HTTP status of a rejected upgrade, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            TunnelError::Dial { status, .. } => *status,
            _ => None,
        }
    }
}

fn format_dial(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("Dial error: upgrade rejected with HTTP {}: {}", code, message),
        None => format!("Dial error: {}", message),
    }
}

impl From<serde_yaml::Error> for TunnelError {
    fn from(err: serde_yaml::Error) -> Self {
        TunnelError::Config(format!("Invalid kubeconfig: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
