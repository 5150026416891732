//! Domain errors raised by the trading state machine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Venue error codes that mean "slow down" rather than "rejected".
const RATE_LIMIT_CODES: [&str; 2] = ["RateLimit", "RateLimitExceeded"];

/// Errors produced by the session controller and its components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TradingError {
    /// Missing or invalid bot parameter at start.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Tick or history price that is not a finite number.
    #[error("invalid quote: {0}")]
    InvalidQuote(String),

    /// Generic rejection from the order venue.
    #[error("venue error [{code}]: {message}")]
    Venue { code: String, message: String },

    /// Upstream throttling. Retried internally, never reported.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Settlement for a contract that is not the one currently open.
    #[error("unexpected settlement for contract {contract_id} (open: {open:?})")]
    UnexpectedSettlement { contract_id: u64, open: Option<u64> },
}

impl TradingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TradingError::Configuration(_) => ErrorKind::ConfigurationError,
            TradingError::InvalidQuote(_) => ErrorKind::InvalidQuote,
            TradingError::Venue { .. } => ErrorKind::VenueError,
            TradingError::RateLimitExceeded(_) => ErrorKind::RateLimitExceeded,
            TradingError::UnexpectedSettlement { .. } => ErrorKind::UnexpectedSettlement,
        }
    }

    /// Whether this error stops further trading once reported.
    pub fn halts_trading(&self) -> bool {
        !matches!(
            self,
            TradingError::InvalidQuote(_) | TradingError::RateLimitExceeded(_)
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        TradingError::Configuration(message.into())
    }

    /// Classify an error code returned by the venue.
    pub fn from_venue(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        if RATE_LIMIT_CODES.contains(&code.as_str()) {
            TradingError::RateLimitExceeded(message.into())
        } else {
            TradingError::Venue {
                code,
                message: message.into(),
            }
        }
    }
}

/// Error classification published to the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigurationError,
    InvalidQuote,
    VenueError,
    RateLimitExceeded,
    UnexpectedSettlement,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::ConfigurationError => "ConfigurationError",
            ErrorKind::InvalidQuote => "InvalidQuote",
            ErrorKind::VenueError => "VenueError",
            ErrorKind::RateLimitExceeded => "RateLimitExceeded",
            ErrorKind::UnexpectedSettlement => "UnexpectedSettlement",
        };
        f.write_str(name)
    }
}
