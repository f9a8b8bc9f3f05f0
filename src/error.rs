//! Error taxonomy for the relay stage
//!
//! Transient transport errors are recovered locally through reconnection,
//! per-message errors are isolated to the offending message, and only
//! configuration errors are fatal.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// Broker unreachable or session lost. Retried with backoff.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Broker rejected the subscription. Retried with a new session.
    #[error("Subscription error on '{topic}': {message}")]
    Subscription { topic: String, message: String },

    /// Payload could not be decoded. The message is skipped.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Outbound publish failed. The message is dropped.
    #[error("Publish error on '{topic}': {message}")]
    Publish { topic: String, message: String },

    /// Invalid configuration at startup. Never retried.
    #[error("Fatal configuration error: {0}")]
    FatalConfig(#[from] crate::config::ConfigError),
}

/// Payload decoding failure raised by a transform
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8 (invalid byte at offset {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },

    #[error("{0}")]
    Rejected(String),
}

impl RelayError {
    /// Create connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create subscription error
    pub fn subscription<T: Into<String>, S: Into<String>>(topic: T, message: S) -> Self {
        Self::Subscription {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create publish error
    pub fn publish<T: Into<String>, S: Into<String>>(topic: T, message: S) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Errors recovered by tearing down the session and reconnecting
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Connection { .. } | RelayError::Subscription { .. }
        )
    }

    /// Errors scoped to a single message; the stage keeps running
    pub fn is_per_message(&self) -> bool {
        matches!(self, RelayError::Decode(_) | RelayError::Publish { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::FatalConfig(_))
    }

    /// Short machine-readable kind for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Connection { .. } => "connection",
            RelayError::Subscription { .. } => "subscription",
            RelayError::Decode(_) => "decode",
            RelayError::Publish { .. } => "publish",
            RelayError::FatalConfig(_) => "fatal_config",
        }
    }

    /// Rendered error text safe to hand to the observability sink
    pub fn report(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("static regex is valid")
});

static CREDENTIAL_URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(mqtts?|tcp|ssl|wss?)://[^:/@\s]+:[^@/\s]+@").expect("static regex is valid")
});

/// Sanitize error messages to prevent credential leakage into logs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = CREDENTIAL_URL_PATTERN
        .replace_all(&sanitized, "${1}://***@")
        .to_string();

    // Truncate very long messages - total length stays <= 500
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
