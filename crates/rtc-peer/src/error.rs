//! Error types for peer-connection operations

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::signaling::SignalingState;

/// Result type alias using the peer-connection Error
pub type Result<T> = std::result::Result<T, Error>;

/// Structured SDP parse failure.
///
/// `line` is 1-based; `0` refers to the description as a whole (for example
/// an unknown description type). A missing mandatory line is reported one
/// past the last line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("SDP parse error at line {line} ({field}): {reason}")]
pub struct SdpParseError {
    /// Line number of the offending line
    pub line: usize,
    /// Field that failed to parse, e.g. `o.sess-version` or `m.port`
    pub field: String,
    /// Human readable reason
    pub reason: String,
}

impl SdpParseError {
    pub fn new(line: usize, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            line,
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Reason an engine gave for refusing a configuration change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigurationErrorKind {
    UnsupportedOperation,
    UnsupportedParameter,
    InvalidParameter,
    InvalidRange,
    SyntaxError,
    InvalidState,
    InvalidModification,
    NetworkError,
    ResourceExhausted,
    InternalError,
}

impl fmt::Display for ConfigurationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnsupportedOperation => "unsupported operation",
            Self::UnsupportedParameter => "unsupported parameter",
            Self::InvalidParameter => "invalid parameter",
            Self::InvalidRange => "invalid range",
            Self::SyntaxError => "syntax error",
            Self::InvalidState => "invalid state",
            Self::InvalidModification => "invalid modification",
            Self::NetworkError => "network error",
            Self::ResourceExhausted => "resource exhausted",
            Self::InternalError => "internal error",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in peer-connection operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Media engine factory could not be constructed
    #[error("Factory error: {0}")]
    Factory(String),

    /// Engine refused to create the connection
    #[error("Connection create error: {0}")]
    ConnectionCreate(String),

    /// Operation not allowed in the current signaling state
    #[error("Invalid state ({state}): {reason}")]
    InvalidState {
        state: SignalingState,
        reason: String,
    },

    /// Engine did not complete a negotiation request in time
    #[error("Negotiation timeout: {operation} did not complete within {timeout:?}")]
    NegotiationTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Engine reported failure for a negotiation request
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Malformed session description
    #[error(transparent)]
    SdpParse(#[from] SdpParseError),

    /// Malformed ICE candidate
    #[error("Candidate parse error: {0}")]
    CandidateParse(String),

    /// Engine declined a well-formed ICE candidate
    #[error("Candidate rejected: {0}")]
    CandidateRejected(String),

    /// Data channel could not be created
    #[error("Channel create error: {0}")]
    ChannelCreate(String),

    /// Engine refused a configuration change; previous configuration stays active
    #[error("Configuration rejected ({kind}): {message}")]
    ConfigurationRejected {
        kind: ConfigurationErrorKind,
        message: String,
    },

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Data channel operation error
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// Media track error
    #[error("Media track error: {0}")]
    Track(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn invalid_state(state: SignalingState, reason: impl Into<String>) -> Self {
        Error::InvalidState {
            state,
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NegotiationTimeout { .. } | Error::NegotiationFailed(_)
        )
    }

    /// Check if this error came out of offer/answer negotiation
    pub fn is_negotiation_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidState { .. }
                | Error::NegotiationTimeout { .. }
                | Error::NegotiationFailed(_)
                | Error::SdpParse(_)
        )
    }

    /// Check if this error is candidate related
    pub fn is_candidate_error(&self) -> bool {
        matches!(self, Error::CandidateParse(_) | Error::CandidateRejected(_))
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_) | Error::ConfigurationRejected { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
