//! Error taxonomy
//!
//! Every failure a worker can report resolves to one of these kinds; the
//! kind decides whether the message is retried or parked. Handler and
//! transport errors never escape the worker loops — they become failure
//! records on the strategy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Transport adapter rejects publishes right now; retry next tick
    TransportNotReady,
    /// Publish threw; counts as an attempt
    TransportException,
    /// Envelope cannot be decoded; usually terminal
    SerializationError,
    /// Handler rejected the payload shape; terminal
    ValidationError,
    /// Attempt cap reached; no further claim
    MaxAttemptsExceeded,
    /// Lease was gone on completion; another instance will claim
    LeaseExpired,
    /// Default fallback; retry
    Unknown,
}

impl ErrorKind {
    /// Terminal kinds are never retried by the runtime
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorKind::SerializationError | ErrorKind::ValidationError | ErrorKind::MaxAttemptsExceeded
        )
    }

    pub fn is_retryable(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TransportNotReady => "TRANSPORT_NOT_READY",
            ErrorKind::TransportException => "TRANSPORT_EXCEPTION",
            ErrorKind::SerializationError => "SERIALIZATION_ERROR",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
            ErrorKind::LeaseExpired => "LEASE_EXPIRED",
            ErrorKind::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// A classified work error: kind plus detail string
///
/// This is the shape stored in a row's `error` column and carried in
/// failure reports.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct WorkError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WorkError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport_not_ready() -> Self {
        Self::new(ErrorKind::TransportNotReady, "transport not ready")
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransportException, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SerializationError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }
}

/// Domain-rule violations
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invariant violation: {invariant}")]
    InvariantViolation { invariant: String },

    #[error("unknown envelope type: {envelope_type}")]
    UnknownEnvelopeType { envelope_type: String },

    #[error("no handler registered for {envelope_type}")]
    NoHandler { envelope_type: String },
}
