//! Signaling error types.
//!
//! Every variant maps to a stable wire code sent back to the client in an
//! `error` envelope. Failures are scoped to the connection that caused them.

use thiserror::Error;

/// Errors surfaced by the media engine capability boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine rejected the call (resource exhaustion, bad parameters, ...)
    #[error("media engine call failed: {0}")]
    Failure(String),

    /// The engine's worker is gone; no room can be trusted anymore
    #[error("media engine worker died: {0}")]
    Fatal(String),

    /// The handle the call was made on has already been closed
    #[error("media engine resource closed: {0}")]
    Closed(String),
}

#[derive(Error, Debug)]
pub enum SignalError {
    /// Malformed envelope, unknown event or missing field
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation issued out of sequence
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Already joined room {0}")]
    AlreadyJoined(String),

    /// Capability mismatch on CONSUME
    #[error("Incompatible: {0}")]
    Incompatible(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl SignalError {
    /// Wire code carried in the `error` envelope
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol_error",
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::AlreadyJoined(_) => "already_joined",
            Self::Incompatible(_) => "incompatible",
            Self::CapacityExceeded(_) => "capacity_exceeded",
            Self::Engine(EngineError::Fatal(_)) => "engine_fatal",
            Self::Engine(_) => "engine_failure",
        }
    }

    /// True when the error means the whole engine is unusable
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Engine(EngineError::Fatal(_)))
    }
}

pub type Result<T> = std::result::Result<T, SignalError>;
