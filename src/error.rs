use std::time::Duration;

use thiserror::Error;

use crate::CorrelationId;

/// Errors that can occur while dispatching a call or managing the broker link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The broker connection could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// No channel is currently established with the broker.
    #[error("not connected to broker")]
    NotConnected,

    /// The channel did not accept the request for delivery.
    #[error("publish failed: {0}")]
    Publish(String),

    /// No terminal response arrived within the call's window.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The worker reported an explicit error. Carries the worker's message verbatim.
    #[error("{0}")]
    Remote(String),

    /// An inbound message could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A request could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// The call was cancelled before it settled.
    #[error("call cancelled")]
    Cancelled,

    /// A call with this correlation id is already pending.
    #[error("correlation id already pending: {0}")]
    DuplicateCorrelationId(CorrelationId),

    /// Configuration value present but invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Required configuration value missing.
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// Broker-level failure reported by a transport.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Coarse classification of a failed call, as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Connection,
    Publish,
    Timeout,
    Remote,
    Decode,
    Cancelled,
    Config,
}

impl RpcError {
    /// Classify this error for callers that only need to branch on the kind.
    pub fn kind(&self) -> FailureKind {
        // ---
        match self {
            RpcError::Connection(_) | RpcError::Transport(_) => FailureKind::Connection,
            RpcError::NotConnected | RpcError::Publish(_) => FailureKind::Publish,
            RpcError::Timeout(_) => FailureKind::Timeout,
            RpcError::Remote(_) => FailureKind::Remote,
            RpcError::Decode(_) => FailureKind::Decode,
            RpcError::DuplicateCorrelationId(_) => FailureKind::Publish,
            RpcError::Cancelled => FailureKind::Cancelled,
            // A payload that cannot be encoded is the caller's input, not a
            // channel refusal.
            RpcError::Encode(_) | RpcError::Config(_) | RpcError::MissingConfig(_) => {
                FailureKind::Config
            }
        }
    }

    /// True when the call ended because nothing answered in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout(_))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        // ---
        RpcError::Decode(err.to_string())
    }
}

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, RpcError>;
