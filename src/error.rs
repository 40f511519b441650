//! Relay error taxonomy.
//!
//! Every failure a client can observe maps to a stable `code()` string that
//! rides in the `error {code, message}` wire event. Validation errors are
//! rejected synchronously and never partially applied; call-signaling races
//! terminate only the affected call attempt.

use thiserror::Error;

use crate::protocol::{DeliveryStatus, ServerMessage};

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    /// Malformed send request (e.g. neither text nor media present).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Illegal backward move on the delivery-status lattice.
    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    /// The message store is unavailable or the write failed. The affected
    /// message is absent, not partially written; the client decides whether
    /// to retry.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Call offer addressed to an identity with no live connection.
    #[error("callee '{0}' is not connected")]
    CalleeUnreachable(String),

    /// The other party's connection dropped during a call.
    #[error("peer disconnected during call '{0}'")]
    PeerDisconnected(String),

    /// A signaling event arrived for a call that is no longer in a state to
    /// accept it (duplicate answer, answer after hangup, wrong party).
    #[error("stale signal for call '{0}'")]
    StaleSignal(String),

    /// A second offer while a call between the same pair is still pending.
    #[error("a call between '{0}' and '{1}' is already in progress")]
    CallAlreadyInProgress(String, String),
}

impl RelayError {
    /// Stable taxonomy code carried on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidMessage(_) => "InvalidMessage",
            RelayError::InvalidStateTransition { .. } => "InvalidStateTransition",
            RelayError::Persistence(_) => "PersistenceError",
            RelayError::CalleeUnreachable(_) => "CalleeUnreachable",
            RelayError::PeerDisconnected(_) => "PeerDisconnected",
            RelayError::StaleSignal(_) => "StaleSignal",
            RelayError::CallAlreadyInProgress(_, _) => "CallAlreadyInProgress",
        }
    }

    /// The wire event reported to the originating client.
    pub fn to_event(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        RelayError::Persistence(err.to_string())
    }
}
