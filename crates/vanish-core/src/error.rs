//! Error types for the Vanish session core.
//!
//! Strongly-typed errors for each state machine: the key store, the key
//! exchange session, and the retention negotiator. Classification methods
//! tell the session owner whether to tear the connection down or retry.

use std::time::Duration;

use thiserror::Error;
use vanish_crypto::CryptoError;
use vanish_proto::Lifetime;

use crate::{negotiation::NegotiationState, session::SessionState};

/// Errors raised by the secure key store and its backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyStoreError {
    /// Platform secure storage failed (locked keychain, I/O, ...)
    #[error("secure backend error: {0}")]
    Backend(String),

    /// Backend refused the requested access-control flags
    #[error("access control rejected for {account}")]
    AccessControl {
        /// Account the write targeted
        account: String,
    },
}

impl KeyStoreError {
    /// Returns true if the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Errors that can occur in the key exchange session state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not valid in the current state
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when the error occurred
        state: SessionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Local ephemeral private key not found in the key store
    #[error("private key missing for session {session_id}")]
    PrivateKeyMissing {
        /// Session whose key was expected
        session_id: String,
    },

    /// Key exchange did not complete within the configured timeout
    #[error("key exchange timeout after {elapsed:?}")]
    ExchangeTimeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// Session id string is not 32 hex characters
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// Signaling message addressed to another session
    #[error("signal for session {got}, expected {expected}")]
    SessionMismatch {
        /// This session's id
        expected: String,
        /// Id carried by the signal
        got: String,
    },

    /// Key agreement, ratchet, or AEAD failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Key store failure
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
}

impl SessionError {
    /// Returns true if the connection must be torn down.
    ///
    /// Protocol failures (bad peer key, missing private key, timeout) and
    /// integrity failures (forged, replayed or out-of-window messages) are
    /// fatal. A fresh exchange on a new connection is the only recovery.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Self::PrivateKeyMissing { .. } | Self::ExchangeTimeout { .. } => true,
            Self::Crypto(e) => e.is_session_fatal() || matches!(e, CryptoError::InvalidPeerKey { .. }),
            Self::InvalidState { .. }
            | Self::InvalidSessionId(_)
            | Self::SessionMismatch { .. }
            | Self::KeyStore(_) => false,
        }
    }

    /// Returns true if this is an integrity failure on a received message.
    ///
    /// The user is shown a generic "cannot verify this message" indicator for
    /// these, never the protocol detail.
    pub fn is_unverifiable(&self) -> bool {
        matches!(
            self,
            Self::Crypto(
                CryptoError::AuthenticationFailed
                    | CryptoError::ReplayDetected { .. }
                    | CryptoError::GapTooLarge { .. }
                    | CryptoError::UnsupportedVersion(_)
            )
        )
    }

    /// Returns true if the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyStore(e) if e.is_retryable())
    }
}

/// Errors from the retention negotiation state machine.
///
/// None of these alter negotiation state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Signal addressed to another session
    #[error("negotiation signal for session {got}, expected {expected}")]
    SessionMismatch {
        /// This negotiator's session id
        expected: String,
        /// Id carried by the signal
        got: String,
    },

    /// Local accept/reject with no remote proposal outstanding
    #[error("cannot {operation}: no remote proposal pending in {state:?}")]
    NothingPending {
        /// Operation that was attempted
        operation: &'static str,
        /// Current negotiation state
        state: NegotiationState,
    },

    /// Peer accepted a lifetime other than the one we proposed
    #[error("peer accepted {accepted} but {proposed} was proposed")]
    AcceptMismatch {
        /// Our outstanding proposal
        proposed: Lifetime,
        /// Lifetime echoed by the peer
        accepted: Lifetime,
    },

    /// Signal not valid in the current state
    #[error("unexpected {kind} in {state:?}")]
    UnexpectedSignal {
        /// Signal type
        kind: &'static str,
        /// Current negotiation state
        state: NegotiationState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_and_integrity_errors_are_fatal() {
        assert!(SessionError::PrivateKeyMissing { session_id: "ab".to_string() }.is_session_fatal());
        assert!(
            SessionError::ExchangeTimeout { elapsed: Duration::from_secs(11) }.is_session_fatal()
        );
        assert!(
            SessionError::Crypto(CryptoError::InvalidPeerKey { reason: "low-order curve point" })
                .is_session_fatal()
        );
        assert!(SessionError::Crypto(CryptoError::AuthenticationFailed).is_session_fatal());
    }

    #[test]
    fn state_errors_are_not_fatal() {
        assert!(
            !SessionError::InvalidState { state: SessionState::Init, operation: "encrypt" }
                .is_session_fatal()
        );
        assert!(!SessionError::InvalidSessionId("zz".to_string()).is_session_fatal());
    }

    #[test]
    fn only_integrity_errors_are_unverifiable() {
        assert!(
            SessionError::Crypto(CryptoError::ReplayDetected { counter: 1, last_seen: 1 })
                .is_unverifiable()
        );
        assert!(
            !SessionError::Crypto(CryptoError::InvalidPeerKey { reason: "length" })
                .is_unverifiable()
        );
        assert!(!SessionError::PrivateKeyMissing { session_id: "ab".to_string() }.is_unverifiable());
    }

    #[test]
    fn backend_failures_are_retryable() {
        let err = SessionError::KeyStore(KeyStoreError::Backend("locked".to_string()));
        assert!(err.is_retryable());
        assert!(!err.is_session_fatal());

        let denied = KeyStoreError::AccessControl { account: "x".to_string() };
        assert!(!denied.is_retryable());
    }
}
