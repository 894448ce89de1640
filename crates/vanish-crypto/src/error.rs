//! Cryptographic error types.

use thiserror::Error;

/// Errors that can occur during key agreement, ratcheting, or AEAD.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Peer public key has the wrong length or is not a usable curve point
    #[error("invalid peer key: {reason}")]
    InvalidPeerKey {
        /// Why the key was rejected
        reason: &'static str,
    },

    /// Stored key material has the wrong length
    #[error("invalid key material: expected {expected} bytes, got {actual}")]
    InvalidKeyMaterial {
        /// Required length
        expected: usize,
        /// Length found
        actual: usize,
    },

    /// AEAD tag did not verify (tampering, wrong key, or wrong direction)
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Counter at or below the last accepted counter for this direction
    #[error("replay detected: counter {counter} <= last seen {last_seen}")]
    ReplayDetected {
        /// Counter carried by the message
        counter: u64,
        /// Highest counter previously accepted
        last_seen: u64,
    },

    /// Counter jumped further ahead than the receive window allows
    #[error("counter gap too large: {counter} - {last_seen} >= {max_gap}")]
    GapTooLarge {
        /// Counter carried by the message
        counter: u64,
        /// Highest counter previously accepted
        last_seen: u64,
        /// Configured maximum gap
        max_gap: u64,
    },

    /// Wire version not supported by this build
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    /// Send counter reached `u64::MAX`
    #[error("send counter exhausted")]
    CounterExhausted,

    /// Passphrase key derivation failed
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

impl CryptoError {
    /// Returns true if the connection carrying this message must be torn
    /// down.
    ///
    /// Integrity failures are never collapsed into "message lost": a peer or
    /// relay that sends forged, replayed, or wildly out-of-window messages is
    /// broken or hostile.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::ReplayDetected { .. }
                | Self::GapTooLarge { .. }
                | Self::UnsupportedVersion(_)
                | Self::CounterExhausted
        )
    }
}
