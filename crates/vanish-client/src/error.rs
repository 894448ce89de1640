//! Client error types.

use std::time::Duration;

use thiserror::Error;
use vanish_core::{NegotiationError, SessionError};
use vanish_proto::ProtocolError;
use vanish_vault::VaultError;

/// Errors surfaced by the peer session driver and its helpers.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Key exchange or message cipher failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Retention negotiation rejected a local call or a peer signal
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// Malformed signaling or wire message
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Vault failure during a sweep or save
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// Retention signal arrived before the peer's session id was known
    #[error("retention negotiation needs a completed key exchange")]
    NotEstablished,

    /// The exchange gate did not open in time
    #[error("transport gate still closed after {timeout:?}")]
    GateTimeout {
        /// How long the caller waited
        timeout: Duration,
    },

    /// The exchange failed or the session ended before the gate opened
    #[error("transport gate closed: {reason}")]
    GateClosed {
        /// Why the gate will never open
        reason: String,
    },

    /// The session task is gone
    #[error("peer session channel closed")]
    ChannelClosed,

    /// The blocking sweep task panicked or was cancelled
    #[error("sweep task failed: {0}")]
    SweepTask(String),
}

impl ClientError {
    /// Returns true if the connection must be torn down.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Self::Session(e) => e.is_session_fatal(),
            Self::GateTimeout { .. } | Self::GateClosed { .. } | Self::ChannelClosed => true,
            Self::Negotiation(_)
            | Self::Protocol(_)
            | Self::Vault(_)
            | Self::NotEstablished
            | Self::SweepTask(_) => false,
        }
    }
}
