//! Signaling messages exchanged over the rendezvous channel.
//!
//! Messages are JSON objects discriminated by a `type` field. Field names are
//! camelCase on the wire:
//!
//! ```text
//! {"type":"key_exchange","publicKey":"<base64>","sessionId":"<hex>"}
//! {"type":"lifetime_proposal","sessionId":"<hex>","duration":"one_day","proposedAt":100}
//! ```
//!
//! # Security
//!
//! The signaling server can read every message here. Nothing confidential is
//! carried: public keys are public, and retention proposals only reveal how
//! long the peers intend to keep ciphertext. The channel must however deliver
//! messages unmodified and in order.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, Result},
    lifetime::Lifetime,
};

/// Size of an X25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// A message on the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    /// Ephemeral public key for this connection attempt
    KeyExchange {
        /// Base64 of the 32-byte X25519 public key
        public_key: String,
        /// Connection session this key belongs to
        session_id: String,
    },

    /// Sender derived its root secret
    KeyExchangeComplete {
        /// Connection session that completed
        session_id: String,
    },

    /// Propose a retention lifetime for the room
    LifetimeProposal {
        /// Connection session carrying the proposal
        session_id: String,
        /// Proposed lifetime
        duration: Lifetime,
        /// Unix seconds at which the proposal was made
        proposed_at: u64,
    },

    /// Accept the peer's proposal
    LifetimeAccept {
        /// Connection session carrying the acceptance
        session_id: String,
        /// Lifetime being accepted, echoed for matching
        duration: Lifetime,
        /// Unix seconds at which the proposal was accepted
        accepted_at: u64,
    },

    /// Reject the peer's proposal
    LifetimeReject {
        /// Connection session carrying the rejection
        session_id: String,
        /// Optional human-readable reason
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl SignalMessage {
    /// Build a `key_exchange` message from raw public key bytes.
    pub fn key_exchange(session_id: impl Into<String>, public_key: &[u8; PUBLIC_KEY_SIZE]) -> Self {
        Self::KeyExchange { public_key: BASE64.encode(public_key), session_id: session_id.into() }
    }

    /// Session id every signaling message is scoped to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::KeyExchange { session_id, .. }
            | Self::KeyExchangeComplete { session_id }
            | Self::LifetimeProposal { session_id, .. }
            | Self::LifetimeAccept { session_id, .. }
            | Self::LifetimeReject { session_id, .. } => session_id,
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KeyExchange { .. } => "key_exchange",
            Self::KeyExchangeComplete { .. } => "key_exchange_complete",
            Self::LifetimeProposal { .. } => "lifetime_proposal",
            Self::LifetimeAccept { .. } => "lifetime_accept",
            Self::LifetimeReject { .. } => "lifetime_reject",
        }
    }

    /// Serialize to JSON.
    pub fn encode(&self) -> String {
        let Ok(json) = serde_json::to_string(self) else {
            unreachable!("signaling messages contain only strings, enums and integers");
        };
        json
    }

    /// Parse a JSON signaling message.
    ///
    /// # Errors
    ///
    /// - `MalformedSignal` for unknown types, missing fields, or unknown
    ///   lifetime values
    pub fn decode(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ProtocolError::MalformedSignal(e.to_string()))
    }
}

/// Decode the base64 public key carried by a `key_exchange` message.
///
/// Length is NOT validated here; the key exchange engine reports a wrong
/// length as an invalid peer key so the session fails through one path.
///
/// # Errors
///
/// - `InvalidBase64` if the field is not base64
pub fn decode_public_key(public_key: &str) -> Result<Vec<u8>> {
    BASE64.decode(public_key).map_err(|_| ProtocolError::InvalidBase64 { field: "publicKey" })
}
