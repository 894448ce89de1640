//! Session events and actions.

use vanish_crypto::Role;
use vanish_proto::{Lifetime, SignalMessage};

use crate::{negotiation::RetentionPolicy, session::SessionId};

/// Typed notifications for the session owner and the UI layer.
///
/// Integrity failures surface only as [`SessionEvent::MessageUnverifiable`],
/// never with protocol detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Root secret derived; the transport gate may open.
    ExchangeCompleted {
        /// Session that completed
        session_id: SessionId,
        /// Role decided by public key ordering
        role: Role,
    },

    /// Key exchange failed; the session is unusable.
    ExchangeFailed {
        /// Session that failed
        session_id: SessionId,
        /// Human-readable reason
        reason: String,
    },

    /// The peer proposed a retention lifetime and awaits our answer.
    PolicyProposed {
        /// Proposed lifetime
        lifetime: Lifetime,
        /// Unix seconds of the proposal
        proposed_at: u64,
    },

    /// Both peers agreed on a retention policy.
    PolicyAgreed(RetentionPolicy),

    /// A proposal was rejected (by either side).
    PolicyRejected {
        /// Reason given by the rejecting side
        reason: Option<String>,
        /// True if the peer rejected our proposal
        by_peer: bool,
    },

    /// A received message failed authentication, replay or gap checks.
    MessageUnverifiable {
        /// Session that received it
        session_id: SessionId,
    },

    /// Session keys were wiped and the transport must close.
    SessionTornDown {
        /// Session that ended
        session_id: SessionId,
        /// Why it ended
        reason: String,
    },
}

/// Actions returned by the session state machines.
///
/// The driver executes these:
/// - `SendSignal`: encode and send over the signaling channel
/// - `Emit`: hand the event to the session owner
/// - `Close`: close the data transport with the given reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Send this message over signaling
    SendSignal(SignalMessage),

    /// Deliver this event to the session owner
    Emit(SessionEvent),

    /// Close the transport
    Close {
        /// Reason for closing
        reason: String,
    },
}
