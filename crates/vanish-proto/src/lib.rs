//! Vanish Protocol Formats
//!
//! Everything that crosses a process boundary: JSON signaling messages
//! exchanged over the rendezvous channel, the binary wire message carried over
//! the peer-to-peer data transport, and the enumerated retention lifetimes both
//! peers negotiate.
//!
//! # Channels
//!
//! ```text
//! Signaling (ordered, integrity-protected, NOT confidential)
//!   key_exchange / key_exchange_complete
//!   lifetime_proposal / lifetime_accept / lifetime_reject
//!
//! Data transport (peer-to-peer)
//!   WireMessage {v, c, n, d, t}
//! ```
//!
//! The signaling channel only needs integrity and ordering: public keys and
//! retention proposals are not secret. Everything confidential travels as a
//! [`WireMessage`] sealed under a per-message key.
//!
//! This crate is pure data. It performs no cryptography and never inspects
//! ciphertext; length validation happens here so the crypto layer only ever
//! sees well-formed fixed-size fields.

#![forbid(unsafe_code)]

pub mod errors;
pub mod lifetime;
pub mod signal;
pub mod wire;

pub use errors::{ProtocolError, Result};
pub use lifetime::Lifetime;
pub use signal::SignalMessage;
pub use wire::{MAX_WIRE_SIZE, NONCE_SIZE, TAG_SIZE, WIRE_VERSION, WireMessage};
