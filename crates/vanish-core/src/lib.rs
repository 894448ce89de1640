//! Vanish Session Core
//!
//! Sans-IO state machines for one peer-to-peer conversation: the key exchange
//! that produces a per-connection root secret, the secure key store that holds
//! secrets at rest, and the retention negotiation that decides whether (and
//! for how long) messages may be persisted.
//!
//! # Architecture
//!
//! Every state machine takes time and collaborators as arguments and returns
//! [`SessionAction`]s for the caller to execute. Nothing here touches the
//! network, the clock, or the OS RNG directly; [`env::Environment`] supplies
//! time and randomness so tests replay deterministically.
//!
//! # Components
//!
//! - [`ConnectionSession`]: ephemeral X25519 exchange and message ratchet
//! - [`KeyStore`]: typed, device-only secret storage over a [`SecureBackend`]
//! - [`RetentionNegotiator`]: two-party agreement on a [`Lifetime`]
//!
//! # Lifecycle
//!
//! ```text
//! connect ──> ConnectionSession::begin_exchange ──> Established
//!                                                       │
//!              RetentionNegotiator::propose/accept <────┘
//!                                                       │
//! disconnect ──> teardown (keys wiped) + negotiator reset
//! ```

#![forbid(unsafe_code)]

pub mod env;
pub mod error;
pub mod event;
pub mod keystore;
pub mod negotiation;
pub mod session;

pub use error::{KeyStoreError, NegotiationError, SessionError};
pub use event::{SessionAction, SessionEvent};
pub use keystore::{KeyKind, KeyOwner, KeyStore, MemoryBackend, SecureBackend};
pub use negotiation::{NegotiationState, RetentionNegotiator, RetentionPolicy};
pub use session::{ConnectionSession, SessionConfig, SessionId, SessionState};
pub use vanish_proto::Lifetime;
