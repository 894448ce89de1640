//! Vanish Cryptographic Primitives
//!
//! Cryptographic building blocks for the Vanish session core. Pure functions
//! with deterministic outputs: callers provide random bytes (keypair seeds,
//! nonces, salts) so every operation can be replayed in tests.
//!
//! # Key Lifecycle
//!
//! Two independent hierarchies exist. The connection hierarchy lives only as
//! long as one transport connection:
//!
//! ```text
//! Ephemeral X25519 keypair (per connection attempt)
//!        │ ECDH with peer public key
//!        ▼
//! HKDF("vanish/root/v1") → Root Secret
//!        │
//!        ▼
//! HKDF("vanish/message/v1" ‖ direction ‖ counter) → Message Key (single use)
//!        │
//!        ▼
//! ChaCha20-Poly1305 → WireMessage
//! ```
//!
//! The storage hierarchy outlives connections and is unrelated to any root
//! secret:
//!
//! ```text
//! Passphrase + persistent salt
//!        │ Argon2id
//!        ▼
//! HKDF("vanish/vault/v1") → Master Key → ChaCha20-Poly1305 per stored record
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Ephemeral keypairs are regenerated on every connection attempt
//! - Message keys are derived per (direction, counter) and zeroized on drop
//! - Disclosure of one message key reveals nothing about any other
//!
//! Direction Separation:
//! - A direction tag enters every message key derivation, so the two peers
//!   never encrypt under the same key even though they share one root secret
//!
//! Authenticity:
//! - ChaCha20-Poly1305 tag covers ciphertext, version and counter
//! - Failed tag -> `AuthenticationFailed`, never partial plaintext
//!
//! Replay Protection:
//! - [`ReplayWindow`] rejects counters at or below the last accepted value and
//!   jumps larger than the configured gap

#![forbid(unsafe_code)]

pub mod cipher;
mod error;
pub mod exchange;
pub mod kdf;
pub mod ratchet;
pub mod secret;

pub use cipher::{ReplayWindow, encrypt, open, open_detached, seal_detached};
pub use error::CryptoError;
pub use exchange::{EphemeralKeyPair, ROOT_CONTEXT, derive_root_secret};
pub use kdf::{KdfParams, SALT_SIZE, VAULT_CONTEXT, derive_master_key, key_check, verify_key_check};
pub use ratchet::{
    DEFAULT_MAX_GAP, Direction, MESSAGE_CONTEXT, MessageKey, MessageRatchet, Role,
    derive_message_key,
};
pub use secret::{KEY_SIZE, MasterKey, RootSecret};
