//! Vanish Encrypted Persistence
//!
//! At-rest storage for messages both peers agreed to keep. Every record is
//! sealed with ChaCha20-Poly1305 under a master key derived from the user's
//! passphrase (Argon2id + HKDF), independent of any connection's root secret.
//!
//! # Components
//!
//! - [`Vault`]: setup, unlock, save, load, sweep and passphrase rotation
//! - [`UnlockHandle`]: the in-memory master key; `lock()` clears it
//! - [`Storage`]: synchronous backend trait with [`RedbStorage`] (durable),
//!   [`MemoryStorage`] (tests) and [`ChaoticStorage`] (fault injection)
//! - [`KeyWrapper`]: biometric unlock capability, with [`SoftwareKeyWrapper`]
//!   as the fallback
//!
//! # Invariants
//!
//! - Nothing is written unless the room's policy is agreed by both peers and
//!   is not do-not-persist
//! - A record's `expires_at` is set once and never changes, including across
//!   rotation
//! - Loads never return a record past its `expires_at`
//! - At every instant, the active generation's records decrypt under the
//!   active key

#![forbid(unsafe_code)]

mod error;
mod handle;
pub mod record;
pub mod storage;
mod vault;
mod wrapper;

pub use error::{StorageError, VaultError};
pub use handle::UnlockHandle;
pub use record::{RoomPolicyRecord, StoredMessage};
pub use storage::{ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageOp};
pub use vault::{Message, SaveOutcome, SkipReason, SweepReport, Vault, VaultConfig};
pub use wrapper::{KeyWrapper, SoftwareKeyWrapper};
