//! Secure key store.
//!
//! Raw key material (ephemeral private keys, root secrets, the wrapped vault
//! master key) lives behind a platform [`SecureBackend`]. The store adds:
//!
//! - typed addressing by ([`KeyOwner`], [`KeyKind`])
//! - device-only access control on every write
//! - per-owner serialization, so a teardown cannot interleave with a
//!   concurrent write for the same session
//! - idempotent, retried deletes
//!
//! Every read returns `Zeroizing<Vec<u8>>`: secret bytes are overwritten when
//! the caller drops them.

mod chaotic;
mod memory;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

pub use chaotic::ChaoticBackend;
pub use memory::MemoryBackend;
use zeroize::Zeroizing;

pub use crate::error::KeyStoreError;
use crate::session::SessionId;

/// Attempts made for each delete during teardown.
pub const DELETE_ATTEMPTS: usize = 3;

/// What a stored key is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyKind {
    /// X25519 private scalar for one connection attempt
    EphemeralPrivate,
    /// Root secret derived by the key exchange
    RootSecret,
    /// Vault master key wrapped by the biometric key wrapper
    WrappedMasterKey,
}

impl KeyKind {
    fn label(self) -> &'static str {
        match self {
            Self::EphemeralPrivate => "ephemeral",
            Self::RootSecret => "root",
            Self::WrappedMasterKey => "wrapped-master",
        }
    }
}

/// Who a stored key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyOwner {
    /// A single connection attempt
    Session(SessionId),
    /// The encrypted persistence engine
    Vault,
}

impl From<SessionId> for KeyOwner {
    fn from(id: SessionId) -> Self {
        Self::Session(id)
    }
}

/// Address of one key in the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyAccount {
    /// Owner of the key
    pub owner: KeyOwner,
    /// Kind of key
    pub kind: KeyKind,
}

impl fmt::Display for KeyAccount {
    /// Keychain-style account name, e.g. `vanish.session.<hex>.root`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            KeyOwner::Session(id) => write!(f, "vanish.session.{id}.{}", self.kind.label()),
            KeyOwner::Vault => write!(f, "vanish.vault.{}", self.kind.label()),
        }
    }
}

/// Access-control flags requested on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessControl {
    /// Key is bound to this device and never leaves it
    pub this_device_only: bool,
    /// Key may be synchronized to other devices or backups
    pub synchronizable: bool,
}

impl AccessControl {
    /// The only flags the key store ever uses.
    pub const DEVICE_ONLY: Self = Self { this_device_only: true, synchronizable: false };
}

/// Platform secure-storage primitive (keychain, keystore, TPM...).
///
/// Synchronous, like the vault storage trait. Implementations share state
/// internally so the store can be used from several tasks.
pub trait SecureBackend: Send + Sync + 'static {
    /// Write `bytes` under `account`, replacing any previous value.
    fn write(
        &self,
        account: KeyAccount,
        bytes: &[u8],
        access: AccessControl,
    ) -> Result<(), KeyStoreError>;

    /// Read the bytes under `account`. `None` if absent.
    fn read(&self, account: KeyAccount) -> Result<Option<Zeroizing<Vec<u8>>>, KeyStoreError>;

    /// Remove `account`.
    ///
    /// # Invariants
    ///
    /// - Removing an absent account succeeds
    fn remove(&self, account: KeyAccount) -> Result<(), KeyStoreError>;

    /// Every account currently stored. Order is not guaranteed.
    fn accounts(&self) -> Result<Vec<KeyAccount>, KeyStoreError>;
}

/// Typed key store over a [`SecureBackend`].
pub struct KeyStore<B: SecureBackend> {
    backend: B,
    owner_locks: Mutex<HashMap<KeyOwner, Arc<Mutex<()>>>>,
}

impl<B: SecureBackend> KeyStore<B> {
    /// Wrap a backend.
    pub fn new(backend: B) -> Self {
        Self { backend, owner_locks: Mutex::new(HashMap::new()) }
    }

    /// Underlying backend (for checking invariants in tests).
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn owner_lock(&self, owner: KeyOwner) -> Arc<Mutex<()>> {
        // Guards hold no data, so a poisoned lock carries no broken state.
        let mut locks = self.owner_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(owner).or_default())
    }

    /// Drop `owner`'s lock entry unless another caller still holds it.
    ///
    /// Clones are only handed out under the map lock, so the count cannot
    /// grow while it is being checked.
    fn release_owner(&self, owner: KeyOwner, lock: Arc<Mutex<()>>) {
        let mut locks = self.owner_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&owner);
        }
    }

    /// Store key material for `owner`.
    pub fn put(&self, bytes: &[u8], kind: KeyKind, owner: KeyOwner) -> Result<(), KeyStoreError> {
        let lock = self.owner_lock(owner);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let account = KeyAccount { owner, kind };
        self.backend.write(account, bytes, AccessControl::DEVICE_ONLY)?;

        tracing::debug!(%account, "Stored key material");
        Ok(())
    }

    /// Load key material. `None` if nothing is stored.
    pub fn get(
        &self,
        kind: KeyKind,
        owner: KeyOwner,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, KeyStoreError> {
        let lock = self.owner_lock(owner);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.backend.read(KeyAccount { owner, kind })
    }

    /// Remove one key. Idempotent, retried on backend failure.
    pub fn delete(&self, kind: KeyKind, owner: KeyOwner) -> Result<(), KeyStoreError> {
        let lock = self.owner_lock(owner);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.remove_with_retry(KeyAccount { owner, kind })
    }

    /// Wipe every key of a connection session. Idempotent.
    pub fn delete_all(&self, session_id: SessionId) -> Result<(), KeyStoreError> {
        let owner = KeyOwner::Session(session_id);
        let lock = self.owner_lock(owner);
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let wiped = [KeyKind::EphemeralPrivate, KeyKind::RootSecret]
            .into_iter()
            .try_for_each(|kind| self.remove_with_retry(KeyAccount { owner, kind }));
        drop(guard);
        self.release_owner(owner, lock);
        wiped?;

        tracing::debug!(session_id = %session_id, "Wiped session keys");
        Ok(())
    }

    /// Wipe every key this store owns, sessions and vault alike.
    pub fn delete_everything(&self) -> Result<(), KeyStoreError> {
        let accounts = self.backend.accounts()?;

        for account in accounts {
            let lock = self.owner_lock(account.owner);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.remove_with_retry(account)?;
        }

        self.owner_locks.lock().unwrap_or_else(PoisonError::into_inner).clear();
        tracing::info!("Wiped all key material");
        Ok(())
    }

    fn remove_with_retry(&self, account: KeyAccount) -> Result<(), KeyStoreError> {
        let mut attempt = 1;
        loop {
            match self.backend.remove(account) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < DELETE_ATTEMPTS => {
                    tracing::warn!(%account, attempt, error = %e, "Key delete failed, retrying");
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}
