//! Vault and storage error types.

use thiserror::Error;
use vanish_core::KeyStoreError;
use vanish_crypto::CryptoError;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors returned by [`crate::Vault`].
#[derive(Error, Debug)]
pub enum VaultError {
    /// `setup` has not been run on this storage
    #[error("vault is not set up")]
    NotInitialized,

    /// `setup` called on storage that already holds a vault
    #[error("vault is already set up")]
    AlreadyInitialized,

    /// Derived key does not match the stored key check
    #[error("wrong passphrase")]
    WrongPassphrase,

    /// Operation needs an unlocked handle
    #[error("vault is locked")]
    Locked,

    /// Handle was issued for a key generation that has since been rotated
    #[error("handle for key generation {handle}, active generation is {active}")]
    StaleHandle {
        /// Generation the handle was unlocked at
        handle: u32,
        /// Generation currently active
        active: u32,
    },

    /// No wrapped master key in the key store
    #[error("biometric unlock is not enabled")]
    BiometricNotEnabled,

    /// Wrapped master key no longer matches the active generation
    #[error("biometric key is out of date; re-enable biometric unlock")]
    BiometricStale,

    /// Platform key wrapper failed
    #[error("key wrapper error: {0}")]
    KeyWrap(String),

    /// A stored record did not authenticate under the master key
    #[error("stored message {id} in room {room_id} failed to decrypt")]
    Corrupt {
        /// Room of the record
        room_id: String,
        /// Message id of the record
        id: String,
    },

    /// No key generations left
    #[error("key generation counter exhausted")]
    GenerationExhausted,

    /// Key derivation or AEAD failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Secure key store failure
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// Storage backend failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl VaultError {
    /// Returns true if the operation may succeed on retry.
    ///
    /// The UI shows these as an actionable retry prompt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(StorageError::Io(_)) => true,
            Self::KeyStore(e) => e.is_retryable(),
            _ => false,
        }
    }
}
