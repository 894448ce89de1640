//! Zeroizing wrappers for 256-bit secrets.
//!
//! Every secret type here overwrites its bytes on drop and prints as
//! `[REDACTED]` in debug output. Distinct types keep a root secret from ever
//! being passed where a master key is expected.

use std::fmt;

use zeroize::Zeroize;

use crate::error::CryptoError;

/// Size of every symmetric key in the system.
pub const KEY_SIZE: usize = 32;

/// Raw key bytes, zeroized on drop.
struct KeyBytes([u8; KEY_SIZE]);

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

fn array_from_slice(bytes: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    <[u8; KEY_SIZE]>::try_from(bytes)
        .map_err(|_| CryptoError::InvalidKeyMaterial { expected: KEY_SIZE, actual: bytes.len() })
}

/// Per-connection root secret produced by the key exchange.
///
/// Every message key of the connection is derived from it. It is dropped
/// (and zeroized) when the connection is torn down.
pub struct RootSecret(KeyBytes);

impl RootSecret {
    /// Wrap raw bytes. The caller's copy should be zeroized.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(KeyBytes(bytes))
    }

    /// Restore from key store bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        array_from_slice(bytes).map(Self::from_bytes)
    }

    /// Borrow the secret bytes.
    pub fn expose(&self) -> &[u8; KEY_SIZE] {
        &self.0.0
    }
}

impl fmt::Debug for RootSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootSecret([REDACTED])")
    }
}

/// Storage master key derived from the user's passphrase.
pub struct MasterKey(KeyBytes);

impl MasterKey {
    /// Wrap raw bytes. The caller's copy should be zeroized.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(KeyBytes(bytes))
    }

    /// Restore from unwrapped key bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        array_from_slice(bytes).map(Self::from_bytes)
    }

    /// Borrow the secret bytes.
    pub fn expose(&self) -> &[u8; KEY_SIZE] {
        &self.0.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}
