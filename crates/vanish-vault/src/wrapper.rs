//! Biometric key wrapping.
//!
//! The platform's biometric primitive is a [`KeyWrapper`]: it seals the master
//! key under a hardware-bound key and only releases it after a successful
//! assertion. [`SoftwareKeyWrapper`] is the fallback for platforms without
//! such hardware, and for tests.

use vanish_core::env::Environment;
use vanish_crypto::{KEY_SIZE, MasterKey, open_detached, seal_detached};
use vanish_proto::{NONCE_SIZE, TAG_SIZE};
use zeroize::Zeroizing;

use crate::error::VaultError;

/// Associated data for wrapped master keys.
const WRAP_CONTEXT: &[u8] = b"vanish/vault/wrap/v1";

/// Capability to wrap and unwrap the vault master key.
pub trait KeyWrapper: Send + Sync {
    /// Seal `key` into an opaque blob.
    fn wrap_key(&self, key: &MasterKey) -> Result<Vec<u8>, VaultError>;

    /// Recover the key from a blob produced by [`KeyWrapper::wrap_key`].
    ///
    /// On real hardware this is where the biometric assertion happens.
    fn unwrap_key(&self, blob: &[u8]) -> Result<MasterKey, VaultError>;
}

/// Software-only wrapper: ChaCha20-Poly1305 under a device key.
///
/// Blob layout: `[nonce: 12][tag: 16][ciphertext: 32]`.
pub struct SoftwareKeyWrapper<E: Environment> {
    device_key: Zeroizing<[u8; KEY_SIZE]>,
    env: E,
}

impl<E: Environment> SoftwareKeyWrapper<E> {
    /// Wrap under `device_key`. Nonces come from `env`.
    pub fn new(device_key: [u8; KEY_SIZE], env: E) -> Self {
        Self { device_key: Zeroizing::new(device_key), env }
    }
}

impl<E: Environment> KeyWrapper for SoftwareKeyWrapper<E> {
    fn wrap_key(&self, key: &MasterKey) -> Result<Vec<u8>, VaultError> {
        let nonce: [u8; NONCE_SIZE] = self.env.random_array();
        let (ciphertext, tag) = seal_detached(&self.device_key, &nonce, WRAP_CONTEXT, key.expose());

        let mut blob = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&tag);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn unwrap_key(&self, blob: &[u8]) -> Result<MasterKey, VaultError> {
        if blob.len() != NONCE_SIZE + TAG_SIZE + KEY_SIZE {
            return Err(VaultError::KeyWrap(format!("wrapped key has {} bytes", blob.len())));
        }

        let (nonce, rest) = blob.split_at(NONCE_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);
        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(tag);

        let plaintext = Zeroizing::new(
            open_detached(&self.device_key, &nonce_bytes, WRAP_CONTEXT, ciphertext, &tag_bytes)
                .map_err(|_| VaultError::KeyWrap("wrapped key rejected".to_string()))?,
        );

        Ok(MasterKey::from_slice(&plaintext)?)
    }
}
