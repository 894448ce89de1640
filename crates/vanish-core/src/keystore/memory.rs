//! In-memory secure backend.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use zeroize::Zeroizing;

use super::{AccessControl, KeyAccount, KeyStoreError, SecureBackend};

/// In-memory backend for tests and platforms without hardware key storage.
///
/// Values are held in `Zeroizing` buffers, so removing or overwriting an
/// entry wipes the old bytes. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<HashMap<KeyAccount, StoredKey>>>,
}

struct StoredKey {
    bytes: Zeroizing<Vec<u8>>,
    access: AccessControl,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").len()
    }

    /// Whether the backend holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Access-control flags recorded for `account`.
    #[allow(clippy::expect_used)]
    pub fn access_of(&self, account: KeyAccount) -> Option<AccessControl> {
        self.inner.lock().expect("Mutex poisoned").get(&account).map(|key| key.access)
    }
}

impl SecureBackend for MemoryBackend {
    #[allow(clippy::expect_used)]
    fn write(
        &self,
        account: KeyAccount,
        bytes: &[u8],
        access: AccessControl,
    ) -> Result<(), KeyStoreError> {
        if access.synchronizable {
            return Err(KeyStoreError::AccessControl { account: account.to_string() });
        }

        let key = StoredKey { bytes: Zeroizing::new(bytes.to_vec()), access };
        self.inner.lock().expect("Mutex poisoned").insert(account, key);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn read(&self, account: KeyAccount) -> Result<Option<Zeroizing<Vec<u8>>>, KeyStoreError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.get(&account).map(|key| Zeroizing::new(key.bytes.to_vec())))
    }

    #[allow(clippy::expect_used)]
    fn remove(&self, account: KeyAccount) -> Result<(), KeyStoreError> {
        self.inner.lock().expect("Mutex poisoned").remove(&account);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn accounts(&self) -> Result<Vec<KeyAccount>, KeyStoreError> {
        Ok(self.inner.lock().expect("Mutex poisoned").keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{KeyKind, KeyOwner};

    const VAULT_KEY: KeyAccount =
        KeyAccount { owner: KeyOwner::Vault, kind: KeyKind::WrappedMasterKey };

    #[test]
    fn synchronizable_writes_are_refused() {
        let backend = MemoryBackend::new();
        let access = AccessControl { this_device_only: false, synchronizable: true };

        let result = backend.write(VAULT_KEY, b"key", access);

        assert!(matches!(result, Err(KeyStoreError::AccessControl { .. })));
        assert!(backend.is_empty());
    }

    #[test]
    fn overwrite_replaces_value() {
        let backend = MemoryBackend::new();
        backend.write(VAULT_KEY, b"first", AccessControl::DEVICE_ONLY).unwrap();
        backend.write(VAULT_KEY, b"second", AccessControl::DEVICE_ONLY).unwrap();

        assert_eq!(backend.read(VAULT_KEY).unwrap().unwrap().as_slice(), b"second");
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn clones_share_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();

        backend.write(VAULT_KEY, b"shared", AccessControl::DEVICE_ONLY).unwrap();

        assert!(clone.read(VAULT_KEY).unwrap().is_some());
    }
}
