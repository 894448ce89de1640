//! Unlock handle.

use std::fmt;

use vanish_crypto::MasterKey;

/// Proof that the vault was unlocked: the master key of one generation.
///
/// Not `Clone`: there is exactly one in-memory copy of the master key per
/// unlock, and [`UnlockHandle::lock`] destroys it. The key is zeroized on
/// drop either way.
pub struct UnlockHandle {
    master: Option<MasterKey>,
    generation: u32,
}

impl UnlockHandle {
    pub(crate) fn new(master: MasterKey, generation: u32) -> Self {
        Self { master: Some(master), generation }
    }

    /// Key generation the handle was unlocked at.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether the master key is still held.
    pub fn is_unlocked(&self) -> bool {
        self.master.is_some()
    }

    /// Clear the master key. Idempotent.
    pub fn lock(&mut self) {
        if self.master.take().is_some() {
            tracing::debug!(generation = self.generation, "Vault locked");
        }
    }

    pub(crate) fn master(&self) -> Option<&MasterKey> {
        self.master.as_ref()
    }
}

impl fmt::Debug for UnlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockHandle")
            .field("generation", &self.generation)
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}
