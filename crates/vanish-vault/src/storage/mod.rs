//! Storage abstraction for the vault.
//!
//! Trait-based abstraction for persisting encrypted message records, the
//! vault metadata record and per-room config records. The trait is
//! synchronous (no async) and knows nothing about keys: it stores ciphertext
//! and plaintext metadata only.

mod chaotic;
mod memory;
mod redb;

pub use chaotic::{ChaoticStorage, StorageOp};
pub use memory::MemoryStorage;

pub use self::redb::RedbStorage;
use crate::{
    error::StorageError,
    record::{RoomPolicyRecord, StoredMessage, VaultMeta},
};

/// Storage abstraction for vault records
///
/// Must be Clone (shared between the vault and the sweeper), Send + Sync
/// (thread-safe), and synchronous (no async methods). Implementations share
/// internal state via Arc, so clones access the same underlying storage.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Load the vault metadata record. `None` before setup.
    fn load_meta(&self) -> Result<Option<VaultMeta>, StorageError>;

    /// Replace the vault metadata record.
    ///
    /// # Invariants
    ///
    /// - Atomic: after a crash either the old or the new record is visible
    fn store_meta(&self, meta: &VaultMeta) -> Result<(), StorageError>;

    /// Insert or replace a message record, keyed by
    /// (`key_generation`, `room_id`, `id`).
    fn put_message(&self, message: &StoredMessage) -> Result<(), StorageError>;

    /// Load one message record.
    fn load_message(
        &self,
        generation: u32,
        room_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredMessage>, StorageError>;

    /// Every record of a room in one generation. Order is not guaranteed.
    fn load_room(&self, generation: u32, room_id: &str) -> Result<Vec<StoredMessage>, StorageError>;

    /// Every record of one generation. Order is not guaranteed.
    fn load_generation(&self, generation: u32) -> Result<Vec<StoredMessage>, StorageError>;

    /// Delete one record. Returns whether it existed.
    fn delete_message(
        &self,
        generation: u32,
        room_id: &str,
        message_id: &str,
    ) -> Result<bool, StorageError>;

    /// Delete every record of one generation. Returns how many were deleted.
    fn delete_generation(&self, generation: u32) -> Result<usize, StorageError>;

    /// Distinct generations that still hold records, ascending.
    fn generations(&self) -> Result<Vec<u32>, StorageError>;

    /// Insert or replace a room config record.
    fn store_room_policy(&self, record: &RoomPolicyRecord) -> Result<(), StorageError>;

    /// Load a room config record.
    fn load_room_policy(&self, room_id: &str) -> Result<Option<RoomPolicyRecord>, StorageError>;
}
