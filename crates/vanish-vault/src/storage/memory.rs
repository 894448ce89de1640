use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use super::{Storage, StorageError};
use crate::record::{RoomPolicyRecord, StoredMessage, VaultMeta, decode_generation, encode_record_key};

/// In-memory storage implementation for testing
///
/// Records live in a `BTreeMap` keyed by the same encoded key the durable
/// backend uses, so range behavior matches. All state is wrapped in
/// Arc<Mutex<>> to allow Clone and concurrent access. Uses `lock().expect()`,
/// which panics if the mutex is poisoned; acceptable for test code.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    meta: Option<VaultMeta>,
    messages: BTreeMap<Vec<u8>, StoredMessage>,
    rooms: HashMap<String, RoomPolicyRecord>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of message records across all generations.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn message_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").messages.len()
    }
}

impl Storage for MemoryStorage {
    #[allow(clippy::expect_used)]
    fn load_meta(&self) -> Result<Option<VaultMeta>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").meta.clone())
    }

    #[allow(clippy::expect_used)]
    fn store_meta(&self, meta: &VaultMeta) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").meta = Some(meta.clone());
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn put_message(&self, message: &StoredMessage) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.messages.insert(message.key(), message.clone());
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn load_message(
        &self,
        generation: u32,
        room_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredMessage>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        let key = encode_record_key(generation, room_id, message_id);
        Ok(inner.messages.get(&key).cloned())
    }

    #[allow(clippy::expect_used)]
    fn load_room(&self, generation: u32, room_id: &str) -> Result<Vec<StoredMessage>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner
            .messages
            .values()
            .filter(|m| m.key_generation == generation && m.room_id == room_id)
            .cloned()
            .collect())
    }

    #[allow(clippy::expect_used)]
    fn load_generation(&self, generation: u32) -> Result<Vec<StoredMessage>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.messages.values().filter(|m| m.key_generation == generation).cloned().collect())
    }

    #[allow(clippy::expect_used)]
    fn delete_message(
        &self,
        generation: u32,
        room_id: &str,
        message_id: &str,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        let key = encode_record_key(generation, room_id, message_id);
        Ok(inner.messages.remove(&key).is_some())
    }

    #[allow(clippy::expect_used)]
    fn delete_generation(&self, generation: u32) -> Result<usize, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        let before = inner.messages.len();
        inner.messages.retain(|_, m| m.key_generation != generation);
        Ok(before - inner.messages.len())
    }

    #[allow(clippy::expect_used)]
    fn generations(&self) -> Result<Vec<u32>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        let mut generations: Vec<u32> =
            inner.messages.keys().filter_map(|key| decode_generation(key)).collect();
        generations.dedup();
        Ok(generations)
    }

    #[allow(clippy::expect_used)]
    fn store_room_policy(&self, record: &RoomPolicyRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.rooms.insert(record.room_id.clone(), record.clone());
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn load_room_policy(&self, room_id: &str) -> Result<Option<RoomPolicyRecord>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").rooms.get(room_id).cloned())
    }
}
