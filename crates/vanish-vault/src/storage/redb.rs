//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Every
//! trait method is one transaction, so the metadata switch during passphrase
//! rotation is atomic.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};

use super::{Storage, StorageError};
use crate::record::{
    RoomPolicyRecord, StoredMessage, VaultMeta, decode_generation, encode_record_key,
    encode_room_prefix,
};

/// Table: meta
/// Key: [`META_KEY`]
/// Value: CBOR-encoded VaultMeta
const META: TableDefinition<&[u8], &[u8]> = TableDefinition::new("meta");

/// Table: messages
/// Key: encoded record key (generation, room_id, message_id)
/// Value: JSON-encoded StoredMessage
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

/// Table: room_policies
/// Key: room_id bytes
/// Value: JSON-encoded RoomPolicyRecord
const ROOM_POLICIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("room_policies");

const META_KEY: &[u8] = b"vault";

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (META, MESSAGES, ROOM_POLICIES).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(META).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(ROOM_POLICIES).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Decode every record whose key starts with `prefix`.
    fn scan_prefix<T: ReadableTable<&'static [u8], &'static [u8]>>(
        table: &T,
        prefix: &[u8],
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let results = table.range(prefix..).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut messages = Vec::new();
        for result in results {
            let (key, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            if !key.value().starts_with(prefix) {
                break;
            }

            let message = StoredMessage::from_json(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            messages.push(message);
        }

        Ok(messages)
    }
}

impl Storage for RedbStorage {
    fn load_meta(&self) -> Result<Option<VaultMeta>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(META).map_err(|e| StorageError::Io(e.to_string()))?;

        match table.get(META_KEY).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => {
                let meta: VaultMeta = ciborium::from_reader(value.value())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(meta))
            },
            None => Ok(None),
        }
    }

    fn store_meta(&self, meta: &VaultMeta) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table = txn.open_table(META).map_err(|e| StorageError::Io(e.to_string()))?;

            let mut bytes = Vec::new();
            ciborium::into_writer(meta, &mut bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            table.insert(META_KEY, bytes.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn put_message(&self, message: &StoredMessage) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

            let bytes =
                message.to_json().map_err(|e| StorageError::Serialization(e.to_string()))?;

            let key = message.key();
            table
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn load_message(
        &self,
        generation: u32,
        room_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredMessage>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

        let key = encode_record_key(generation, room_id, message_id);

        match table.get(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => {
                let message = StoredMessage::from_json(value.value())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(message))
            },
            None => Ok(None),
        }
    }

    fn load_room(&self, generation: u32, room_id: &str) -> Result<Vec<StoredMessage>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

        Self::scan_prefix(&table, &encode_room_prefix(generation, room_id))
    }

    fn load_generation(&self, generation: u32) -> Result<Vec<StoredMessage>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

        Self::scan_prefix(&table, &generation.to_be_bytes())
    }

    fn delete_message(
        &self,
        generation: u32,
        room_id: &str,
        message_id: &str,
    ) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        let existed = {
            let mut table = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

            let key = encode_record_key(generation, room_id, message_id);
            table.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?.is_some()
        };

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(existed)
    }

    fn delete_generation(&self, generation: u32) -> Result<usize, StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        let deleted = {
            let mut table = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

            let prefix = generation.to_be_bytes();
            let mut keys = Vec::new();
            for result in
                table.range(prefix.as_slice()..).map_err(|e| StorageError::Io(e.to_string()))?
            {
                let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                keys.push(key.value().to_vec());
            }

            for key in &keys {
                table.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
            }

            keys.len()
        };

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(deleted)
    }

    fn generations(&self) -> Result<Vec<u32>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

        // One seek per generation: jump past each generation's prefix
        let mut generations = Vec::new();
        let mut next = Some(0u32);
        while let Some(start) = next {
            let start_key = start.to_be_bytes();
            let mut range =
                table.range(start_key.as_slice()..).map_err(|e| StorageError::Io(e.to_string()))?;

            let Some(result) = range.next() else {
                break;
            };
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let generation = decode_generation(key.value())
                .ok_or_else(|| StorageError::Serialization("record key too short".to_string()))?;

            generations.push(generation);
            next = generation.checked_add(1);
        }

        Ok(generations)
    }

    fn store_room_policy(&self, record: &RoomPolicyRecord) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table =
                txn.open_table(ROOM_POLICIES).map_err(|e| StorageError::Io(e.to_string()))?;

            let bytes =
                serde_json::to_vec(record).map_err(|e| StorageError::Serialization(e.to_string()))?;

            table
                .insert(record.room_id.as_bytes(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn load_room_policy(&self, room_id: &str) -> Result<Option<RoomPolicyRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(ROOM_POLICIES).map_err(|e| StorageError::Io(e.to_string()))?;

        match table.get(room_id.as_bytes()).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => {
                let record: RoomPolicyRecord = serde_json::from_slice(value.value())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(record))
            },
            None => Ok(None),
        }
    }
}
