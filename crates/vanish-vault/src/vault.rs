//! Encrypted persistence engine.
//!
//! # Key generations
//!
//! Every master key has a generation number. Records are keyed by the
//! generation they are sealed under, and the metadata record names the one
//! active generation:
//!
//! ```text
//! setup ──> gen 0 active
//! rotate: write gen N+1 ──> switch meta to N+1 ──> delete gen N
//!         crash here: N wins   crash here: N+1 wins, N purged on next unlock
//! ```
//!
//! Records are never rewritten in place, so at every instant each record is
//! decryptable under the key the metadata points to.
//!
//! # Expiry
//!
//! `expires_at` is fixed when a record is first saved and survives rotation
//! unchanged. Loads filter expired records even if no sweep ran; the sweep
//! deletes by each record's own deadline, never by the current policy.

use std::sync::{PoisonError, RwLock};

use vanish_core::{KeyKind, KeyOwner, KeyStore, RetentionPolicy, SecureBackend, env::Environment};
use vanish_crypto::{
    KdfParams, MasterKey, SALT_SIZE, derive_master_key, key_check, open_detached, seal_detached,
    verify_key_check,
};
use vanish_proto::NONCE_SIZE;
use zeroize::Zeroizing;

use crate::{
    error::VaultError,
    handle::UnlockHandle,
    record::{KeyEpoch, META_FORMAT, RoomPolicyRecord, StoredMessage, VaultMeta, record_aad},
    storage::Storage,
    wrapper::KeyWrapper,
};

/// Vault configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct VaultConfig {
    /// Argon2id cost for new key generations. Existing generations keep the
    /// cost they were created with.
    pub kdf: KdfParams,
}

/// A plaintext message going into or coming out of the vault.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message id, unique within the room
    pub id: String,
    /// Plaintext body
    pub content: Vec<u8>,
    /// Send time, unix seconds
    pub timestamp: f64,
    /// Sent by this device
    pub is_from_self: bool,
    /// Deletion deadline. Ignored on save; set from the policy.
    pub expires_at: Option<f64>,
}

/// Why a save wrote nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The handle was locked
    Locked,
    /// The policy was not confirmed by both peers
    NotAgreed,
    /// The agreed lifetime is do-not-persist
    DoNotPersist,
}

/// Result of [`Vault::save_message`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SaveOutcome {
    /// Record written
    Stored {
        /// Deadline fixed for this record
        expires_at: f64,
    },
    /// A record with this id already exists; its expiry is unchanged
    AlreadyStored {
        /// The record's original deadline
        expires_at: Option<f64>,
    },
    /// Nothing written
    Skipped(SkipReason),
}

/// Result of [`Vault::sweep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepReport {
    /// Expired records were deleted
    Swept {
        /// Records deleted
        deleted: usize,
        /// Records left
        remaining: usize,
    },
    /// Vault locked; expired records stay until the next unlocked sweep
    Deferred,
}

/// Encrypted message store over a [`Storage`] backend.
///
/// Rotation takes the writer lock; every other operation takes a reader
/// lock, so saves and loads never observe a half-switched generation.
pub struct Vault<S: Storage, E: Environment> {
    storage: S,
    env: E,
    config: VaultConfig,
    rotation: RwLock<()>,
}

impl<S: Storage, E: Environment> Vault<S, E> {
    /// Wrap a storage backend.
    pub fn new(storage: S, env: E, config: VaultConfig) -> Self {
        Self { storage, env, config, rotation: RwLock::new(()) }
    }

    /// Underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Whether `setup` has run on this storage.
    pub fn is_initialized(&self) -> Result<bool, VaultError> {
        Ok(self.storage.load_meta()?.is_some())
    }

    fn active_epoch(&self) -> Result<KeyEpoch, VaultError> {
        self.storage.load_meta()?.map(|meta| meta.active).ok_or(VaultError::NotInitialized)
    }

    fn new_epoch(
        &self,
        passphrase: &str,
        generation: u32,
    ) -> Result<(KeyEpoch, MasterKey), VaultError> {
        let salt: [u8; SALT_SIZE] = self.env.random_array();
        let params = self.config.kdf;
        let master = derive_master_key(passphrase.as_bytes(), &salt, &params)?;

        let epoch = KeyEpoch {
            generation,
            salt,
            key_check: key_check(&master),
            memory_kib: params.memory_kib,
            iterations: params.iterations,
            parallelism: params.parallelism,
        };
        Ok((epoch, master))
    }

    fn derive_for(epoch: &KeyEpoch, passphrase: &str) -> Result<MasterKey, VaultError> {
        let master = derive_master_key(passphrase.as_bytes(), &epoch.salt, &epoch.kdf_params())?;
        if !verify_key_check(&master, &epoch.key_check) {
            return Err(VaultError::WrongPassphrase);
        }
        Ok(master)
    }

    /// Create the vault: fresh salt, master key and key check at generation 0.
    ///
    /// # Errors
    ///
    /// - `AlreadyInitialized` if the storage already holds a vault
    pub fn setup(&self, passphrase: &str) -> Result<UnlockHandle, VaultError> {
        let _guard = self.rotation.write().unwrap_or_else(PoisonError::into_inner);

        if self.storage.load_meta()?.is_some() {
            return Err(VaultError::AlreadyInitialized);
        }

        let (epoch, master) = self.new_epoch(passphrase, 0)?;
        self.storage.store_meta(&VaultMeta { format: META_FORMAT, active: epoch })?;

        tracing::info!("Vault set up");
        Ok(UnlockHandle::new(master, 0))
    }

    /// Re-derive the master key from the passphrase.
    ///
    /// Records left behind by an interrupted rotation are purged.
    ///
    /// # Errors
    ///
    /// - `NotInitialized` before setup
    /// - `WrongPassphrase` if the key check does not match
    pub fn unlock(&self, passphrase: &str) -> Result<UnlockHandle, VaultError> {
        let _guard = self.rotation.write().unwrap_or_else(PoisonError::into_inner);

        let epoch = self.active_epoch()?;
        let master = Self::derive_for(&epoch, passphrase)?;

        self.purge_stale_generations(epoch.generation)?;

        tracing::debug!(generation = epoch.generation, "Vault unlocked");
        Ok(UnlockHandle::new(master, epoch.generation))
    }

    /// Unwrap the master key with the platform key wrapper.
    ///
    /// # Errors
    ///
    /// - `BiometricNotEnabled` if no wrapped key is stored
    /// - `BiometricStale` if the wrapped key predates a passphrase rotation
    /// - `KeyWrap` if the wrapper refuses
    pub fn unlock_with_biometric<B, W>(
        &self,
        keystore: &KeyStore<B>,
        wrapper: &W,
    ) -> Result<UnlockHandle, VaultError>
    where
        B: SecureBackend,
        W: KeyWrapper,
    {
        let _guard = self.rotation.write().unwrap_or_else(PoisonError::into_inner);

        let epoch = self.active_epoch()?;
        let Some(blob) = keystore.get(KeyKind::WrappedMasterKey, KeyOwner::Vault)? else {
            return Err(VaultError::BiometricNotEnabled);
        };

        let master = wrapper.unwrap_key(&blob)?;
        if !verify_key_check(&master, &epoch.key_check) {
            return Err(VaultError::BiometricStale);
        }

        self.purge_stale_generations(epoch.generation)?;

        tracing::debug!(generation = epoch.generation, "Vault unlocked with biometric key");
        Ok(UnlockHandle::new(master, epoch.generation))
    }

    /// Store the master key wrapped by `wrapper` in the key store.
    ///
    /// # Errors
    ///
    /// - `Locked` / `StaleHandle` unless `handle` holds the active key
    pub fn enable_biometric<B, W>(
        &self,
        handle: &UnlockHandle,
        keystore: &KeyStore<B>,
        wrapper: &W,
    ) -> Result<(), VaultError>
    where
        B: SecureBackend,
        W: KeyWrapper,
    {
        let _guard = self.rotation.read().unwrap_or_else(PoisonError::into_inner);

        let master = self.checked_master(handle)?;
        let blob = Zeroizing::new(wrapper.wrap_key(master)?);
        keystore.put(&blob, KeyKind::WrappedMasterKey, KeyOwner::Vault)?;

        tracing::info!("Biometric unlock enabled");
        Ok(())
    }

    /// Remove the wrapped master key. Idempotent.
    pub fn disable_biometric<B: SecureBackend>(
        &self,
        keystore: &KeyStore<B>,
    ) -> Result<(), VaultError> {
        keystore.delete(KeyKind::WrappedMasterKey, KeyOwner::Vault)?;
        tracing::info!("Biometric unlock disabled");
        Ok(())
    }

    fn checked_master<'h>(&self, handle: &'h UnlockHandle) -> Result<&'h MasterKey, VaultError> {
        let master = handle.master().ok_or(VaultError::Locked)?;
        let active = self.active_epoch()?.generation;
        if handle.generation() != active {
            return Err(VaultError::StaleHandle { handle: handle.generation(), active });
        }
        Ok(master)
    }

    /// Encrypt and persist one message under the room's agreed policy.
    ///
    /// Writes nothing unless the handle is unlocked and the policy is agreed
    /// by both peers with a persistent lifetime. Saving an id that is already
    /// stored leaves the existing record and its expiry untouched.
    ///
    /// # Errors
    ///
    /// - `StaleHandle` if the vault was rotated since the handle was issued
    pub fn save_message(
        &self,
        handle: &UnlockHandle,
        room_id: &str,
        message: &Message,
        policy: &RetentionPolicy,
    ) -> Result<SaveOutcome, VaultError> {
        let _guard = self.rotation.read().unwrap_or_else(PoisonError::into_inner);

        if !handle.is_unlocked() {
            return Ok(SaveOutcome::Skipped(SkipReason::Locked));
        }
        if !policy.agreed_by_both {
            return Ok(SaveOutcome::Skipped(SkipReason::NotAgreed));
        }
        let Some(lifetime) = policy.lifetime.duration() else {
            return Ok(SaveOutcome::Skipped(SkipReason::DoNotPersist));
        };

        let master = self.checked_master(handle)?;
        let generation = handle.generation();

        if let Some(existing) = self.storage.load_message(generation, room_id, &message.id)? {
            return Ok(SaveOutcome::AlreadyStored { expires_at: existing.expires_at });
        }

        let expires_at = message.timestamp + lifetime.as_secs_f64();
        let record = self.seal(master, generation, room_id, message, Some(expires_at));
        self.storage.put_message(&record)?;

        tracing::debug!(room_id, message_id = %message.id, expires_at, "Persisted message");
        Ok(SaveOutcome::Stored { expires_at })
    }

    fn seal(
        &self,
        master: &MasterKey,
        generation: u32,
        room_id: &str,
        message: &Message,
        expires_at: Option<f64>,
    ) -> StoredMessage {
        let nonce: [u8; NONCE_SIZE] = self.env.random_array();
        let aad = record_aad(generation, room_id, &message.id);
        let (encrypted_content, tag) =
            seal_detached(master.expose(), &nonce, &aad, &message.content);

        StoredMessage {
            id: message.id.clone(),
            room_id: room_id.to_string(),
            encrypted_content,
            nonce,
            tag,
            timestamp: message.timestamp,
            is_from_self: message.is_from_self,
            expires_at,
            key_generation: generation,
        }
    }

    fn open(master: &MasterKey, record: &StoredMessage) -> Result<Message, VaultError> {
        let aad = record_aad(record.key_generation, &record.room_id, &record.id);
        let content = open_detached(
            master.expose(),
            &record.nonce,
            &aad,
            &record.encrypted_content,
            &record.tag,
        )
        .map_err(|_| VaultError::Corrupt { room_id: record.room_id.clone(), id: record.id.clone() })?;

        Ok(Message {
            id: record.id.clone(),
            content,
            timestamp: record.timestamp,
            is_from_self: record.is_from_self,
            expires_at: record.expires_at,
        })
    }

    /// Decrypt every live message of a room, oldest first.
    ///
    /// Records with `expires_at <= now` are never returned, swept or not.
    ///
    /// # Errors
    ///
    /// - `Locked` / `StaleHandle` unless `handle` holds the active key
    /// - `Corrupt` if a record fails authentication
    pub fn load_messages(
        &self,
        handle: &UnlockHandle,
        room_id: &str,
        now: f64,
    ) -> Result<Vec<Message>, VaultError> {
        let _guard = self.rotation.read().unwrap_or_else(PoisonError::into_inner);

        let master = self.checked_master(handle)?;
        let records = self.storage.load_room(handle.generation(), room_id)?;

        let mut messages = records
            .iter()
            .filter(|record| !record.is_expired(now))
            .map(|record| Self::open(master, record))
            .collect::<Result<Vec<_>, _>>()?;

        messages.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    /// Replace the passphrase, re-encrypting every record under a new key.
    ///
    /// Write-new, switch, delete-old: the new generation is fully written
    /// before the metadata switch, and the old one is deleted only after it.
    /// If the final delete fails the rotation still succeeded; the leftovers
    /// are purged on the next unlock.
    ///
    /// Any wrapped biometric key becomes stale and must be re-enabled.
    ///
    /// # Errors
    ///
    /// - `WrongPassphrase` if `old` does not match
    /// - `Corrupt` if an existing record fails authentication (nothing is
    ///   switched)
    pub fn rotate_passphrase(&self, old: &str, new: &str) -> Result<UnlockHandle, VaultError> {
        let _guard = self.rotation.write().unwrap_or_else(PoisonError::into_inner);

        let current = self.active_epoch()?;
        let old_master = Self::derive_for(&current, old)?;
        let next_generation =
            current.generation.checked_add(1).ok_or(VaultError::GenerationExhausted)?;

        // Leftovers from an earlier interrupted attempt
        if self.storage.generations()?.contains(&next_generation) {
            self.storage.delete_generation(next_generation)?;
        }

        let (epoch, new_master) = self.new_epoch(new, next_generation)?;

        let records = self.storage.load_generation(current.generation)?;
        for record in &records {
            let plaintext = Self::open(&old_master, record)?;
            let resealed =
                self.seal(&new_master, next_generation, &record.room_id, &plaintext, record.expires_at);
            self.storage.put_message(&resealed)?;
        }

        self.storage.store_meta(&VaultMeta { format: META_FORMAT, active: epoch })?;

        tracing::info!(
            from = current.generation,
            to = next_generation,
            records = records.len(),
            "Passphrase rotated"
        );

        if let Err(e) = self.storage.delete_generation(current.generation) {
            tracing::warn!(
                generation = current.generation,
                error = %e,
                "Old generation not deleted, will purge on next unlock"
            );
        }

        Ok(UnlockHandle::new(new_master, next_generation))
    }

    /// Delete every record whose own deadline has passed.
    ///
    /// # Errors
    ///
    /// - `StaleHandle` if the vault was rotated since the handle was issued
    pub fn sweep(&self, handle: &UnlockHandle, now: f64) -> Result<SweepReport, VaultError> {
        let _guard = self.rotation.read().unwrap_or_else(PoisonError::into_inner);

        if !handle.is_unlocked() {
            tracing::debug!("Sweep deferred, vault locked");
            return Ok(SweepReport::Deferred);
        }
        self.checked_master(handle)?;

        let records = self.storage.load_generation(handle.generation())?;
        let mut deleted = 0;
        for record in records.iter().filter(|record| record.is_expired(now)) {
            if self.storage.delete_message(record.key_generation, &record.room_id, &record.id)? {
                deleted += 1;
            }
        }

        let remaining = records.len() - deleted;
        if deleted > 0 {
            tracing::debug!(deleted, remaining, "Swept expired messages");
        }
        Ok(SweepReport::Swept { deleted, remaining })
    }

    fn purge_stale_generations(&self, active: u32) -> Result<(), VaultError> {
        for generation in self.storage.generations()? {
            if generation != active {
                let purged = self.storage.delete_generation(generation)?;
                tracing::info!(generation, purged, "Purged stale key generation");
            }
        }
        Ok(())
    }

    /// Record the policy a room last agreed on. Informational only.
    pub fn store_room_policy(
        &self,
        room_id: &str,
        policy: &RetentionPolicy,
        agreed_at: u64,
    ) -> Result<(), VaultError> {
        let record = RoomPolicyRecord {
            room_id: room_id.to_string(),
            policy_value: policy.lifetime,
            agreed_at,
            agreed_by_both: policy.agreed_by_both,
        };
        self.storage.store_room_policy(&record)?;
        Ok(())
    }

    /// The policy a room last agreed on, if recorded.
    pub fn load_room_policy(&self, room_id: &str) -> Result<Option<RoomPolicyRecord>, VaultError> {
        Ok(self.storage.load_room_policy(room_id)?)
    }
}
