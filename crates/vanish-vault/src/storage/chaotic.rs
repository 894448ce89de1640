//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that fails operations, either randomly or on a chosen
//! operation, to test error handling and crash recovery. A targeted failure
//! stands in for a crash at that point: everything before it is durable,
//! nothing after it happens.

use std::sync::{Arc, Mutex};

use super::{Storage, StorageError};
use crate::record::{RoomPolicyRecord, StoredMessage, VaultMeta};

/// Storage operations that can be targeted for failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    /// [`Storage::load_meta`]
    LoadMeta,
    /// [`Storage::store_meta`]
    StoreMeta,
    /// [`Storage::put_message`]
    PutMessage,
    /// [`Storage::load_message`], [`Storage::load_room`],
    /// [`Storage::load_generation`]
    LoadMessages,
    /// [`Storage::delete_message`]
    DeleteMessage,
    /// [`Storage::delete_generation`]
    DeleteGeneration,
    /// [`Storage::generations`]
    ListGenerations,
    /// [`Storage::store_room_policy`], [`Storage::load_room_policy`]
    RoomPolicy,
}

/// Chaotic storage wrapper that injects failures
///
/// Delegates to an underlying storage implementation but fails operations
/// based on a configured failure rate, or every call to one targeted
/// operation while armed. Uses Arc<Mutex<>> for the RNG state, making it
/// Clone and thread-safe.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Operation that always fails while set
    target: Arc<Mutex<Option<StorageOp>>>,
}

/// Simple deterministic RNG for chaos injection
///
/// Uses linear congruential generator (LCG) for fast, deterministic randomness.
/// This ensures chaos tests are reproducible with the same seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate next random value [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            target: Arc::new(Mutex::new(None)),
        }
    }

    /// Wrapper that never fails randomly; arm it with [`Self::fail_on`].
    pub fn targeted(inner: S) -> Self {
        Self::new(inner, 0.0)
    }

    /// Fail every call to `op` until [`Self::heal`].
    #[allow(clippy::expect_used)]
    pub fn fail_on(&self, op: StorageOp) {
        *self.target.lock().expect("target mutex poisoned") = Some(op);
    }

    /// Stop targeted failures.
    #[allow(clippy::expect_used)]
    pub fn heal(&self) {
        *self.target.lock().expect("target mutex poisoned") = None;
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Check if this operation should fail
    fn check(&self, op: StorageOp) -> Result<(), StorageError> {
        #[allow(clippy::expect_used)]
        let targeted = *self.target.lock().expect("target mutex poisoned") == Some(op);

        #[allow(clippy::expect_used)]
        let random = self.failure_rate > 0.0
            && self.rng.lock().expect("ChaoticRng mutex poisoned").next() < self.failure_rate;

        if targeted || random {
            return Err(StorageError::Io(format!("chaotic failure injection: {op:?}")));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn load_meta(&self) -> Result<Option<VaultMeta>, StorageError> {
        self.check(StorageOp::LoadMeta)?;
        self.inner.load_meta()
    }

    fn store_meta(&self, meta: &VaultMeta) -> Result<(), StorageError> {
        self.check(StorageOp::StoreMeta)?;
        self.inner.store_meta(meta)
    }

    fn put_message(&self, message: &StoredMessage) -> Result<(), StorageError> {
        self.check(StorageOp::PutMessage)?;
        self.inner.put_message(message)
    }

    fn load_message(
        &self,
        generation: u32,
        room_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredMessage>, StorageError> {
        self.check(StorageOp::LoadMessages)?;
        self.inner.load_message(generation, room_id, message_id)
    }

    fn load_room(&self, generation: u32, room_id: &str) -> Result<Vec<StoredMessage>, StorageError> {
        self.check(StorageOp::LoadMessages)?;
        self.inner.load_room(generation, room_id)
    }

    fn load_generation(&self, generation: u32) -> Result<Vec<StoredMessage>, StorageError> {
        self.check(StorageOp::LoadMessages)?;
        self.inner.load_generation(generation)
    }

    fn delete_message(
        &self,
        generation: u32,
        room_id: &str,
        message_id: &str,
    ) -> Result<bool, StorageError> {
        self.check(StorageOp::DeleteMessage)?;
        self.inner.delete_message(generation, room_id, message_id)
    }

    fn delete_generation(&self, generation: u32) -> Result<usize, StorageError> {
        self.check(StorageOp::DeleteGeneration)?;
        self.inner.delete_generation(generation)
    }

    fn generations(&self) -> Result<Vec<u32>, StorageError> {
        self.check(StorageOp::ListGenerations)?;
        self.inner.generations()
    }

    fn store_room_policy(&self, record: &RoomPolicyRecord) -> Result<(), StorageError> {
        self.check(StorageOp::RoomPolicy)?;
        self.inner.store_room_policy(record)
    }

    fn load_room_policy(&self, room_id: &str) -> Result<Option<RoomPolicyRecord>, StorageError> {
        self.check(StorageOp::RoomPolicy)?;
        self.inner.load_room_policy(room_id)
    }
}
