//! Fault-injecting secure backend for chaos testing.

use std::sync::{Arc, Mutex};

use zeroize::Zeroizing;

use super::{AccessControl, KeyAccount, KeyStoreError, SecureBackend};

/// Backend wrapper that injects `Backend` failures.
///
/// Two modes: a seeded random failure rate applied to every operation, or a
/// deterministic schedule failing every n-th `remove` (teardown retry tests).
#[derive(Clone)]
pub struct ChaoticBackend<B: SecureBackend> {
    inner: B,
    mode: FailureMode,
    state: Arc<Mutex<ChaosState>>,
}

#[derive(Clone, Copy)]
enum FailureMode {
    /// Fail any operation with this probability
    Random(f64),
    /// Fail every n-th remove, nothing else
    EveryNthRemove(u64),
}

struct ChaosState {
    /// LCG state for deterministic chaos
    rng: u64,
    removes: u64,
}

impl ChaosState {
    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.rng = (A.wrapping_mul(self.rng).wrapping_add(C)) % M;
        (self.rng as f64) / (M as f64)
    }
}

impl<B: SecureBackend> ChaoticBackend<B> {
    /// Fail every operation with probability `failure_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: B, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Same as [`ChaoticBackend::new`] with an explicit seed.
    pub fn with_seed(inner: B, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );
        Self::build(inner, FailureMode::Random(failure_rate), seed)
    }

    /// Fail exactly every `n`-th remove.
    pub fn failing_every(inner: B, n: u64) -> Self {
        assert!(n > 0, "n must be positive");
        Self::build(inner, FailureMode::EveryNthRemove(n), 0)
    }

    fn build(inner: B, mode: FailureMode, seed: u64) -> Self {
        Self { inner, mode, state: Arc::new(Mutex::new(ChaosState { rng: seed, removes: 0 })) }
    }

    /// Underlying backend (for checking invariants after chaos).
    pub fn inner(&self) -> &B {
        &self.inner
    }

    #[allow(clippy::expect_used)]
    fn should_fail(&self, is_remove: bool) -> bool {
        let mut state = self.state.lock().expect("ChaosState mutex poisoned");
        match self.mode {
            FailureMode::Random(rate) => state.next() < rate,
            FailureMode::EveryNthRemove(n) => {
                if !is_remove {
                    return false;
                }
                state.removes += 1;
                state.removes % n == 0
            },
        }
    }

    fn inject(&self, is_remove: bool) -> Result<(), KeyStoreError> {
        if self.should_fail(is_remove) {
            return Err(KeyStoreError::Backend("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<B: SecureBackend> SecureBackend for ChaoticBackend<B> {
    fn write(
        &self,
        account: KeyAccount,
        bytes: &[u8],
        access: AccessControl,
    ) -> Result<(), KeyStoreError> {
        self.inject(false)?;
        self.inner.write(account, bytes, access)
    }

    fn read(&self, account: KeyAccount) -> Result<Option<Zeroizing<Vec<u8>>>, KeyStoreError> {
        self.inject(false)?;
        self.inner.read(account)
    }

    fn remove(&self, account: KeyAccount) -> Result<(), KeyStoreError> {
        self.inject(true)?;
        self.inner.remove(account)
    }

    fn accounts(&self) -> Result<Vec<KeyAccount>, KeyStoreError> {
        self.inject(false)?;
        self.inner.accounts()
    }
}
