//! Property tests for the connection key exchange.
//!
//! Invariants:
//! 1. **Agreement**: two sessions driven by signals alone reach Established
//!    with opposite roles and interoperable ratchets
//! 2. **Order independence**: the peer key may arrive before or after our own
//!    `begin_exchange`
//! 3. **Wipe on teardown**: no key material remains in the key store
//! 4. **Fail closed**: a corrupted message fails the session and reveals no
//!    plaintext

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use proptest::prelude::*;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use vanish_core::{
    ConnectionSession, KeyStore, MemoryBackend, SessionAction, SessionConfig, SessionError,
    SessionId, SessionState, env::Environment,
};
use vanish_proto::SignalMessage;

// Seeded RNG shared across clones so every draw advances one stream
#[derive(Clone)]
struct SeededEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl SeededEnv {
    fn new(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))) }
    }
}

impl Environment for SeededEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock_secs(&self) -> u64 {
        1_700_000_000
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap().fill_bytes(buffer);
    }
}

struct Side {
    session: ConnectionSession,
    keystore: KeyStore<MemoryBackend>,
    env: SeededEnv,
}

impl Side {
    fn new(env: SeededEnv) -> Self {
        let id = SessionId::random(&env);
        Self {
            session: ConnectionSession::new(id, Instant::now(), SessionConfig::default()),
            keystore: KeyStore::new(MemoryBackend::new()),
            env,
        }
    }

    fn begin(&mut self) -> Vec<SignalMessage> {
        signals(self.session.begin_exchange(&self.keystore, &self.env).unwrap())
    }

    fn receive(&mut self, incoming: &[SignalMessage]) -> Vec<SignalMessage> {
        let mut out = Vec::new();
        for signal in incoming {
            out.extend(signals(self.session.handle_signal(&self.keystore, signal).unwrap()));
        }
        out
    }
}

fn signals(actions: Vec<SessionAction>) -> Vec<SignalMessage> {
    actions
        .into_iter()
        .filter_map(|a| match a {
            SessionAction::SendSignal(s) => Some(s),
            _ => None,
        })
        .collect()
}

fn establish(seed: u64, bob_first: bool) -> (Side, Side) {
    let env = SeededEnv::new(seed);
    let mut alice = Side::new(env.clone());
    let mut bob = Side::new(env);

    let from_alice = alice.begin();
    let from_bob = if bob_first {
        // Bob sees Alice's key before starting; it is buffered
        assert!(bob.receive(&from_alice).is_empty());
        bob.begin()
    } else {
        let mut out = bob.begin();
        out.extend(bob.receive(&from_alice));
        out
    };
    let back = alice.receive(&from_bob);
    bob.receive(&back);

    (alice, bob)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_exchange_agrees(seed in any::<u64>(), bob_first in any::<bool>()) {
        let (alice, bob) = establish(seed, bob_first);

        prop_assert_eq!(alice.session.state(), SessionState::Established);
        prop_assert_eq!(bob.session.state(), SessionState::Established);
        prop_assert_ne!(alice.session.role(), bob.session.role());
    }

    #[test]
    fn prop_conversation_round_trips(
        seed in any::<u64>(),
        messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 1..16),
    ) {
        let (mut alice, mut bob) = establish(seed, false);

        for (i, plaintext) in messages.iter().enumerate() {
            let (sender, receiver) =
                if i % 2 == 0 { (&mut alice, &mut bob) } else { (&mut bob, &mut alice) };
            let nonce = sender.env.random_array();
            let wire = sender.session.encrypt(plaintext, nonce).unwrap();
            let opened = receiver.session.decrypt(&wire).unwrap();
            prop_assert_eq!(&opened, plaintext);
        }
    }

    #[test]
    fn prop_teardown_wipes_all_keys(seed in any::<u64>()) {
        let (mut alice, mut bob) = establish(seed, true);

        alice.session.teardown(&alice.keystore, "user closed").unwrap();
        bob.session.teardown(&bob.keystore, "peer closed").unwrap();

        prop_assert!(alice.keystore.backend().is_empty());
        prop_assert!(bob.keystore.backend().is_empty());
        prop_assert_eq!(alice.session.state(), SessionState::Closed);
    }
}

#[test]
fn corrupted_message_fails_session() {
    let (mut alice, mut bob) = establish(7, false);

    let nonce = alice.env.random_array();
    let mut wire = alice.session.encrypt(b"meet at noon", nonce).unwrap();
    wire.ciphertext[0] ^= 0x01;

    let err = bob.session.decrypt(&wire).unwrap_err();
    assert!(err.is_unverifiable());
    assert!(err.is_session_fatal());
    assert_eq!(bob.session.state(), SessionState::Failed);

    // A failed session refuses further traffic
    assert!(matches!(
        bob.session.encrypt(b"hello?", nonce),
        Err(SessionError::InvalidState { state: SessionState::Failed, .. })
    ));
}

#[test]
fn reconnect_uses_fresh_keys() {
    let env = SeededEnv::new(99);
    let mut first = Side::new(env.clone());
    let mut second = Side::new(env);

    let a = first.begin();
    let b = second.begin();

    assert_ne!(first.session.id(), second.session.id());
    assert_ne!(a, b);
    assert_ne!(first.session.local_public_key(), second.session.local_public_key());
}
