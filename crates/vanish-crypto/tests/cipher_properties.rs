//! Property-based tests for the connection cipher
//!
//! These tests verify the fundamental invariants of the message path:
//!
//! 1. **Round-trip**: open(encrypt(m)) == m for all messages
//! 2. **Agreement**: both peers derive the same root secret
//! 3. **Tamper rejection**: any single flipped bit fails authentication
//! 4. **Key uniqueness**: distinct (direction, counter) pairs never share a key
//! 5. **Replay rejection**: nothing at or below the last accepted counter opens
//! 6. **Gap rejection**: a jump of `max_gap` or more is refused, valid tag or not

use proptest::prelude::*;
use vanish_crypto::{
    CryptoError, Direction, EphemeralKeyPair, MessageRatchet, ReplayWindow, RootSecret,
    derive_message_key, derive_root_secret, encrypt, open,
};

fn arb_key() -> impl Strategy<Value = [u8; 32]> {
    prop::collection::vec(any::<u8>(), 32..=32).prop_map(|v| {
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&v);
        arr
    })
}

fn arb_direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::InitiatorToResponder), Just(Direction::ResponderToInitiator)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_encrypt_open_roundtrip(
        plaintext in prop::collection::vec(any::<u8>(), 0..1000),
        root in arb_key(),
        counter in 1u64..u64::MAX,
        direction in arb_direction(),
        nonce in any::<[u8; 12]>(),
    ) {
        let root = RootSecret::from_bytes(root);
        let wire = encrypt(&plaintext, &root, counter, direction, nonce);

        prop_assert_eq!(open(&wire, &root, direction).unwrap(), plaintext);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_key_agreement_symmetric(alice_seed in arb_key(), bob_seed in arb_key()) {
        let alice = EphemeralKeyPair::from_random(alice_seed);
        let bob = EphemeralKeyPair::from_random(bob_seed);
        prop_assume!(alice.public_bytes() != bob.public_bytes());

        let root_a = derive_root_secret(&alice, &bob.public_bytes()).unwrap();
        let root_b = derive_root_secret(&bob, &alice.public_bytes()).unwrap();

        prop_assert_eq!(root_a.expose(), root_b.expose());

        let role_a = alice.role_against(&bob.public_bytes()).unwrap();
        let role_b = bob.role_against(&alice.public_bytes()).unwrap();
        prop_assert_eq!(role_a.sending(), role_b.receiving());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_single_bit_flip_rejected(
        plaintext in prop::collection::vec(any::<u8>(), 1..256),
        root in arb_key(),
        flip_index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let root = RootSecret::from_bytes(root);
        let direction = Direction::InitiatorToResponder;
        let wire = encrypt(&plaintext, &root, 1, direction, [0; 12]);

        // Flip one bit somewhere in ciphertext ‖ tag
        let mut tampered = wire.clone();
        let total = tampered.ciphertext.len() + tampered.tag.len();
        let index = flip_index.index(total);
        if index < tampered.ciphertext.len() {
            tampered.ciphertext[index] ^= 1 << bit;
        } else {
            tampered.tag[index - tampered.ciphertext.len()] ^= 1 << bit;
        }

        prop_assert_eq!(open(&tampered, &root, direction), Err(CryptoError::AuthenticationFailed));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_message_keys_unique(root in arb_key(), count in 2u64..20) {
        let root = RootSecret::from_bytes(root);
        let mut keys = Vec::new();

        for counter in 1..=count {
            keys.push(derive_message_key(&root, Direction::InitiatorToResponder, counter));
            keys.push(derive_message_key(&root, Direction::ResponderToInitiator, counter));
        }

        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                prop_assert_ne!(
                    keys[i].key(),
                    keys[j].key(),
                    "keys for ({:?}, {}) and ({:?}, {}) must differ",
                    keys[i].direction(),
                    keys[i].counter(),
                    keys[j].direction(),
                    keys[j].counter()
                );
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_replay_never_accepted(
        root in arb_key(),
        accepted in 1u64..500,
        replayed in 1u64..500,
    ) {
        prop_assume!(replayed <= accepted);

        let root = RootSecret::from_bytes(root);
        let direction = Direction::ResponderToInitiator;
        let mut window = ReplayWindow::new(1000);

        let first = encrypt(b"first", &root, accepted, direction, [1; 12]);
        window.decrypt(&first, &root, direction).unwrap();

        let replay = encrypt(b"again", &root, replayed, direction, [2; 12]);
        let is_replay_rejection = matches!(
            window.decrypt(&replay, &root, direction),
            Err(CryptoError::ReplayDetected { .. })
        );
        prop_assert!(is_replay_rejection);
        prop_assert_eq!(window.last_seen(direction), accepted);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_gap_rejected_despite_valid_tag(
        root in arb_key(),
        direction in arb_direction(),
        max_gap in 2u64..2000,
        last in 1u64..2000,
        beyond in 0u64..10_000,
    ) {
        prop_assume!(last < max_gap);

        let root = RootSecret::from_bytes(root);
        let mut window = ReplayWindow::new(max_gap);

        let accepted = encrypt(b"in window", &root, last, direction, [3; 12]);
        window.decrypt(&accepted, &root, direction).unwrap();

        let counter = last + max_gap + beyond;
        let jumped = encrypt(b"too far", &root, counter, direction, [4; 12]);
        prop_assert_eq!(open(&jumped, &root, direction).unwrap(), b"too far".to_vec());

        prop_assert_eq!(
            window.decrypt(&jumped, &root, direction),
            Err(CryptoError::GapTooLarge { counter, last_seen: last, max_gap })
        );
        prop_assert_eq!(window.last_seen(direction), last);

        let next = encrypt(b"next", &root, last + max_gap - 1, direction, [5; 12]);
        prop_assert_eq!(window.decrypt(&next, &root, direction).unwrap(), b"next".to_vec());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn prop_ratchet_conversation_in_order(
        alice_seed in arb_key(),
        bob_seed in arb_key(),
        messages in prop::collection::vec(
            (any::<bool>(), prop::collection::vec(any::<u8>(), 0..64)),
            1..30,
        ),
    ) {
        let alice_keys = EphemeralKeyPair::from_random(alice_seed);
        let bob_keys = EphemeralKeyPair::from_random(bob_seed);
        prop_assume!(alice_keys.public_bytes() != bob_keys.public_bytes());

        let mut alice = MessageRatchet::new(
            derive_root_secret(&alice_keys, &bob_keys.public_bytes()).unwrap(),
            alice_keys.role_against(&bob_keys.public_bytes()).unwrap(),
            1000,
        );
        let mut bob = MessageRatchet::new(
            derive_root_secret(&bob_keys, &alice_keys.public_bytes()).unwrap(),
            bob_keys.role_against(&alice_keys.public_bytes()).unwrap(),
            1000,
        );

        for (from_alice, body) in messages {
            let (sender, receiver) =
                if from_alice { (&mut alice, &mut bob) } else { (&mut bob, &mut alice) };
            let wire = sender.encrypt(&body, [7; 12]).unwrap();
            prop_assert_eq!(receiver.decrypt(&wire).unwrap(), body);
        }
    }
}
