//! Convergence tests for concurrent retention proposals.
//!
//! Both peers propose before either sees the other's proposal. The signaling
//! channel is ordered per direction, but the two directions interleave
//! arbitrarily. Whatever the interleaving, both sides must end in the same
//! `Agreed` policy: the later proposal, or the longer lifetime on a tie.

use std::collections::VecDeque;

use proptest::prelude::*;
use vanish_core::{
    Lifetime, NegotiationState, RetentionNegotiator, RetentionPolicy, SessionAction, SessionId,
};
use vanish_proto::SignalMessage;

const ALICE: SessionId = SessionId::new(0xA11CE);
const BOB: SessionId = SessionId::new(0xB0B);

fn outgoing(actions: Vec<SessionAction>) -> impl Iterator<Item = SignalMessage> {
    actions.into_iter().filter_map(|a| match a {
        SessionAction::SendSignal(s) => Some(s),
        _ => None,
    })
}

/// Run both negotiators to quiescence.
///
/// `schedule` picks which direction delivers next (true = to Alice); once it
/// runs out, remaining messages are drained alternately.
fn run(
    alice_proposal: (Lifetime, u64),
    bob_proposal: (Lifetime, u64),
    schedule: &[bool],
) -> (RetentionNegotiator, RetentionNegotiator) {
    let mut alice = RetentionNegotiator::new(ALICE, BOB);
    let mut bob = RetentionNegotiator::new(BOB, ALICE);

    let mut to_bob: VecDeque<SignalMessage> =
        outgoing(alice.propose(alice_proposal.0, alice_proposal.1)).collect();
    let mut to_alice: VecDeque<SignalMessage> =
        outgoing(bob.propose(bob_proposal.0, bob_proposal.1)).collect();

    let now = alice_proposal.1.max(bob_proposal.1) + 1;
    let mut steps = schedule.iter().copied().chain([true, false].into_iter().cycle());

    while !to_alice.is_empty() || !to_bob.is_empty() {
        let deliver_to_alice = match steps.next() {
            Some(pick) if !to_alice.is_empty() && !to_bob.is_empty() => pick,
            _ => !to_alice.is_empty(),
        };

        if deliver_to_alice {
            if let Some(signal) = to_alice.pop_front() {
                to_bob.extend(outgoing(alice.handle_signal(&signal, now).unwrap()));
            }
        } else if let Some(signal) = to_bob.pop_front() {
            to_alice.extend(outgoing(bob.handle_signal(&signal, now).unwrap()));
        }
    }

    (alice, bob)
}

fn lifetime() -> impl Strategy<Value = Lifetime> {
    prop::sample::select(Lifetime::ALL.to_vec())
}

#[test]
fn later_proposal_wins_in_every_order() {
    // Two messages in flight, so every interleaving is one of these
    for schedule in [[true, true], [true, false], [false, true], [false, false]] {
        let (alice, bob) = run((Lifetime::OneDay, 100), (Lifetime::SevenDays, 101), &schedule);

        let expected =
            RetentionPolicy { lifetime: Lifetime::SevenDays, proposed_at: 101, agreed_by_both: true };
        assert_eq!(alice.state(), NegotiationState::Agreed(expected), "schedule {schedule:?}");
        assert_eq!(bob.state(), NegotiationState::Agreed(expected), "schedule {schedule:?}");
    }
}

proptest! {
    #[test]
    fn prop_concurrent_proposals_converge(
        alice_lifetime in lifetime(),
        bob_lifetime in lifetime(),
        alice_at in 0u64..5,
        bob_at in 0u64..5,
        schedule in prop::collection::vec(any::<bool>(), 0..8),
    ) {
        let (alice, bob) =
            run((alice_lifetime, alice_at), (bob_lifetime, bob_at), &schedule);

        prop_assert_eq!(alice.state(), bob.state());

        let winner = std::cmp::max((alice_at, alice_lifetime), (bob_at, bob_lifetime));
        let expected = RetentionPolicy {
            lifetime: winner.1,
            proposed_at: winner.0,
            agreed_by_both: true,
        };
        prop_assert_eq!(alice.state(), NegotiationState::Agreed(expected));
    }

    #[test]
    fn prop_disconnect_always_resets(
        alice_lifetime in lifetime(),
        bob_lifetime in lifetime(),
        schedule in prop::collection::vec(any::<bool>(), 0..8),
    ) {
        let (mut alice, mut bob) = run((alice_lifetime, 10), (bob_lifetime, 20), &schedule);

        alice.disconnect();
        bob.disconnect();

        prop_assert_eq!(alice.policy(), RetentionPolicy::DO_NOT_PERSIST);
        prop_assert_eq!(bob.policy(), RetentionPolicy::DO_NOT_PERSIST);
    }
}
