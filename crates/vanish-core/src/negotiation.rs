//! Retention negotiation state machine.
//!
//! Both peers must agree on how long persisted messages survive before any
//! message is written to disk. The negotiator is per connection: a
//! disconnect resets it, and a reconnect starts from [`NegotiationState::NoPolicy`].
//!
//! # State Machine
//!
//! ```text
//!            propose                     accept received / local accept
//! ┌──────────┐───────>┌─────────────────┐──────────────────────────>┌────────┐
//! │ NoPolicy │        │ Pending(origin) │                           │ Agreed │
//! └──────────┘<───────└─────────────────┘<──────────────────────────└────────┘
//!      ↑      reject                          propose / proposal received
//!      └──────────────────── disconnect (from any state)
//! ```
//!
//! # Conflicting proposals
//!
//! If both peers propose before seeing each other's proposal, the later
//! `proposed_at` wins and a tie goes to the longer lifetime. The side whose
//! own proposal lost accepts the winner; the side that won ignores the losing
//! proposal and waits for the acceptance. Both sides evaluate the same total
//! order, so they converge regardless of delivery interleaving.
//!
//! Leaving `Agreed` only changes what future saves do. Messages already
//! persisted keep the expiry they were saved with.

use serde::{Deserialize, Serialize};
use vanish_proto::{Lifetime, SignalMessage};

use crate::{
    error::NegotiationError,
    event::{SessionAction, SessionEvent},
    session::SessionId,
};

/// Retention policy in effect for new messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    /// Agreed lifetime
    pub lifetime: Lifetime,
    /// Unix seconds of the winning proposal
    pub proposed_at: u64,
    /// Both peers confirmed this exact lifetime
    pub agreed_by_both: bool,
}

impl RetentionPolicy {
    /// The default: nothing is persisted.
    pub const DO_NOT_PERSIST: Self =
        Self { lifetime: Lifetime::DoNotPersist, proposed_at: 0, agreed_by_both: false };

    /// Whether new messages may be written to storage under this policy.
    pub fn allows_persistence(&self) -> bool {
        self.agreed_by_both && self.lifetime.is_persistent()
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::DO_NOT_PERSIST
    }
}

/// One side's proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    /// Proposed lifetime
    pub lifetime: Lifetime,
    /// Unix seconds at which it was proposed
    pub proposed_at: u64,
}

impl Proposal {
    /// Total order used to settle concurrent proposals.
    fn rank(&self) -> (u64, Lifetime) {
        (self.proposed_at, self.lifetime)
    }

    fn supersedes(&self, other: &Self) -> bool {
        self.rank() > other.rank()
    }
}

/// Which side made the outstanding proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// We proposed and wait for the peer
    Local,
    /// The peer proposed and waits for us
    Remote,
}

/// Negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No policy; equivalent to do-not-persist
    NoPolicy,
    /// A proposal is outstanding
    Pending {
        /// The proposal
        proposal: Proposal,
        /// Who made it
        origin: Origin,
    },
    /// Both peers confirmed the same lifetime
    Agreed(RetentionPolicy),
}

/// Two-party retention negotiator for one connection.
#[derive(Debug, Clone)]
pub struct RetentionNegotiator {
    local_session: SessionId,
    peer_session: SessionId,
    state: NegotiationState,
}

impl RetentionNegotiator {
    /// Start in [`NegotiationState::NoPolicy`].
    ///
    /// Outgoing signals carry `local_session`; incoming ones must carry
    /// `peer_session`.
    pub fn new(local_session: SessionId, peer_session: SessionId) -> Self {
        Self { local_session, peer_session, state: NegotiationState::NoPolicy }
    }

    /// Current state.
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Policy gating new saves. Anything but `Agreed` means do-not-persist.
    pub fn policy(&self) -> RetentionPolicy {
        match self.state {
            NegotiationState::Agreed(policy) => policy,
            _ => RetentionPolicy::DO_NOT_PERSIST,
        }
    }

    /// Propose `lifetime` to the peer.
    ///
    /// Valid from every state. A counter-proposal to an outstanding remote
    /// proposal is timestamped after it, so it wins the conflict rule on the
    /// peer's side.
    pub fn propose(&mut self, lifetime: Lifetime, now_secs: u64) -> Vec<SessionAction> {
        let proposed_at = match self.state {
            NegotiationState::Pending { proposal, origin: Origin::Remote } => {
                now_secs.max(proposal.proposed_at.saturating_add(1))
            },
            _ => now_secs,
        };

        let proposal = Proposal { lifetime, proposed_at };
        self.state = NegotiationState::Pending { proposal, origin: Origin::Local };

        tracing::debug!(
            session_id = %self.local_session,
            %lifetime,
            proposed_at,
            "Proposed retention lifetime"
        );

        vec![SessionAction::SendSignal(SignalMessage::LifetimeProposal {
            session_id: self.local_session.to_string(),
            duration: lifetime,
            proposed_at,
        })]
    }

    /// Accept the peer's outstanding proposal.
    ///
    /// # Errors
    ///
    /// - `NothingPending` unless a remote proposal is outstanding
    pub fn accept(&mut self, now_secs: u64) -> Result<Vec<SessionAction>, NegotiationError> {
        let NegotiationState::Pending { proposal, origin: Origin::Remote } = self.state else {
            return Err(NegotiationError::NothingPending { operation: "accept", state: self.state });
        };

        Ok(self.agree_and_accept(proposal, now_secs))
    }

    /// Reject the peer's outstanding proposal.
    ///
    /// # Errors
    ///
    /// - `NothingPending` unless a remote proposal is outstanding
    pub fn reject(
        &mut self,
        reason: Option<String>,
    ) -> Result<Vec<SessionAction>, NegotiationError> {
        let NegotiationState::Pending { origin: Origin::Remote, .. } = self.state else {
            return Err(NegotiationError::NothingPending { operation: "reject", state: self.state });
        };

        self.state = NegotiationState::NoPolicy;
        tracing::debug!(session_id = %self.local_session, "Rejected retention proposal");

        Ok(vec![
            SessionAction::SendSignal(SignalMessage::LifetimeReject {
                session_id: self.local_session.to_string(),
                reason: reason.clone(),
            }),
            SessionAction::Emit(SessionEvent::PolicyRejected { reason, by_peer: false }),
        ])
    }

    /// Process a retention signal from the peer.
    ///
    /// # Errors
    ///
    /// All errors leave the state untouched.
    ///
    /// - `SessionMismatch` for signals from another connection attempt
    /// - `AcceptMismatch` if the peer accepted something we did not propose
    /// - `UnexpectedSignal` for accepts/rejects with nothing pending, or for
    ///   key exchange signals
    pub fn handle_signal(
        &mut self,
        signal: &SignalMessage,
        now_secs: u64,
    ) -> Result<Vec<SessionAction>, NegotiationError> {
        let got = signal.session_id();
        if got != self.peer_session.to_string() {
            return Err(NegotiationError::SessionMismatch {
                expected: self.peer_session.to_string(),
                got: got.to_string(),
            });
        }

        match *signal {
            SignalMessage::LifetimeProposal { duration, proposed_at, .. } => {
                Ok(self.handle_proposal(Proposal { lifetime: duration, proposed_at }, now_secs))
            },
            SignalMessage::LifetimeAccept { duration, .. } => self.handle_accept(duration),
            SignalMessage::LifetimeReject { ref reason, .. } => self.handle_reject(reason.clone()),
            _ => Err(NegotiationError::UnexpectedSignal { kind: signal.kind(), state: self.state }),
        }
    }

    fn handle_proposal(&mut self, remote: Proposal, now_secs: u64) -> Vec<SessionAction> {
        if let NegotiationState::Pending { proposal: local, origin: Origin::Local } = self.state {
            if remote.supersedes(&local) {
                tracing::debug!(
                    session_id = %self.local_session,
                    lifetime = %remote.lifetime,
                    "Peer proposal supersedes ours, accepting"
                );
                return self.agree_and_accept(remote, now_secs);
            }

            // Same lifetime: both sides agree, keyed on the winning timestamp
            if remote.lifetime == local.lifetime {
                return self.agree_and_accept(local, now_secs);
            }

            tracing::debug!(
                session_id = %self.local_session,
                lifetime = %remote.lifetime,
                "Ignoring superseded peer proposal"
            );
            return Vec::new();
        }

        self.state = NegotiationState::Pending { proposal: remote, origin: Origin::Remote };

        vec![SessionAction::Emit(SessionEvent::PolicyProposed {
            lifetime: remote.lifetime,
            proposed_at: remote.proposed_at,
        })]
    }

    fn handle_accept(&mut self, accepted: Lifetime) -> Result<Vec<SessionAction>, NegotiationError> {
        match self.state {
            NegotiationState::Pending { proposal, origin: Origin::Local } => {
                if proposal.lifetime != accepted {
                    return Err(NegotiationError::AcceptMismatch {
                        proposed: proposal.lifetime,
                        accepted,
                    });
                }

                let policy = RetentionPolicy {
                    lifetime: proposal.lifetime,
                    proposed_at: proposal.proposed_at,
                    agreed_by_both: true,
                };
                self.state = NegotiationState::Agreed(policy);

                tracing::info!(
                    session_id = %self.local_session,
                    lifetime = %policy.lifetime,
                    "Retention policy agreed"
                );

                Ok(vec![SessionAction::Emit(SessionEvent::PolicyAgreed(policy))])
            },
            // Both sides accepted the same winner; the echo changes nothing
            NegotiationState::Agreed(policy) if policy.lifetime == accepted => Ok(Vec::new()),
            state => Err(NegotiationError::UnexpectedSignal { kind: "lifetime_accept", state }),
        }
    }

    fn handle_reject(
        &mut self,
        reason: Option<String>,
    ) -> Result<Vec<SessionAction>, NegotiationError> {
        let NegotiationState::Pending { .. } = self.state else {
            return Err(NegotiationError::UnexpectedSignal {
                kind: "lifetime_reject",
                state: self.state,
            });
        };

        self.state = NegotiationState::NoPolicy;
        tracing::debug!(session_id = %self.local_session, "Peer rejected retention proposal");

        Ok(vec![SessionAction::Emit(SessionEvent::PolicyRejected { reason, by_peer: true })])
    }

    fn agree_and_accept(&mut self, proposal: Proposal, now_secs: u64) -> Vec<SessionAction> {
        let policy = RetentionPolicy {
            lifetime: proposal.lifetime,
            proposed_at: proposal.proposed_at,
            agreed_by_both: true,
        };
        self.state = NegotiationState::Agreed(policy);

        tracing::info!(
            session_id = %self.local_session,
            lifetime = %policy.lifetime,
            "Retention policy agreed"
        );

        vec![
            SessionAction::SendSignal(SignalMessage::LifetimeAccept {
                session_id: self.local_session.to_string(),
                duration: proposal.lifetime,
                accepted_at: now_secs,
            }),
            SessionAction::Emit(SessionEvent::PolicyAgreed(policy)),
        ]
    }

    /// Forget everything. Called when the connection drops.
    pub fn disconnect(&mut self) {
        if self.state != NegotiationState::NoPolicy {
            tracing::debug!(session_id = %self.local_session, "Retention policy reset on disconnect");
        }
        self.state = NegotiationState::NoPolicy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: SessionId = SessionId::new(0xA);
    const BOB: SessionId = SessionId::new(0xB);

    fn pair() -> (RetentionNegotiator, RetentionNegotiator) {
        (RetentionNegotiator::new(ALICE, BOB), RetentionNegotiator::new(BOB, ALICE))
    }

    fn signal(actions: &[SessionAction]) -> SignalMessage {
        actions
            .iter()
            .find_map(|a| match a {
                SessionAction::SendSignal(s) => Some(s.clone()),
                _ => None,
            })
            .expect("expected a signal")
    }

    #[test]
    fn default_policy_does_not_persist() {
        let (alice, _) = pair();
        assert_eq!(alice.state(), NegotiationState::NoPolicy);
        assert!(!alice.policy().allows_persistence());
    }

    #[test]
    fn propose_and_accept() {
        let (mut alice, mut bob) = pair();

        let proposal = signal(&alice.propose(Lifetime::OneDay, 100));
        let actions = bob.handle_signal(&proposal, 101).unwrap();
        assert_eq!(
            actions,
            vec![SessionAction::Emit(SessionEvent::PolicyProposed {
                lifetime: Lifetime::OneDay,
                proposed_at: 100
            })]
        );
        assert!(!bob.policy().allows_persistence(), "pending policy must not persist");

        let accept = signal(&bob.accept(102).unwrap());
        let actions = alice.handle_signal(&accept, 103).unwrap();

        let expected =
            RetentionPolicy { lifetime: Lifetime::OneDay, proposed_at: 100, agreed_by_both: true };
        assert_eq!(actions, vec![SessionAction::Emit(SessionEvent::PolicyAgreed(expected))]);
        assert_eq!(alice.policy(), expected);
        assert_eq!(bob.policy(), expected);
        assert!(alice.policy().allows_persistence());
    }

    #[test]
    fn local_reject_returns_to_no_policy() {
        let (mut alice, mut bob) = pair();

        bob.handle_signal(&signal(&alice.propose(Lifetime::ThirtyDays, 10)), 11).unwrap();
        let reject = signal(&bob.reject(Some("too long".to_string())).unwrap());
        assert_eq!(bob.state(), NegotiationState::NoPolicy);

        let actions = alice.handle_signal(&reject, 12).unwrap();
        assert_eq!(alice.state(), NegotiationState::NoPolicy);
        assert_eq!(
            actions,
            vec![SessionAction::Emit(SessionEvent::PolicyRejected {
                reason: Some("too long".to_string()),
                by_peer: true
            })]
        );
    }

    #[test]
    fn do_not_persist_agreement_still_blocks_saves() {
        let (mut alice, mut bob) = pair();

        bob.handle_signal(&signal(&alice.propose(Lifetime::DoNotPersist, 5)), 5).unwrap();
        alice.handle_signal(&signal(&bob.accept(6).unwrap()), 6).unwrap();

        assert!(matches!(alice.state(), NegotiationState::Agreed(_)));
        assert!(!alice.policy().allows_persistence());
    }

    #[test]
    fn concurrent_proposals_later_wins() {
        let (mut alice, mut bob) = pair();

        let from_alice = signal(&alice.propose(Lifetime::OneDay, 100));
        let from_bob = signal(&bob.propose(Lifetime::SevenDays, 101));

        // Bob ignores the older proposal
        assert!(bob.handle_signal(&from_alice, 102).unwrap().is_empty());

        // Alice yields and accepts
        let accept = signal(&alice.handle_signal(&from_bob, 102).unwrap());
        bob.handle_signal(&accept, 103).unwrap();

        assert_eq!(alice.policy().lifetime, Lifetime::SevenDays);
        assert_eq!(bob.policy().lifetime, Lifetime::SevenDays);
    }

    #[test]
    fn tie_goes_to_longer_lifetime() {
        let (mut alice, mut bob) = pair();

        let from_alice = signal(&alice.propose(Lifetime::ThirtyDays, 50));
        let from_bob = signal(&bob.propose(Lifetime::OneHour, 50));

        let accept = signal(&bob.handle_signal(&from_alice, 51).unwrap());
        assert!(alice.handle_signal(&from_bob, 51).unwrap().is_empty());
        alice.handle_signal(&accept, 52).unwrap();

        assert_eq!(alice.policy().lifetime, Lifetime::ThirtyDays);
        assert_eq!(bob.policy().lifetime, Lifetime::ThirtyDays);
    }

    #[test]
    fn identical_proposals_agree_immediately() {
        let (mut alice, mut bob) = pair();

        let from_alice = signal(&alice.propose(Lifetime::OneDay, 70));
        let from_bob = signal(&bob.propose(Lifetime::OneDay, 70));

        let alice_accept = signal(&alice.handle_signal(&from_bob, 71).unwrap());
        let bob_accept = signal(&bob.handle_signal(&from_alice, 71).unwrap());

        // Crossed accepts are harmless echoes
        assert!(alice.handle_signal(&bob_accept, 72).unwrap().is_empty());
        assert!(bob.handle_signal(&alice_accept, 72).unwrap().is_empty());
        assert_eq!(alice.policy(), bob.policy());
    }

    #[test]
    fn counter_proposal_outranks_remote() {
        let (mut alice, mut bob) = pair();

        bob.handle_signal(&signal(&alice.propose(Lifetime::ThirtyDays, 200)), 150).unwrap();

        // Bob's clock lags; his counter-proposal is still ordered after Alice's
        let counter = signal(&bob.propose(Lifetime::OneDay, 150));
        let SignalMessage::LifetimeProposal { proposed_at, .. } = counter else {
            panic!("expected proposal");
        };
        assert_eq!(proposed_at, 201);

        let accept = signal(&alice.handle_signal(&counter, 202).unwrap());
        bob.handle_signal(&accept, 203).unwrap();
        assert_eq!(alice.policy().lifetime, Lifetime::OneDay);
        assert_eq!(bob.policy().lifetime, Lifetime::OneDay);
    }

    #[test]
    fn mismatched_accept_is_rejected_without_state_change() {
        let (mut alice, _) = pair();
        alice.propose(Lifetime::OneHour, 1);
        let before = alice.state();

        let bogus = SignalMessage::LifetimeAccept {
            session_id: BOB.to_string(),
            duration: Lifetime::ThirtyDays,
            accepted_at: 2,
        };

        assert_eq!(
            alice.handle_signal(&bogus, 2),
            Err(NegotiationError::AcceptMismatch {
                proposed: Lifetime::OneHour,
                accepted: Lifetime::ThirtyDays
            })
        );
        assert_eq!(alice.state(), before);
    }

    #[test]
    fn signals_from_other_sessions_are_rejected() {
        let (mut alice, _) = pair();
        let stranger = SignalMessage::LifetimeProposal {
            session_id: SessionId::new(0xC).to_string(),
            duration: Lifetime::OneDay,
            proposed_at: 1,
        };

        assert!(matches!(
            alice.handle_signal(&stranger, 1),
            Err(NegotiationError::SessionMismatch { .. })
        ));
        assert_eq!(alice.state(), NegotiationState::NoPolicy);
    }

    #[test]
    fn accept_without_proposal_is_an_error() {
        let (mut alice, _) = pair();
        assert!(matches!(alice.accept(1), Err(NegotiationError::NothingPending { .. })));
        assert!(matches!(alice.reject(None), Err(NegotiationError::NothingPending { .. })));
    }

    #[test]
    fn reproposal_from_agreed_pauses_persistence() {
        let (mut alice, mut bob) = pair();
        bob.handle_signal(&signal(&alice.propose(Lifetime::OneDay, 1)), 1).unwrap();
        alice.handle_signal(&signal(&bob.accept(2).unwrap()), 2).unwrap();

        alice.propose(Lifetime::OneHour, 3);

        assert!(matches!(alice.state(), NegotiationState::Pending { origin: Origin::Local, .. }));
        assert!(!alice.policy().allows_persistence());
    }

    #[test]
    fn disconnect_resets_to_no_policy() {
        let (mut alice, mut bob) = pair();
        bob.handle_signal(&signal(&alice.propose(Lifetime::SevenDays, 1)), 1).unwrap();
        alice.handle_signal(&signal(&bob.accept(2).unwrap()), 2).unwrap();

        alice.disconnect();

        assert_eq!(alice.state(), NegotiationState::NoPolicy);
        assert_eq!(alice.policy(), RetentionPolicy::DO_NOT_PERSIST);
    }

    #[test]
    fn key_exchange_signals_are_not_negotiation() {
        let (mut alice, _) = pair();
        let signal = SignalMessage::KeyExchangeComplete { session_id: BOB.to_string() };

        assert!(matches!(
            alice.handle_signal(&signal, 1),
            Err(NegotiationError::UnexpectedSignal { kind: "key_exchange_complete", .. })
        ));
    }
}
