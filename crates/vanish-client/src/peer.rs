//! Peer session: one connection attempt with one peer.
//!
//! Ties the key exchange session, the retention negotiator and the transport
//! gate together. Like the state machines it wraps, it does no I/O: the
//! caller feeds [`PeerEvent`]s and executes the returned [`PeerAction`]s.
//!
//! Signals are routed by type: key exchange signals go to the
//! [`ConnectionSession`], retention signals to the [`RetentionNegotiator`].
//! The negotiator exists only once the exchange has told us the peer's
//! session id.

use std::sync::Arc;

use vanish_core::{
    ConnectionSession, Lifetime, RetentionNegotiator, RetentionPolicy, SessionAction,
    SessionConfig, SessionEvent, SessionId, SessionState,
    env::Environment,
    keystore::{KeyStore, SecureBackend},
};
use vanish_proto::{SignalMessage, WireMessage};

use crate::{
    error::ClientError,
    gate::{ExchangeGate, GateWaiter},
};

/// Inputs to a [`PeerSession`].
///
/// Generic over `I` (Instant type) so tests can drive virtual time.
#[derive(Debug, Clone)]
pub enum PeerEvent<I = std::time::Instant> {
    /// Start the key exchange
    Connect,

    /// JSON message from the signaling channel
    SignalReceived(String),

    /// Bytes from the data transport
    TransportReceived(Vec<u8>),

    /// Application wants to send a message
    SendMessage(Vec<u8>),

    /// Propose a retention lifetime to the peer
    ProposeLifetime(Lifetime),

    /// Accept the peer's outstanding proposal
    AcceptLifetime,

    /// Reject the peer's outstanding proposal
    RejectLifetime {
        /// Optional reason shown to the peer
        reason: Option<String>,
    },

    /// Time tick for the exchange timeout
    Tick {
        /// Current time from the environment
        now: I,
    },

    /// Transport went away or the user left
    Disconnect {
        /// Why
        reason: String,
    },
}

/// Actions a [`PeerSession`] produces for the caller to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAction {
    /// Send JSON over the signaling channel
    SendSignal(String),

    /// Send bytes over the data transport
    SendTransport(Vec<u8>),

    /// Hand a decrypted message to the application
    Deliver {
        /// Sender's message counter
        counter: u64,
        /// Decrypted body
        plaintext: Vec<u8>,
    },

    /// Notify the session owner
    Event(SessionEvent),

    /// Close the data transport
    Close {
        /// Reason for closing
        reason: String,
    },
}

/// One connection attempt with one peer.
pub struct PeerSession<E: Environment, B: SecureBackend> {
    env: E,
    keystore: Arc<KeyStore<B>>,
    session: ConnectionSession<E::Instant>,
    negotiator: Option<RetentionNegotiator>,
    gate: ExchangeGate,
}

impl<E: Environment, B: SecureBackend> PeerSession<E, B> {
    /// Create a session with a fresh random id. The exchange timer starts now.
    pub fn new(env: E, keystore: Arc<KeyStore<B>>, config: SessionConfig) -> Self {
        let id = SessionId::random(&env);
        let session = ConnectionSession::new(id, env.now(), config);
        Self { env, keystore, session, negotiator: None, gate: ExchangeGate::new() }
    }

    /// This side's session id.
    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    /// Key exchange state.
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Handle for transport writers to wait on the exchange.
    pub fn gate(&self) -> GateWaiter {
        self.gate.waiter()
    }

    /// Policy to persist under. Do-not-persist until both peers agreed.
    pub fn policy(&self) -> RetentionPolicy {
        self.negotiator.as_ref().map_or(RetentionPolicy::DO_NOT_PERSIST, RetentionNegotiator::policy)
    }

    /// Process an event and return resulting actions.
    ///
    /// The exchange deadline is checked before every event, so a peer that
    /// keeps the command stream busy still fails closed on time.
    ///
    /// # Errors
    ///
    /// Errors never leave the session half-updated. Integrity failures on
    /// received messages are not errors: they produce a
    /// `MessageUnverifiable` event and a `Close`.
    pub fn handle(&mut self, event: PeerEvent<E::Instant>) -> Result<Vec<PeerAction>, ClientError> {
        if !matches!(event, PeerEvent::Tick { .. }) {
            let expired = self.session.handle_tick(&self.keystore, self.env.now());
            if !expired.is_empty() {
                return Ok(self.translate(expired));
            }
        }

        match event {
            PeerEvent::Connect => {
                let actions = self.session.begin_exchange(&self.keystore, &self.env)?;
                Ok(self.translate(actions))
            },
            PeerEvent::SignalReceived(json) => self.handle_signal(&json),
            PeerEvent::TransportReceived(bytes) => self.handle_transport(&bytes),
            PeerEvent::SendMessage(plaintext) => self.handle_send(&plaintext),
            PeerEvent::ProposeLifetime(lifetime) => {
                let now = self.env.wall_clock_secs();
                let actions = self.negotiator()?.propose(lifetime, now);
                Ok(self.translate(actions))
            },
            PeerEvent::AcceptLifetime => {
                let now = self.env.wall_clock_secs();
                let actions = self.negotiator()?.accept(now)?;
                Ok(self.translate(actions))
            },
            PeerEvent::RejectLifetime { reason } => {
                let actions = self.negotiator()?.reject(reason)?;
                Ok(self.translate(actions))
            },
            PeerEvent::Tick { now } => {
                let actions = self.session.handle_tick(&self.keystore, now);
                Ok(self.translate(actions))
            },
            PeerEvent::Disconnect { reason } => self.teardown(&reason),
        }
    }

    fn negotiator(&mut self) -> Result<&mut RetentionNegotiator, ClientError> {
        self.negotiator.as_mut().ok_or(ClientError::NotEstablished)
    }

    fn handle_signal(&mut self, json: &str) -> Result<Vec<PeerAction>, ClientError> {
        let signal = SignalMessage::decode(json)?;

        let actions = match signal {
            SignalMessage::KeyExchange { .. } | SignalMessage::KeyExchangeComplete { .. } => {
                match self.session.handle_signal(&self.keystore, &signal) {
                    Ok(actions) => actions,
                    Err(e) => {
                        if self.session.state() == SessionState::Failed {
                            self.gate.fail(&e.to_string());
                        }
                        return Err(e.into());
                    },
                }
            },
            SignalMessage::LifetimeProposal { .. }
            | SignalMessage::LifetimeAccept { .. }
            | SignalMessage::LifetimeReject { .. } => {
                let now = self.env.wall_clock_secs();
                self.negotiator()?.handle_signal(&signal, now)?
            },
        };

        Ok(self.translate(actions))
    }

    fn handle_transport(&mut self, bytes: &[u8]) -> Result<Vec<PeerAction>, ClientError> {
        let wire = WireMessage::decode(bytes)?;

        match self.session.decrypt(&wire) {
            Ok(plaintext) => Ok(vec![PeerAction::Deliver { counter: wire.counter, plaintext }]),
            Err(e) if e.is_unverifiable() => {
                let reason = "message failed verification";
                let mut actions = vec![PeerAction::Event(SessionEvent::MessageUnverifiable {
                    session_id: self.session.id(),
                })];

                // The transport closes even if the key wipe has to wait for
                // a later Disconnect.
                match self.teardown(reason) {
                    Ok(torn_down) => actions.extend(torn_down),
                    Err(wipe) => {
                        tracing::error!(
                            session_id = %self.session.id(),
                            error = %wipe,
                            "Failed to wipe keys after integrity failure"
                        );
                        actions.push(PeerAction::Close { reason: reason.to_string() });
                    },
                }
                Ok(actions)
            },
            Err(e) => Err(e.into()),
        }
    }

    fn handle_send(&mut self, plaintext: &[u8]) -> Result<Vec<PeerAction>, ClientError> {
        let wire = self.session.encrypt(plaintext, self.env.random_array())?;
        Ok(vec![PeerAction::SendTransport(wire.encode())])
    }

    fn teardown(&mut self, reason: &str) -> Result<Vec<PeerAction>, ClientError> {
        self.gate.fail(reason);
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.disconnect();
        }

        let actions = self.session.teardown(&self.keystore, reason)?;
        Ok(self.translate(actions))
    }

    /// Convert state machine actions, reacting to exchange milestones.
    fn translate(&mut self, actions: Vec<SessionAction>) -> Vec<PeerAction> {
        actions
            .into_iter()
            .map(|action| match action {
                SessionAction::SendSignal(signal) => PeerAction::SendSignal(signal.encode()),
                SessionAction::Emit(event) => {
                    self.observe(&event);
                    PeerAction::Event(event)
                },
                SessionAction::Close { reason } => PeerAction::Close { reason },
            })
            .collect()
    }

    fn observe(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::ExchangeCompleted { .. } => {
                if let Some(peer) = self.session.peer_session_id() {
                    self.negotiator = Some(RetentionNegotiator::new(self.session.id(), peer));
                }
                self.gate.open();
            },
            SessionEvent::ExchangeFailed { reason, .. }
            | SessionEvent::SessionTornDown { reason, .. } => self.gate.fail(reason),
            _ => {},
        }
    }
}
