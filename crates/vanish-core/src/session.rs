//! Key exchange session state machine.
//!
//! One [`ConnectionSession`] per connection attempt. Every reconnect gets a
//! fresh session id and a fresh ephemeral keypair. Uses the action pattern:
//! methods take time and collaborators as input and return actions for the
//! driver to execute, so the state machine does no I/O.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ begin_exchange ┌──────────────┐ peer key ┌─────────────┐
//! │ Init │───────────────>│ AwaitingPeer │─────────>│ Established │
//! └──────┘                └──────────────┘          └─────────────┘
//!    │ peer key (buffered)       │                         │
//!    │                           │ timeout / bad key       │ integrity failure
//!    ↓                           ↓                         ↓
//!                           ┌────────┐  teardown     ┌────────┐
//!                           │ Failed │──────────────>│ Closed │
//!                           └────────┘               └────────┘
//! ```
//!
//! # Security
//!
//! - The private key lives only in the key store; the in-memory keypair is
//!   dropped as soon as its secret has been written.
//! - The peer public key is held in memory only and never persisted.
//! - Every failure path wipes this session's key store entries.

use std::{
    fmt,
    ops::Sub,
    str::FromStr,
    time::{Duration, Instant},
};

use vanish_crypto::{
    CryptoError, DEFAULT_MAX_GAP, EphemeralKeyPair, MessageRatchet, Role, derive_root_secret,
    exchange::{PUBLIC_KEY_SIZE, parse_peer_key},
};
use vanish_proto::{NONCE_SIZE, SignalMessage, WireMessage, signal::decode_public_key};

use crate::{
    env::Environment,
    error::SessionError,
    event::{SessionAction, SessionEvent},
    keystore::{KeyKind, KeyOwner, KeyStore, SecureBackend},
};

/// Time allowed for both public keys to be exchanged.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque 128-bit identifier of one connection attempt.
///
/// Rendered as 32 lowercase hex characters on the signaling channel and in
/// logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u128);

impl SessionId {
    /// Wrap a raw id.
    pub const fn new(id: u128) -> Self {
        Self(id)
    }

    /// Fresh random id from the environment.
    pub fn random<E: Environment>(env: &E) -> Self {
        Self(env.random_u128())
    }

    /// Raw value.
    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SessionError::InvalidSessionId(s.to_string()));
        }
        u128::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| SessionError::InvalidSessionId(s.to_string()))
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no keypair yet
    Init,
    /// Local public key sent, waiting for the peer's
    AwaitingPeer,
    /// Root secret derived, transport may carry messages
    Established,
    /// Exchange or integrity failure; keys wiped, awaiting teardown
    Failed,
    /// Torn down
    Closed,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for the key exchange, measured from session creation
    pub exchange_timeout: Duration,
    /// Largest accepted forward jump in receive counters
    pub max_gap: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT, max_gap: DEFAULT_MAX_GAP }
    }
}

/// Key exchange and message cipher for one connection attempt.
///
/// Generic over `Instant` to support both real time and virtual time for
/// deterministic testing.
pub struct ConnectionSession<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    id: SessionId,
    state: SessionState,
    config: SessionConfig,
    started_at: I,
    local_public: Option<[u8; PUBLIC_KEY_SIZE]>,
    /// Memory only. Buffered here if it arrives before `begin_exchange`.
    peer_public: Option<[u8; PUBLIC_KEY_SIZE]>,
    /// Learned from the peer's `key_exchange`; later signals must match.
    peer_session: Option<SessionId>,
    ratchet: Option<MessageRatchet>,
}

impl<I> ConnectionSession<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a session in [`SessionState::Init`]. The exchange timer starts
    /// now.
    pub fn new(id: SessionId, now: I, config: SessionConfig) -> Self {
        Self {
            id,
            state: SessionState::Init,
            config,
            started_at: now,
            local_public: None,
            peer_public: None,
            peer_session: None,
            ratchet: None,
        }
    }

    /// This session's id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether messages can be encrypted and decrypted.
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Role decided at exchange completion. `None` before that.
    pub fn role(&self) -> Option<Role> {
        self.ratchet.as_ref().map(MessageRatchet::role)
    }

    /// Local public key. `None` before `begin_exchange`.
    pub fn local_public_key(&self) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        self.local_public
    }

    /// Peer's session id, once its `key_exchange` arrived.
    pub fn peer_session_id(&self) -> Option<SessionId> {
        self.peer_session
    }

    /// Messages sent so far.
    pub fn messages_sent(&self) -> u64 {
        self.ratchet.as_ref().map_or(0, MessageRatchet::sent)
    }

    /// Highest counter accepted from the peer.
    pub fn last_received(&self) -> u64 {
        self.ratchet.as_ref().map_or(0, MessageRatchet::last_received)
    }

    /// Configured exchange deadline.
    pub fn exchange_timeout(&self) -> Duration {
        self.config.exchange_timeout
    }

    /// Generate the ephemeral keypair and announce the public half.
    ///
    /// The private half goes straight into the key store. If the peer's key
    /// was buffered earlier, the exchange completes immediately.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if not in Init state
    /// - `KeyStore` if the private key cannot be stored (session stays Init)
    pub fn begin_exchange<B, E>(
        &mut self,
        keystore: &KeyStore<B>,
        env: &E,
    ) -> Result<Vec<SessionAction>, SessionError>
    where
        B: SecureBackend,
        E: Environment,
    {
        if self.state != SessionState::Init {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "begin_exchange",
            });
        }

        let keypair = EphemeralKeyPair::from_random(env.random_array());
        keystore.put(&keypair.secret_bytes()[..], KeyKind::EphemeralPrivate, self.owner())?;

        let public = keypair.public_bytes();
        drop(keypair);

        self.local_public = Some(public);
        self.state = SessionState::AwaitingPeer;

        tracing::debug!(session_id = %self.id, "Generated ephemeral keypair");

        let mut actions =
            vec![SessionAction::SendSignal(SignalMessage::key_exchange(self.id.to_string(), &public))];

        if let Some(peer) = self.peer_public.take() {
            tracing::debug!(session_id = %self.id, "Consuming buffered peer key");
            actions.extend(self.complete_exchange(keystore, &peer)?);
        }

        Ok(actions)
    }

    /// Process a key exchange signal from the peer.
    ///
    /// # Errors
    ///
    /// - `InvalidSessionId` / `SessionMismatch` for malformed or stale
    ///   signals (state unchanged)
    /// - Any error from [`ConnectionSession::handle_peer_key`]
    pub fn handle_signal<B: SecureBackend>(
        &mut self,
        keystore: &KeyStore<B>,
        signal: &SignalMessage,
    ) -> Result<Vec<SessionAction>, SessionError> {
        match signal {
            SignalMessage::KeyExchange { public_key, session_id } => {
                let peer_session = self.check_peer_session(session_id, true)?;
                let bytes = match decode_public_key(public_key) {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        let err = SessionError::Crypto(CryptoError::InvalidPeerKey {
                            reason: "public key is not base64",
                        });
                        self.fail(keystore, &err);
                        return Err(err);
                    },
                };

                self.peer_session = Some(peer_session);
                self.handle_peer_key(keystore, &bytes)
            },
            SignalMessage::KeyExchangeComplete { session_id } => {
                self.check_peer_session(session_id, false)?;
                tracing::debug!(session_id = %self.id, "Peer confirmed key exchange");
                Ok(Vec::new())
            },
            _ => Err(SessionError::InvalidState { state: self.state, operation: "handle_signal" }),
        }
    }

    fn check_peer_session(
        &self,
        session_id: &str,
        first_contact: bool,
    ) -> Result<SessionId, SessionError> {
        let incoming: SessionId = session_id.parse()?;
        match self.peer_session {
            Some(known) if known != incoming => Err(SessionError::SessionMismatch {
                expected: known.to_string(),
                got: incoming.to_string(),
            }),
            None if !first_contact => Err(SessionError::InvalidState {
                state: self.state,
                operation: "confirm exchange before peer key",
            }),
            _ => Ok(incoming),
        }
    }

    /// Accept the peer's raw public key.
    ///
    /// Buffered in Init, completes the exchange in AwaitingPeer, ignored if it
    /// repeats the key already in use.
    ///
    /// # Errors
    ///
    /// - `Crypto(InvalidPeerKey)` if the key has the wrong length (session
    ///   fails)
    /// - `InvalidState` in Failed/Closed, or for a different key once
    ///   Established
    pub fn handle_peer_key<B: SecureBackend>(
        &mut self,
        keystore: &KeyStore<B>,
        peer_public: &[u8],
    ) -> Result<Vec<SessionAction>, SessionError> {
        match self.state {
            SessionState::Init => match parse_peer_key(peer_public) {
                Ok(peer) => {
                    self.peer_public = Some(peer);
                    tracing::debug!(session_id = %self.id, "Buffered early peer key");
                    Ok(Vec::new())
                },
                Err(e) => {
                    let err = SessionError::Crypto(e);
                    self.fail(keystore, &err);
                    Err(err)
                },
            },
            SessionState::AwaitingPeer => self.complete_exchange(keystore, peer_public),
            SessionState::Established
                if self.peer_public.as_ref().is_some_and(|known| known[..] == *peer_public) =>
            {
                Ok(Vec::new())
            },
            state => Err(SessionError::InvalidState { state, operation: "handle_peer_key" }),
        }
    }

    /// Derive the root secret from the stored private key and the peer key.
    ///
    /// On success the root secret is stored, the ratchet is armed, and the
    /// peer is told the exchange completed. On any failure the session fails
    /// closed: key store entries are wiped and no root secret is retained.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if not in AwaitingPeer
    /// - `Crypto(InvalidPeerKey)` for wrong length, low-order or reflected keys
    /// - `PrivateKeyMissing` if the key store lost the private key
    pub fn complete_exchange<B: SecureBackend>(
        &mut self,
        keystore: &KeyStore<B>,
        peer_public: &[u8],
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.state != SessionState::AwaitingPeer {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "complete_exchange",
            });
        }

        let (ratchet, peer) = match self.derive_ratchet(keystore, peer_public) {
            Ok(derived) => derived,
            Err(e) => {
                self.fail(keystore, &e);
                return Err(e);
            },
        };

        let role = ratchet.role();
        self.ratchet = Some(ratchet);
        self.peer_public = Some(peer);
        self.state = SessionState::Established;

        tracing::info!(session_id = %self.id, ?role, "Key exchange completed");

        Ok(vec![
            SessionAction::SendSignal(SignalMessage::KeyExchangeComplete {
                session_id: self.id.to_string(),
            }),
            SessionAction::Emit(SessionEvent::ExchangeCompleted { session_id: self.id, role }),
        ])
    }

    fn derive_ratchet<B: SecureBackend>(
        &self,
        keystore: &KeyStore<B>,
        peer_public: &[u8],
    ) -> Result<(MessageRatchet, [u8; PUBLIC_KEY_SIZE]), SessionError> {
        let peer = parse_peer_key(peer_public)?;

        let Some(secret) = keystore.get(KeyKind::EphemeralPrivate, self.owner())? else {
            return Err(SessionError::PrivateKeyMissing { session_id: self.id.to_string() });
        };

        let keypair = EphemeralKeyPair::from_secret_bytes(&secret)?;
        let role = keypair.role_against(&peer)?;
        let root = derive_root_secret(&keypair, &peer)?;

        keystore.put(root.expose(), KeyKind::RootSecret, self.owner())?;

        Ok((MessageRatchet::new(root, role, self.config.max_gap), peer))
    }

    /// Elapsed time since creation, if the exchange deadline passed.
    #[must_use]
    pub fn check_timeout(&self, now: I) -> Option<Duration> {
        match self.state {
            SessionState::Init | SessionState::AwaitingPeer => {
                let elapsed = now - self.started_at;
                (elapsed > self.config.exchange_timeout).then_some(elapsed)
            },
            _ => None,
        }
    }

    /// Process periodic maintenance.
    ///
    /// Fails the session closed if the exchange deadline passed.
    pub fn handle_tick<B: SecureBackend>(
        &mut self,
        keystore: &KeyStore<B>,
        now: I,
    ) -> Vec<SessionAction> {
        let Some(elapsed) = self.check_timeout(now) else {
            return Vec::new();
        };

        let err = SessionError::ExchangeTimeout { elapsed };
        self.fail(keystore, &err);

        let reason = err.to_string();
        vec![
            SessionAction::Emit(SessionEvent::ExchangeFailed {
                session_id: self.id,
                reason: reason.clone(),
            }),
            SessionAction::Close { reason },
        ]
    }

    /// Seal an outgoing message.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if not Established
    /// - `Crypto(CounterExhausted)` (session fails)
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        nonce: [u8; NONCE_SIZE],
    ) -> Result<WireMessage, SessionError> {
        let ratchet = self.established_ratchet("encrypt")?;
        let result = ratchet.encrypt(plaintext, nonce);

        result.map_err(|e| {
            if e.is_session_fatal() {
                self.state = SessionState::Failed;
            }
            e.into()
        })
    }

    /// Open an incoming message.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if not Established
    /// - `Crypto(AuthenticationFailed | ReplayDetected | GapTooLarge |
    ///   UnsupportedVersion)`; the session is marked Failed and must be torn
    ///   down
    pub fn decrypt(&mut self, wire: &WireMessage) -> Result<Vec<u8>, SessionError> {
        let ratchet = self.established_ratchet("decrypt")?;
        let result = ratchet.decrypt(wire);

        result.map_err(|e| {
            if e.is_session_fatal() {
                tracing::error!(
                    session_id = %self.id,
                    counter = wire.counter,
                    error = %e,
                    "Rejected message, session no longer trusted"
                );
                self.state = SessionState::Failed;
            }
            e.into()
        })
    }

    fn established_ratchet(
        &mut self,
        operation: &'static str,
    ) -> Result<&mut MessageRatchet, SessionError> {
        match (self.state, self.ratchet.as_mut()) {
            (SessionState::Established, Some(ratchet)) => Ok(ratchet),
            (state, _) => Err(SessionError::InvalidState { state, operation }),
        }
    }

    /// Wipe all key material and close.
    ///
    /// Idempotent. If the key store delete fails the in-memory secrets are
    /// still dropped and the session stays open for a retry.
    ///
    /// # Errors
    ///
    /// - `KeyStore` if deleting the stored keys failed after retries
    pub fn teardown<B: SecureBackend>(
        &mut self,
        keystore: &KeyStore<B>,
        reason: &str,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.state == SessionState::Closed {
            return Ok(Vec::new());
        }

        self.ratchet = None;
        self.peer_public = None;

        keystore.delete_all(self.id)?;
        self.state = SessionState::Closed;

        tracing::info!(session_id = %self.id, reason, "Session torn down");

        Ok(vec![
            SessionAction::Emit(SessionEvent::SessionTornDown {
                session_id: self.id,
                reason: reason.to_string(),
            }),
            SessionAction::Close { reason: reason.to_string() },
        ])
    }

    fn fail<B: SecureBackend>(&mut self, keystore: &KeyStore<B>, error: &SessionError) {
        self.state = SessionState::Failed;
        self.ratchet = None;
        self.peer_public = None;

        if let Err(e) = keystore.delete_all(self.id) {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to wipe keys of failed session");
        }

        tracing::warn!(session_id = %self.id, error = %error, "Key exchange failed");
    }

    fn owner(&self) -> KeyOwner {
        KeyOwner::Session(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryBackend;

    #[derive(Clone)]
    struct TestEnv {
        fill: u8,
    }

    impl Environment for TestEnv {
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
            buffer.fill(self.fill);
        }
    }

    struct Peer {
        session: ConnectionSession,
        keystore: KeyStore<MemoryBackend>,
        env: TestEnv,
    }

    fn peer(id: u128, fill: u8, t0: Instant) -> Peer {
        Peer {
            session: ConnectionSession::new(SessionId::new(id), t0, SessionConfig::default()),
            keystore: KeyStore::new(MemoryBackend::new()),
            env: TestEnv { fill },
        }
    }

    fn signals(actions: &[SessionAction]) -> Vec<SignalMessage> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::SendSignal(signal) => Some(signal.clone()),
                _ => None,
            })
            .collect()
    }

    fn key_exchange_signal(actions: &[SessionAction]) -> SignalMessage {
        signals(actions)
            .into_iter()
            .find(|s| matches!(s, SignalMessage::KeyExchange { .. }))
            .expect("key_exchange signal")
    }

    fn established_pair() -> (Peer, Peer) {
        let t0 = Instant::now();
        let mut alice = peer(1, 1, t0);
        let mut bob = peer(2, 2, t0);

        let from_alice = alice.session.begin_exchange(&alice.keystore, &alice.env).unwrap();
        let from_bob = bob.session.begin_exchange(&bob.keystore, &bob.env).unwrap();

        bob.session.handle_signal(&bob.keystore, &key_exchange_signal(&from_alice)).unwrap();
        alice.session.handle_signal(&alice.keystore, &key_exchange_signal(&from_bob)).unwrap();

        (alice, bob)
    }

    #[test]
    fn exchange_lifecycle() {
        let t0 = Instant::now();
        let mut alice = peer(1, 1, t0);
        let mut bob = peer(2, 2, t0);

        assert_eq!(alice.session.state(), SessionState::Init);

        let from_alice = alice.session.begin_exchange(&alice.keystore, &alice.env).unwrap();
        assert_eq!(alice.session.state(), SessionState::AwaitingPeer);
        assert_eq!(from_alice.len(), 1);
        assert!(
            alice
                .keystore
                .get(KeyKind::EphemeralPrivate, SessionId::new(1).into())
                .unwrap()
                .is_some()
        );

        let from_bob = bob.session.begin_exchange(&bob.keystore, &bob.env).unwrap();
        let completed =
            bob.session.handle_signal(&bob.keystore, &key_exchange_signal(&from_alice)).unwrap();
        assert_eq!(bob.session.state(), SessionState::Established);
        assert!(matches!(
            completed[0],
            SessionAction::SendSignal(SignalMessage::KeyExchangeComplete { .. })
        ));
        assert!(matches!(completed[1], SessionAction::Emit(SessionEvent::ExchangeCompleted { .. })));

        alice.session.handle_signal(&alice.keystore, &key_exchange_signal(&from_bob)).unwrap();
        assert!(alice.session.is_established());
        assert_ne!(alice.session.role(), bob.session.role());

        // Root secret stored alongside the private key
        assert!(
            alice.keystore.get(KeyKind::RootSecret, SessionId::new(1).into()).unwrap().is_some()
        );

        // Peer confirmation
        let confirm = signals(&completed)[0].clone();
        assert!(alice.session.handle_signal(&alice.keystore, &confirm).unwrap().is_empty());
        assert!(alice.session.is_established());
    }

    #[test]
    fn messages_flow_both_ways() {
        let (mut alice, mut bob) = established_pair();

        let wire = alice.session.encrypt(b"hello bob", [1; NONCE_SIZE]).unwrap();
        assert_eq!(bob.session.decrypt(&wire).unwrap(), b"hello bob");

        let reply = bob.session.encrypt(b"hello alice", [2; NONCE_SIZE]).unwrap();
        assert_eq!(alice.session.decrypt(&reply).unwrap(), b"hello alice");

        assert_eq!(alice.session.messages_sent(), 1);
        assert_eq!(alice.session.last_received(), 1);
    }

    #[test]
    fn early_peer_key_is_buffered() {
        let t0 = Instant::now();
        let mut alice = peer(1, 1, t0);
        let mut bob = peer(2, 2, t0);

        let from_bob = bob.session.begin_exchange(&bob.keystore, &bob.env).unwrap();

        // Bob's key reaches Alice before she generated her own
        let buffered =
            alice.session.handle_signal(&alice.keystore, &key_exchange_signal(&from_bob)).unwrap();
        assert!(buffered.is_empty());
        assert_eq!(alice.session.state(), SessionState::Init);

        let actions = alice.session.begin_exchange(&alice.keystore, &alice.env).unwrap();
        assert!(alice.session.is_established());
        assert_eq!(signals(&actions).len(), 2);

        bob.session.handle_signal(&bob.keystore, &key_exchange_signal(&actions)).unwrap();

        let wire = bob.session.encrypt(b"ping", [0; NONCE_SIZE]).unwrap();
        assert_eq!(alice.session.decrypt(&wire).unwrap(), b"ping");
    }

    #[test]
    fn low_order_key_fails_closed() {
        let t0 = Instant::now();
        let mut alice = peer(1, 1, t0);
        alice.session.begin_exchange(&alice.keystore, &alice.env).unwrap();

        let result = alice.session.complete_exchange(&alice.keystore, &[0u8; PUBLIC_KEY_SIZE]);

        assert!(matches!(
            result,
            Err(SessionError::Crypto(CryptoError::InvalidPeerKey { .. }))
        ));
        assert_eq!(alice.session.state(), SessionState::Failed);
        assert!(alice.keystore.backend().is_empty(), "failed exchange must wipe keys");
        assert!(alice.session.encrypt(b"x", [0; NONCE_SIZE]).is_err());
    }

    #[test]
    fn short_key_fails_even_before_begin() {
        let t0 = Instant::now();
        let mut alice = peer(1, 1, t0);

        let result = alice.session.handle_peer_key(&alice.keystore, &[1u8; 31]);

        assert!(result.is_err());
        assert_eq!(alice.session.state(), SessionState::Failed);
    }

    #[test]
    fn missing_private_key_fails_session() {
        let t0 = Instant::now();
        let mut alice = peer(1, 1, t0);
        let bob = EphemeralKeyPair::from_random([2; 32]);

        alice.session.begin_exchange(&alice.keystore, &alice.env).unwrap();
        alice.keystore.delete_all(SessionId::new(1)).unwrap();

        let result = alice.session.complete_exchange(&alice.keystore, &bob.public_bytes());

        assert!(matches!(result, Err(SessionError::PrivateKeyMissing { .. })));
        assert_eq!(alice.session.state(), SessionState::Failed);
    }

    #[test]
    fn exchange_timeout_fails_closed() {
        let t0 = Instant::now();
        let mut alice = peer(1, 1, t0);
        alice.session.begin_exchange(&alice.keystore, &alice.env).unwrap();

        assert!(alice.session.handle_tick(&alice.keystore, t0 + Duration::from_secs(5)).is_empty());

        let actions = alice.session.handle_tick(&alice.keystore, t0 + Duration::from_secs(11));

        assert_eq!(alice.session.state(), SessionState::Failed);
        assert!(matches!(actions[0], SessionAction::Emit(SessionEvent::ExchangeFailed { .. })));
        assert!(matches!(actions[1], SessionAction::Close { .. }));
        assert!(alice.keystore.backend().is_empty());

        // The late peer key can no longer complete anything
        let late = EphemeralKeyPair::from_random([2; 32]);
        assert!(alice.session.handle_peer_key(&alice.keystore, &late.public_bytes()).is_err());
    }

    #[test]
    fn established_session_never_times_out() {
        let (mut alice, _bob) = established_pair();
        let later = Instant::now() + Duration::from_secs(3600);
        assert!(alice.session.handle_tick(&alice.keystore, later).is_empty());
        assert!(alice.session.is_established());
    }

    #[test]
    fn tampered_message_fails_session() {
        let (mut alice, mut bob) = established_pair();

        let mut wire = alice.session.encrypt(b"secret", [1; NONCE_SIZE]).unwrap();
        wire.ciphertext[0] ^= 0x01;

        let err = bob.session.decrypt(&wire).unwrap_err();
        assert!(err.is_unverifiable());
        assert!(err.is_session_fatal());
        assert_eq!(bob.session.state(), SessionState::Failed);
    }

    #[test]
    fn replayed_message_fails_session() {
        let (mut alice, mut bob) = established_pair();

        let wire = alice.session.encrypt(b"once", [1; NONCE_SIZE]).unwrap();
        bob.session.decrypt(&wire).unwrap();

        let err = bob.session.decrypt(&wire).unwrap_err();
        assert_eq!(err, SessionError::Crypto(CryptoError::ReplayDetected { counter: 1, last_seen: 1 }));
        assert_eq!(bob.session.state(), SessionState::Failed);
    }

    #[test]
    fn gap_too_large_fails_session() {
        let (mut alice, mut bob) = established_pair();

        // Sealed by the real sender, so the tag verifies; only the jump is wrong
        let first = alice.session.encrypt(b"first", [1; NONCE_SIZE]).unwrap();
        for _ in 1..DEFAULT_MAX_GAP {
            alice.session.encrypt(b"dropped", [1; NONCE_SIZE]).unwrap();
        }
        let too_far = alice.session.encrypt(b"too far", [1; NONCE_SIZE]).unwrap();
        assert_eq!(too_far.counter, DEFAULT_MAX_GAP + 1);

        let err = bob.session.decrypt(&too_far).unwrap_err();
        assert_eq!(
            err,
            SessionError::Crypto(CryptoError::GapTooLarge {
                counter: DEFAULT_MAX_GAP + 1,
                last_seen: 0,
                max_gap: DEFAULT_MAX_GAP,
            })
        );
        assert!(err.is_unverifiable());
        assert_eq!(bob.session.state(), SessionState::Failed);

        // Nothing opens on a failed session, not even the next valid message
        assert!(matches!(
            bob.session.decrypt(&first),
            Err(SessionError::InvalidState { state: SessionState::Failed, .. })
        ));
    }

    #[test]
    fn teardown_wipes_keys_and_is_idempotent() {
        let (mut alice, _bob) = established_pair();

        let actions = alice.session.teardown(&alice.keystore, "peer disconnected").unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(alice.session.state(), SessionState::Closed);
        assert!(alice.keystore.backend().is_empty());
        assert_eq!(alice.session.role(), None);

        assert!(alice.session.teardown(&alice.keystore, "again").unwrap().is_empty());
    }

    #[test]
    fn encrypt_before_exchange_is_rejected() {
        let t0 = Instant::now();
        let mut alice = peer(1, 1, t0);

        let result = alice.session.encrypt(b"too early", [0; NONCE_SIZE]);

        assert!(matches!(result, Err(SessionError::InvalidState { operation: "encrypt", .. })));
        assert_eq!(alice.session.state(), SessionState::Init);
    }

    #[test]
    fn begin_twice_is_rejected() {
        let t0 = Instant::now();
        let mut alice = peer(1, 1, t0);
        alice.session.begin_exchange(&alice.keystore, &alice.env).unwrap();

        assert!(matches!(
            alice.session.begin_exchange(&alice.keystore, &alice.env),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn signal_from_other_attempt_is_rejected() {
        let (mut alice, _bob) = established_pair();
        let stranger = EphemeralKeyPair::from_random([9; 32]);
        let stale = SignalMessage::key_exchange(SessionId::new(99).to_string(), &stranger.public_bytes());

        let result = alice.session.handle_signal(&alice.keystore, &stale);

        assert!(matches!(result, Err(SessionError::SessionMismatch { .. })));
        assert!(alice.session.is_established());
    }

    #[test]
    fn duplicate_key_exchange_is_ignored() {
        let t0 = Instant::now();
        let mut alice = peer(1, 1, t0);
        let mut bob = peer(2, 2, t0);

        let from_alice = alice.session.begin_exchange(&alice.keystore, &alice.env).unwrap();
        bob.session.begin_exchange(&bob.keystore, &bob.env).unwrap();

        let signal = key_exchange_signal(&from_alice);
        bob.session.handle_signal(&bob.keystore, &signal).unwrap();
        assert!(bob.session.handle_signal(&bob.keystore, &signal).unwrap().is_empty());
        assert!(bob.session.is_established());
    }

    #[test]
    fn session_id_round_trips_as_hex() {
        let id = SessionId::new(0x0123_4567_89ab_cdef_0011_2233_4455_6677);
        let text = id.to_string();

        assert_eq!(text, "0123456789abcdef0011223344556677");
        assert_eq!(text.parse::<SessionId>().unwrap(), id);
    }

    #[test]
    fn malformed_session_ids_are_rejected() {
        for bad in ["", "abc", "+123456789abcdef0011223344556677", "zz23456789abcdef0011223344556677"]
        {
            assert!(bad.parse::<SessionId>().is_err(), "{bad:?} must not parse");
        }
    }
}
