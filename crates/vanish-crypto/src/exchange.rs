//! Ephemeral X25519 key agreement.
//!
//! One keypair per connection attempt. The root secret is
//! `HKDF-SHA256(salt = empty, ikm = X25519(local, peer), info = ROOT_CONTEXT)`;
//! no salt is needed because the ECDH output already carries full entropy.
//!
//! # Security
//!
//! - Every 32-byte string decodes to a point on Curve25519 or its twist, so
//!   "curve membership" reduces to rejecting low-order points. Those produce
//!   an all-zero shared secret, detected through
//!   [`SharedSecret::was_contributory`](x25519_dalek::SharedSecret::was_contributory).
//! - A peer that reflects our own public key is rejected: both sides would
//!   claim the same role and encrypt under the same direction keys.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    ratchet::Role,
    secret::{KEY_SIZE, RootSecret},
};

/// Versioned HKDF context for root secret derivation.
pub const ROOT_CONTEXT: &[u8] = b"vanish/root/v1";

pub use vanish_proto::signal::PUBLIC_KEY_SIZE;

/// An ephemeral X25519 keypair for one connection attempt.
///
/// The secret scalar is zeroized when the keypair is dropped.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Create a keypair from caller-provided random bytes.
    ///
    /// Callers MUST provide cryptographically secure randomness in production.
    pub fn from_random(mut random: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(random);
        zeroize::Zeroize::zeroize(&mut random);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a keypair from secret bytes read back from the key store.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array = <[u8; KEY_SIZE]>::try_from(bytes).map_err(|_| {
            CryptoError::InvalidKeyMaterial { expected: KEY_SIZE, actual: bytes.len() }
        })?;
        Ok(Self::from_random(array))
    }

    /// Public half, sent to the peer over signaling.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Secret scalar bytes for the key store.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Role this side plays against `peer_public`.
    ///
    /// The side with the lexicographically smaller public key is the
    /// initiator. Both peers compute the same answer without a round trip.
    pub fn role_against(&self, peer_public: &[u8; PUBLIC_KEY_SIZE]) -> Result<Role, CryptoError> {
        let local = self.public.as_bytes();
        match local.cmp(peer_public) {
            std::cmp::Ordering::Less => Ok(Role::Initiator),
            std::cmp::Ordering::Greater => Ok(Role::Responder),
            std::cmp::Ordering::Equal => {
                Err(CryptoError::InvalidPeerKey { reason: "peer reflected our public key" })
            },
        }
    }
}

/// Validate the length of a received public key.
pub fn parse_peer_key(bytes: &[u8]) -> Result<[u8; PUBLIC_KEY_SIZE], CryptoError> {
    <[u8; PUBLIC_KEY_SIZE]>::try_from(bytes)
        .map_err(|_| CryptoError::InvalidPeerKey { reason: "public key must be 32 bytes" })
}

/// Perform ECDH with the peer and derive the connection root secret.
///
/// # Errors
///
/// - `InvalidPeerKey` if the key is not 32 bytes, is a low-order point, or is
///   our own public key reflected back
pub fn derive_root_secret(
    keypair: &EphemeralKeyPair,
    peer_public: &[u8],
) -> Result<RootSecret, CryptoError> {
    let peer_bytes = parse_peer_key(peer_public)?;
    keypair.role_against(&peer_bytes)?;

    let shared = keypair.secret.diffie_hellman(&PublicKey::from(peer_bytes));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPeerKey { reason: "low-order curve point" });
    }

    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());

    let mut root = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(ROOT_CONTEXT, &mut root) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    Ok(RootSecret::from_bytes(root))
}
