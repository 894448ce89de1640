//! ChaCha20-Poly1305 sealing of transport messages and stored records.
//!
//! All functions are pure - nonces must be provided by the caller.
//!
//! Tags are detached: the wire carries ciphertext and tag as separate fields,
//! and stored records keep them in separate columns.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use vanish_proto::{NONCE_SIZE, TAG_SIZE, WIRE_VERSION, WireMessage};

use crate::{
    error::CryptoError,
    ratchet::{Direction, derive_message_key},
    secret::{KEY_SIZE, RootSecret},
};

/// Seal `plaintext` under `key`, returning ciphertext and detached tag.
///
/// # Security
///
/// - Caller MUST never reuse a nonce under the same key
pub fn seal_detached(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> (Vec<u8>, [u8; TAG_SIZE]) {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut buffer = plaintext.to_vec();

    let Ok(tag) = cipher.encrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut buffer)
    else {
        unreachable!("ChaCha20-Poly1305 encryption cannot fail below the length limit");
    };

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);
    (buffer, tag_bytes)
}

/// Open a detached-tag ciphertext.
///
/// # Errors
///
/// - `AuthenticationFailed` if the tag does not verify. No plaintext is
///   returned in that case.
pub fn open_detached(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut buffer = ciphertext.to_vec();

    cipher
        .decrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut buffer, Tag::from_slice(tag))
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    Ok(buffer)
}

/// Encrypt one transport message.
///
/// The message key is derived from `root`, `direction` and `counter`; version
/// and counter are authenticated as associated data.
pub fn encrypt(
    plaintext: &[u8],
    root: &RootSecret,
    counter: u64,
    direction: Direction,
    nonce: [u8; NONCE_SIZE],
) -> WireMessage {
    let key = derive_message_key(root, direction, counter);

    let mut wire = WireMessage {
        version: WIRE_VERSION,
        counter,
        nonce,
        ciphertext: Vec::new(),
        tag: [0u8; TAG_SIZE],
    };

    let (ciphertext, tag) = seal_detached(key.key(), &nonce, &wire.associated_data(), plaintext);
    wire.ciphertext = ciphertext;
    wire.tag = tag;
    wire
}

/// Decrypt one transport message without any counter bookkeeping.
///
/// Callers that receive from a live peer should go through
/// [`ReplayWindow::decrypt`] instead.
///
/// # Errors
///
/// - `UnsupportedVersion` if the wire version is not [`WIRE_VERSION`]
/// - `AuthenticationFailed` on any tampering, wrong root or wrong direction
pub fn open(
    wire: &WireMessage,
    root: &RootSecret,
    direction: Direction,
) -> Result<Vec<u8>, CryptoError> {
    if wire.version != WIRE_VERSION {
        return Err(CryptoError::UnsupportedVersion(wire.version));
    }

    let key = derive_message_key(root, direction, wire.counter);
    open_detached(key.key(), &wire.nonce, &wire.associated_data(), &wire.ciphertext, &wire.tag)
}

/// Per-direction receive window.
///
/// Tracks the highest accepted counter for each direction. Counters start at
/// 1, so a fresh window accepts anything in `1..max_gap`.
///
/// # Invariants
///
/// - `last_seen` only moves forward
/// - `last_seen` is advanced only after the tag verified
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    last_seen: [u64; 2],
    max_gap: u64,
}

impl ReplayWindow {
    /// Fresh window with nothing accepted.
    pub fn new(max_gap: u64) -> Self {
        Self { last_seen: [0; 2], max_gap }
    }

    /// Highest accepted counter for `direction` (0 if none).
    pub fn last_seen(&self, direction: Direction) -> u64 {
        self.last_seen[direction.index()]
    }

    /// Configured maximum forward jump.
    pub fn max_gap(&self) -> u64 {
        self.max_gap
    }

    /// Check `counter` against the window without changing it.
    ///
    /// # Errors
    ///
    /// - `ReplayDetected` if `counter <= last_seen`
    /// - `GapTooLarge` if `counter - last_seen >= max_gap`
    pub fn check(&self, direction: Direction, counter: u64) -> Result<(), CryptoError> {
        let last_seen = self.last_seen(direction);

        if counter <= last_seen {
            return Err(CryptoError::ReplayDetected { counter, last_seen });
        }

        if counter - last_seen >= self.max_gap {
            return Err(CryptoError::GapTooLarge { counter, last_seen, max_gap: self.max_gap });
        }

        Ok(())
    }

    /// Record `counter` as accepted.
    pub fn commit(&mut self, direction: Direction, counter: u64) {
        let slot = &mut self.last_seen[direction.index()];
        *slot = (*slot).max(counter);
    }

    /// Open `wire`, check its counter, then advance the window.
    ///
    /// The window is untouched on any error.
    pub fn decrypt(
        &mut self,
        wire: &WireMessage,
        root: &RootSecret,
        direction: Direction,
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = open(wire, root, direction)?;
        self.check(direction, wire.counter)?;
        self.commit(direction, wire.counter);
        Ok(plaintext)
    }
}
