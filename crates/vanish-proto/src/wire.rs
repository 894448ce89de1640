//! Encrypted message format for the peer-to-peer data transport.
//!
//! # Layout
//!
//! ```text
//! {"v": 1, "c": 42, "n": "<base64 12B>", "d": "<base64 ciphertext>", "t": "<base64 16B>"}
//! ```
//!
//! The version and counter are bound into the AEAD associated data (see
//! [`WireMessage::associated_data`]), so a relay cannot rewrite them without
//! failing authentication.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// ChaCha20-Poly1305 nonce size (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size (128 bits).
pub const TAG_SIZE: usize = 16;

/// Largest encoded wire message accepted from the transport (1 MiB).
pub const MAX_WIRE_SIZE: usize = 1 << 20;

/// A sealed message as carried by the data transport.
///
/// # Invariants
///
/// - `counter` is strictly increasing per direction and never reused
/// - `nonce` is fresh randomness per message
/// - `tag` authenticates `ciphertext` together with `version` and `counter`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Format version
    pub version: u8,
    /// Per-direction message counter, starting at 1
    pub counter: u64,
    /// Random 96-bit nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext without the tag
    pub ciphertext: Vec<u8>,
    /// Detached 128-bit authentication tag
    pub tag: [u8; TAG_SIZE],
}

/// Serialized shape with single-letter keys and base64 byte fields.
#[derive(Serialize, Deserialize)]
struct WireRepr {
    v: u8,
    c: u64,
    n: String,
    d: String,
    t: String,
}

impl WireMessage {
    /// Associated data authenticated alongside the ciphertext.
    ///
    /// Layout: `[version: 1][counter: 8 BE]`
    pub fn associated_data(&self) -> [u8; 9] {
        let mut aad = [0u8; 9];
        aad[0] = self.version;
        aad[1..].copy_from_slice(&self.counter.to_be_bytes());
        aad
    }

    /// Encode for the transport.
    pub fn encode(&self) -> Vec<u8> {
        let repr = WireRepr {
            v: self.version,
            c: self.counter,
            n: BASE64.encode(self.nonce),
            d: BASE64.encode(&self.ciphertext),
            t: BASE64.encode(self.tag),
        };

        let Ok(bytes) = serde_json::to_vec(&repr) else {
            unreachable!("wire repr contains only integers and strings");
        };
        bytes
    }

    /// Decode bytes received from the transport.
    ///
    /// Validates structure and field lengths only. Version checks and
    /// authentication happen when the message is opened.
    ///
    /// # Errors
    ///
    /// - `MessageTooLarge` if the input exceeds [`MAX_WIRE_SIZE`]
    /// - `MalformedWire` if the bytes are not a wire object
    /// - `InvalidBase64` / `InvalidLength` for bad byte fields
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_WIRE_SIZE {
            return Err(ProtocolError::MessageTooLarge { size: bytes.len(), max: MAX_WIRE_SIZE });
        }

        let repr: WireRepr =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedWire(e.to_string()))?;

        Ok(Self {
            version: repr.v,
            counter: repr.c,
            nonce: decode_fixed(&repr.n, "n")?,
            ciphertext: BASE64
                .decode(&repr.d)
                .map_err(|_| ProtocolError::InvalidBase64 { field: "d" })?,
            tag: decode_fixed(&repr.t, "t")?,
        })
    }
}

/// Decode a base64 field that must be exactly `N` bytes.
fn decode_fixed<const N: usize>(encoded: &str, field: &'static str) -> Result<[u8; N]> {
    let bytes = BASE64.decode(encoded).map_err(|_| ProtocolError::InvalidBase64 { field })?;

    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| ProtocolError::InvalidLength {
        field,
        expected: N,
        actual: bytes.len(),
    })
}
