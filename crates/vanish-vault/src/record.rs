//! Persisted record types.
//!
//! Message and room records are JSON with camelCase keys and base64 byte
//! fields, so they stay readable by other clients of the same store. Vault
//! metadata is CBOR.
//!
//! # Record keys
//!
//! ```text
//! [generation: u32 BE][room_len: u32 BE][room_id bytes][message_id bytes]
//! ```
//!
//! Generation first so a whole generation can be scanned or dropped as one
//! range, then room so a room is a contiguous prefix. The same bytes are the
//! AEAD associated data, binding each ciphertext to its location.

use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use vanish_crypto::{KdfParams, SALT_SIZE};
use vanish_proto::{Lifetime, NONCE_SIZE, TAG_SIZE};

/// Current [`VaultMeta`] format.
pub const META_FORMAT: u8 = 1;

/// Label prepended to the record key to form the associated data.
const RECORD_AAD_LABEL: &[u8] = b"vanish/record/v1";

/// One encrypted message at rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Message id, unique within the room
    pub id: String,
    /// Logical room; survives reconnects
    pub room_id: String,
    /// ChaCha20-Poly1305 ciphertext
    #[serde(with = "base64_bytes")]
    pub encrypted_content: Vec<u8>,
    /// Random per-record nonce
    #[serde(with = "base64_array")]
    pub nonce: [u8; NONCE_SIZE],
    /// Detached authentication tag
    #[serde(with = "base64_array")]
    pub tag: [u8; TAG_SIZE],
    /// Send time, unix seconds
    pub timestamp: f64,
    /// Sent by this device
    pub is_from_self: bool,
    /// Deletion deadline, unix seconds. Fixed at save time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<f64>,
    /// Master key generation the record is sealed under
    pub key_generation: u32,
}

impl StoredMessage {
    /// Storage key of this record.
    pub fn key(&self) -> Vec<u8> {
        encode_record_key(self.key_generation, &self.room_id, &self.id)
    }

    /// Whether the record is due for deletion at `now`.
    pub fn is_expired(&self, now: f64) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Per-room config record.
///
/// Informational only: a reconnect always negotiates from scratch, this never
/// restores negotiation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPolicyRecord {
    /// Logical room
    pub room_id: String,
    /// Last agreed lifetime
    pub policy_value: Lifetime,
    /// Unix seconds of agreement
    pub agreed_at: u64,
    /// Both peers confirmed it
    pub agreed_by_both: bool,
}

/// Salt, KDF cost and key check for one master key generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEpoch {
    /// Monotonic generation number
    pub generation: u32,
    /// Argon2id salt
    pub salt: [u8; SALT_SIZE],
    /// HMAC of the master key over a fixed label
    pub key_check: [u8; 32],
    /// Argon2id memory cost in KiB
    pub memory_kib: u32,
    /// Argon2id passes
    pub iterations: u32,
    /// Argon2id lanes
    pub parallelism: u32,
}

impl KeyEpoch {
    /// KDF parameters the master key was derived with.
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.memory_kib,
            iterations: self.iterations,
            parallelism: self.parallelism,
        }
    }
}

/// Vault metadata. Written as a single record so switching generations is
/// atomic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultMeta {
    /// Metadata format version
    pub format: u8,
    /// Authoritative key generation
    pub active: KeyEpoch,
}

/// Encode a record key. See the module docs for the layout.
pub fn encode_record_key(generation: u32, room_id: &str, message_id: &str) -> Vec<u8> {
    let mut key = encode_room_prefix(generation, room_id);
    key.extend_from_slice(message_id.as_bytes());
    key
}

/// Prefix shared by every record of one room in one generation.
pub fn encode_room_prefix(generation: u32, room_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(8 + room_id.len());
    prefix.extend_from_slice(&generation.to_be_bytes());
    prefix.extend_from_slice(&(room_id.len() as u32).to_be_bytes());
    prefix.extend_from_slice(room_id.as_bytes());
    prefix
}

/// Generation of an encoded record key. `None` if the key is too short.
pub fn decode_generation(key: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = key.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Associated data for a record at this location.
pub fn record_aad(generation: u32, room_id: &str, message_id: &str) -> Vec<u8> {
    let mut aad = RECORD_AAD_LABEL.to_vec();
    aad.extend_from_slice(&encode_record_key(generation, room_id, message_id));
    aad
}

mod base64_bytes {
    use base64::Engine as _;

    use super::{BASE64, Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(de::Error::custom)
    }
}

mod base64_array {
    use base64::Engine as _;

    use super::{BASE64, Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(encoded).map_err(de::Error::custom)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| de::Error::custom(format!("expected {N} bytes, got {len}")))
    }
}
