//! Passphrase-based master key derivation.
//!
//! `master = HKDF-SHA256(ikm = Argon2id(passphrase, salt), info = VAULT_CONTEXT)`
//!
//! The master key is unrelated to any connection root secret. A short
//! HMAC-derived check value is stored next to the salt so a wrong passphrase
//! is detected up front instead of surfacing as record corruption.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    secret::{KEY_SIZE, MasterKey},
};

/// Versioned HKDF context for the storage master key.
pub const VAULT_CONTEXT: &[u8] = b"vanish/vault/v1";

/// Persistent salt size.
pub const SALT_SIZE: usize = 32;

/// Label authenticated by the key-check value.
const KEY_CHECK_LABEL: &[u8] = b"vanish/vault/key-check/v1";

type HmacSha256 = Hmac<Sha256>;

/// Argon2id cost parameters.
///
/// The parameters used at setup must be used again at unlock, so they are
/// persisted alongside the salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// 64 MiB, 3 passes, 4 lanes.
    fn default() -> Self {
        Self { memory_kib: 64 * 1024, iterations: 3, parallelism: 4 }
    }
}

impl KdfParams {
    /// Minimum legal Argon2id cost. Tests only.
    pub fn insecure_fast() -> Self {
        Self { memory_kib: 8, iterations: 1, parallelism: 1 }
    }
}

/// Derive the storage master key from a passphrase.
///
/// # Errors
///
/// - `KeyDerivation` if the Argon2 parameters are out of range
pub fn derive_master_key(
    passphrase: &[u8],
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> Result<MasterKey, CryptoError> {
    let argon_params =
        Params::new(params.memory_kib, params.iterations, params.parallelism, Some(KEY_SIZE))
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut stretched = Zeroizing::new([0u8; KEY_SIZE]);
    argon
        .hash_password_into(passphrase, salt, stretched.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let hkdf = Hkdf::<Sha256>::new(None, stretched.as_ref());

    let mut master = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(VAULT_CONTEXT, &mut master) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    Ok(MasterKey::from_bytes(master))
}

fn check_mac(master: &MasterKey) -> HmacSha256 {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(master.expose()) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(KEY_CHECK_LABEL);
    mac
}

/// Check value stored next to the salt.
pub fn key_check(master: &MasterKey) -> [u8; 32] {
    let mut check = [0u8; 32];
    check.copy_from_slice(&check_mac(master).finalize().into_bytes());
    check
}

/// Compare a stored check value in constant time.
pub fn verify_key_check(master: &MasterKey, expected: &[u8]) -> bool {
    check_mac(master).verify_slice(expected).is_ok()
}
