//! API key material: generation, salted hashing and constant-time
//! verification. The server stores only `key_prefix` (for candidate lookup)
//! and the salted hash; the full key is shown once at creation.

use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const PREFIX_LEN: usize = 8;

const KEY_BYTES: usize = 32;
const SALT_BYTES: usize = 16;

/// Returns `(full_key, key_prefix)`. Format: `sk_<base64url-random>`.
pub fn generate_key() -> (String, String) {
    let mut bytes = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let full_key = format!(
        "sk_{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    );
    let prefix: String = full_key.chars().take(PREFIX_LEN).collect();
    (full_key, prefix)
}

/// `<salt-hex>$<sha256(salt || key)-hex>`.
pub fn hash_key(key: &str) -> String {
    let mut salt = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = salted_digest(&salt, key);
    format!("{}${}", hex::encode(salt), hex::encode(digest))
}

/// Constant-time comparison of the presented key against a stored hash.
pub fn verify_key(key: &str, stored: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
        return false;
    };
    let actual = salted_digest(&salt, key);
    actual.as_slice().ct_eq(expected.as_slice()).into()
}

fn salted_digest(salt: &[u8], key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_verify_against_their_hash() {
        let (key, prefix) = generate_key();
        assert!(key.starts_with("sk_"));
        assert_eq!(prefix.len(), PREFIX_LEN);
        assert!(key.starts_with(&prefix));

        let stored = hash_key(&key);
        assert!(verify_key(&key, &stored));
        assert!(!verify_key("sk_not-the-key", &stored));
    }

    #[test]
    fn same_key_hashes_differently_per_salt() {
        let (key, _) = generate_key();
        let a = hash_key(&key);
        let b = hash_key(&key);
        assert_ne!(a, b);
        assert!(verify_key(&key, &a));
        assert!(verify_key(&key, &b));
    }

    #[test]
    fn malformed_stored_hash_never_verifies() {
        assert!(!verify_key("sk_x", "no-dollar-sign"));
        assert!(!verify_key("sk_x", "zz$zz"));
    }
}
