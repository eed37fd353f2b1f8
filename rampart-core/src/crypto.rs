//! Cryptographic utilities for tokens, codes and secrets at rest
//!
//! # Security
//!
//! - Every security-relevant value is drawn from the operating system CSPRNG.
//! - High-entropy tokens (CSRF) are stored as SHA256 hashes and compared in
//!   constant time via the `subtle` crate.
//! - Low-entropy one-time values (backup codes) are stored as keyed
//!   HMAC-SHA256 digests so a leaked table cannot be brute forced offline
//!   without the server key.
//! - TOTP secrets are sealed with ChaCha20-Poly1305. Each ciphertext gets a
//!   fresh random 96-bit nonce and is bound to its owner through the AAD.

use base64::{Engine, engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use hmac::{Hmac, Mac};
use rand::{TryRngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{ConfigurationError, CryptoError};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;

/// Fill `buf` from the OS random number generator.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| CryptoError::Random(e.to_string()))
}

/// Generate `len` random bytes from the OS random number generator.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut bytes = vec![0u8; len];
    fill_random(&mut bytes)?;
    Ok(bytes)
}

/// Generate a cryptographically secure random token.
///
/// This produces a 256-bit (32-byte) random token encoded as URL-safe base64.
///
/// # Returns
///
/// A URL-safe base64-encoded random token (43 characters)
///
/// # Errors
///
/// Returns [`CryptoError::Random`] if the OS entropy source is unavailable.
/// Callers must treat this as a refusal to issue, never as an empty token.
pub fn generate_secure_token() -> Result<String, CryptoError> {
    let mut bytes = [0u8; 32];
    fill_random(&mut bytes)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a token for secure storage using SHA256.
///
/// # Arguments
///
/// * `token` - The plaintext token to hash
///
/// # Returns
///
/// A hex-encoded SHA256 hash of the token
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a token against a stored hash with constant-time comparison.
///
/// # Arguments
///
/// * `token` - The plaintext token to verify
/// * `stored_hash` - The stored SHA256 hash (hex-encoded) to verify against
///
/// # Returns
///
/// `true` if the token matches the hash, `false` otherwise
pub fn verify_token_hash(token: &str, stored_hash: &str) -> bool {
    let computed_hash = hash_token(token);
    constant_time_compare(computed_hash.as_bytes(), stored_hash.as_bytes())
}

/// Perform constant-time comparison of two byte slices.
///
/// Slices of different length compare unequal immediately; the length of a
/// token or code is not secret.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Authenticated encryption for secrets at rest plus a keyed digest for
/// one-time codes, both derived from a single 32-byte server key.
///
/// Sealed values are `base64(nonce || ciphertext)`.
pub struct SecretSealer {
    cipher: ChaCha20Poly1305,
    mac: HmacSha256,
}

impl SecretSealer {
    pub const KEY_LEN: usize = 32;

    /// Build a sealer from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidSecretKey`] if the key is not
    /// exactly [`Self::KEY_LEN`] bytes.
    pub fn new(key: &[u8]) -> Result<Self, ConfigurationError> {
        if key.len() != Self::KEY_LEN {
            return Err(ConfigurationError::InvalidSecretKey(format!(
                "expected {} bytes, got {}",
                Self::KEY_LEN,
                key.len()
            )));
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

        // Separate subkey so the digest key is never the encryption key.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|e| ConfigurationError::InvalidSecretKey(e.to_string()))?;
        mac.update(b"rampart:backup-code-digest:v1");
        let mac_key = mac.finalize().into_bytes();
        let mac = <HmacSha256 as Mac>::new_from_slice(&mac_key)
            .map_err(|e| ConfigurationError::InvalidSecretKey(e.to_string()))?;

        Ok(Self { cipher, mac })
    }

    /// Build a sealer from a standard base64 encoded key.
    pub fn from_base64(encoded: &str) -> Result<Self, ConfigurationError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ConfigurationError::InvalidSecretKey(e.to_string()))?;
        Self::new(&key)
    }

    /// Generate a fresh key, base64 encoded, suitable for [`Self::from_base64`].
    pub fn generate_key() -> Result<String, CryptoError> {
        let mut key = [0u8; Self::KEY_LEN];
        fill_random(&mut key)?;
        Ok(STANDARD.encode(key))
    }

    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        fill_random(&mut nonce_bytes)?;

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, sealed: &str, aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let data = STANDARD
            .decode(sealed)
            .map_err(|_| CryptoError::Decryption)?;
        if data.len() <= NONCE_LEN {
            return Err(CryptoError::Decryption);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Decryption)
    }

    /// Keyed HMAC-SHA256 digest, hex encoded. Deterministic for a given key,
    /// so it can be used for lookups.
    pub fn digest(&self, value: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(value.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for SecretSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretSealer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> SecretSealer {
        SecretSealer::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn test_hash_and_verify_token() {
        let token = "test_token_12345";
        let hash = hash_token(token);

        assert!(verify_token_hash(token, &hash));
        assert!(!verify_token_hash("wrong_token", &hash));
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_generate_secure_token_is_unique() {
        let a = generate_secure_token().unwrap();
        let b = generate_secure_token().unwrap();
        assert_eq!(a.len(), 43);
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"hello", b"hello"));
        assert!(!constant_time_compare(b"hello", b"world"));
        assert!(!constant_time_compare(b"short", b"longer_string"));
    }

    #[test]
    fn test_seal_and_open() {
        let sealer = sealer();
        let sealed = sealer.seal(b"JBSWY3DPEHPK3PXP", b"acct_1").unwrap();
        assert_eq!(sealer.open(&sealed, b"acct_1").unwrap(), b"JBSWY3DPEHPK3PXP");
    }

    #[test]
    fn test_seal_uses_fresh_nonce() {
        let sealer = sealer();
        let a = sealer.seal(b"secret", b"aad").unwrap();
        let b = sealer.seal(b"secret", b"aad").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_fails_with_wrong_aad_or_key() {
        let sealed = sealer().seal(b"secret", b"acct_1").unwrap();
        assert!(matches!(
            sealer().open(&sealed, b"acct_2"),
            Err(CryptoError::Decryption)
        ));

        let other = SecretSealer::new(&[9u8; 32]).unwrap();
        assert!(other.open(&sealed, b"acct_1").is_err());
        assert!(sealer().open("AAAA", b"acct_1").is_err());
    }

    #[test]
    fn test_invalid_key_length_is_configuration_error() {
        assert!(matches!(
            SecretSealer::new(&[0u8; 16]),
            Err(ConfigurationError::InvalidSecretKey(_))
        ));
        assert!(SecretSealer::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_generated_key_round_trips() {
        let key = SecretSealer::generate_key().unwrap();
        assert!(SecretSealer::from_base64(&key).is_ok());
    }

    #[test]
    fn test_digest_is_keyed_and_deterministic() {
        let a = sealer();
        let b = SecretSealer::new(&[8u8; 32]).unwrap();
        assert_eq!(a.digest("ABCD2345"), a.digest("ABCD2345"));
        assert_ne!(a.digest("ABCD2345"), b.digest("ABCD2345"));
        assert_ne!(a.digest("ABCD2345"), hash_token("ABCD2345"));
    }
}
