//! Prefixed identifiers
//!
//! Identifiers look like `{prefix}_{random}` where the random part is at least
//! 96 bits of OS randomness, base64 URL-safe encoded without padding.

use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};

use crate::{crypto::fill_random, error::CryptoError};

/// Prefix used for security alert identifiers.
pub const ALERT_PREFIX: &str = "alrt";

/// Generate a prefixed ID with 96 bits of entropy
///
/// # Arguments
/// * `prefix` - The prefix for the ID (e.g., "alrt")
///
/// # Example
/// ```
/// use rampart_core::id::generate_prefixed_id;
///
/// let alert_id = generate_prefixed_id("alrt").unwrap();
/// assert!(alert_id.starts_with("alrt_"));
/// ```
pub fn generate_prefixed_id(prefix: &str) -> Result<String, CryptoError> {
    let mut bytes = [0u8; 12];
    fill_random(&mut bytes)?;
    Ok(format!("{prefix}_{}", BASE64_URL_SAFE_NO_PAD.encode(bytes)))
}

/// Validate that a prefixed ID has the expected format
///
/// # Returns
/// `true` if the ID has the correct prefix and at least 96 bits of payload
pub fn validate_prefixed_id(id: &str, expected_prefix: &str) -> bool {
    let Some(random_part) = id
        .strip_prefix(expected_prefix)
        .and_then(|rest| rest.strip_prefix('_'))
    else {
        return false;
    };

    match BASE64_URL_SAFE_NO_PAD.decode(random_part) {
        Ok(decoded) => decoded.len() >= 12,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_prefixed_id() {
        let id = generate_prefixed_id(ALERT_PREFIX).unwrap();
        assert!(id.starts_with("alrt_"));
        assert_eq!(id.len(), "alrt_".len() + 16);
        assert!(validate_prefixed_id(&id, ALERT_PREFIX));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = generate_prefixed_id(ALERT_PREFIX).unwrap();
        let b = generate_prefixed_id(ALERT_PREFIX).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_validate_prefixed_id_rejects_malformed() {
        assert!(!validate_prefixed_id("alrt", ALERT_PREFIX));
        assert!(!validate_prefixed_id("usr_AAAAAAAAAAAAAAAA", ALERT_PREFIX));
        assert!(!validate_prefixed_id("alrt_short", ALERT_PREFIX));
        assert!(!validate_prefixed_id("alrt_!!!!", ALERT_PREFIX));
    }
}
