//! TOTP (RFC 6238) code generation and verification, plus backup codes.
//!
//! The engine is stateless apart from its configuration and clock. Replay
//! protection and persistence live in [`crate::services::TwoFactorService`].

use std::{collections::HashSet, sync::Arc};

use hmac::{Hmac, Mac};
use sha1::Sha1;
use url::{Url, form_urlencoded};

use crate::{
    Error,
    clock::Clock,
    config::TotpConfig,
    crypto::{constant_time_compare, fill_random, random_bytes},
    error::{ConfigurationError, CryptoError, ValidationError},
    storage::{BackupCode, TwoFactorConfig, TwoFactorEnrollment},
};

type HmacSha1 = Hmac<Sha1>;

/// Characters used for backup codes. `0`, `1`, `I` and `O` are left out so
/// codes survive being read aloud or copied by hand.
pub const BACKUP_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const BACKUP_CODE_LENGTH: usize = 8;

const MAX_DISPLAY_NAME_LENGTH: usize = 100;

/// Encode a secret the way authenticator apps expect it: RFC 4648 base32
/// without padding.
pub fn encode_secret(bytes: &[u8]) -> String {
    base32::encode(base32::Alphabet::Rfc4648 { padding: false }, bytes)
}

/// Decode a base32 secret. Case, whitespace and trailing padding are ignored.
pub fn decode_secret(secret: &str) -> Result<Vec<u8>, CryptoError> {
    let cleaned = secret
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .trim_end_matches('=')
        .to_ascii_uppercase();

    if cleaned.is_empty() {
        return Err(CryptoError::InvalidSecret("empty base32 value".to_string()));
    }

    base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &cleaned)
        .ok_or_else(|| CryptoError::InvalidSecret("invalid base32 value".to_string()))
}

/// Canonical form of a backup code as typed by a user: dashes and whitespace
/// removed, upper case.
pub fn normalize_backup_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Generate `count` distinct backup codes.
pub fn generate_backup_codes(count: usize) -> Result<Vec<String>, CryptoError> {
    let mut seen = HashSet::with_capacity(count);
    let mut codes = Vec::with_capacity(count);
    let mut bytes = [0u8; BACKUP_CODE_LENGTH];

    while codes.len() < count {
        fill_random(&mut bytes)?;
        // 256 is a multiple of 32, so masking keeps the distribution uniform.
        let code: String = bytes
            .iter()
            .map(|b| BACKUP_CODE_ALPHABET[(b & 0x1f) as usize] as char)
            .collect();
        if seen.insert(code.clone()) {
            codes.push(code);
        }
    }

    Ok(codes)
}

/// RFC 4226 HOTP value for one counter.
fn hotp(key: &[u8], counter: u64, digits: u32) -> Result<String, CryptoError> {
    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidSecret(e.to_string()))?;
    mac.update(&counter.to_be_bytes());
    let hash = mac.finalize().into_bytes();

    let offset = (hash[hash.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        hash[offset] & 0x7f,
        hash[offset + 1],
        hash[offset + 2],
        hash[offset + 3],
    ]);
    let code = binary % 10u32.pow(digits);

    Ok(format!("{code:0width$}", width = digits as usize))
}

/// TOTP generator and verifier.
pub struct TotpEngine {
    config: TotpConfig,
    clock: Arc<dyn Clock>,
}

impl TotpEngine {
    pub fn new(config: TotpConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self { config, clock })
    }

    pub fn config(&self) -> &TotpConfig {
        &self.config
    }

    /// Create a fresh secret and backup codes for an account.
    ///
    /// # Arguments
    ///
    /// * `account_id` - Stable identifier of the account
    /// * `display_name` - Label shown in the authenticator app, usually the email
    pub fn generate_two_factor_config(
        &self,
        account_id: &str,
        display_name: &str,
    ) -> Result<TwoFactorEnrollment, Error> {
        let account_id = account_id.trim();
        if account_id.is_empty() {
            return Err(ValidationError::MissingField("account_id".to_string()).into());
        }
        let display_name = display_name.trim();
        if display_name.is_empty()
            || display_name.chars().count() > MAX_DISPLAY_NAME_LENGTH
            || display_name.contains(':')
        {
            return Err(ValidationError::InvalidField(
                "display name must be 1 to 100 characters without ':'".to_string(),
            )
            .into());
        }

        let secret = encode_secret(&random_bytes(self.config.secret_bytes)?);
        let backup_codes = generate_backup_codes(self.config.backup_code_count)?
            .into_iter()
            .map(BackupCode::new)
            .collect();
        let otpauth_uri = self.otpauth_uri(&secret, display_name)?;

        Ok(TwoFactorEnrollment {
            config: TwoFactorConfig {
                account_id: account_id.to_string(),
                secret,
                issued_at: self.clock.now(),
                backup_codes,
            },
            otpauth_uri,
        })
    }

    /// Build the `otpauth://` provisioning URI for a secret.
    pub fn otpauth_uri(&self, secret: &str, display_name: &str) -> Result<String, Error> {
        let issuer = self.config.issuer.as_str();

        let mut uri = Url::parse("otpauth://totp/")
            .map_err(|e| ConfigurationError::InvalidValue(e.to_string()))?;
        uri.set_path(&format!("/{issuer}:{display_name}"));

        // Authenticator apps do not all read `+` as a space.
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("secret", secret)
            .append_pair("issuer", issuer)
            .append_pair("algorithm", "SHA1")
            .append_pair("digits", &self.config.digits.to_string())
            .append_pair("period", &self.config.period_secs.to_string())
            .finish()
            .replace('+', "%20");
        uri.set_query(Some(&query));

        Ok(uri.into())
    }

    pub fn generate_current_code(&self, secret: &str) -> Result<String, CryptoError> {
        self.generate_code_at(secret, self.unix_now())
    }

    /// Code for the step containing `unix_secs`.
    pub fn generate_code_at(&self, secret: &str, unix_secs: u64) -> Result<String, CryptoError> {
        let key = decode_secret(secret)?;
        hotp(&key, unix_secs / self.config.period_secs, self.config.digits)
    }

    pub fn verify_code(&self, secret: &str, code: &str) -> bool {
        self.verify_code_step(secret, code).is_some()
    }

    /// Verify a code and return the time step it belongs to.
    ///
    /// Every step inside the skew window is computed and compared in constant
    /// time, so the response time does not reveal which step matched.
    pub fn verify_code_step(&self, secret: &str, code: &str) -> Option<u64> {
        let code: String = code.chars().filter(|c| !c.is_whitespace()).collect();
        if code.len() != self.config.digits as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let key = match decode_secret(secret) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(error = %e, "Stored TOTP secret could not be decoded");
                return None;
            }
        };

        let current = self.unix_now() / self.config.period_secs;
        let first = current.saturating_sub(self.config.skew_steps);
        let last = current.saturating_add(self.config.skew_steps);

        let mut matched = None;
        for step in first..=last {
            let Ok(expected) = hotp(&key, step, self.config.digits) else {
                return None;
            };
            let ok = constant_time_compare(expected.as_bytes(), code.as_bytes());
            if ok && matched.is_none() {
                matched = Some(step);
            }
        }
        matched
    }

    /// Redeem a plaintext backup code held in `config`.
    ///
    /// Matches only unused codes and marks the match used. The exclusive
    /// borrow makes check-and-consume a single step.
    pub fn verify_backup_code(&self, config: &mut TwoFactorConfig, code: &str) -> bool {
        let code = normalize_backup_code(code);
        if code.len() != BACKUP_CODE_LENGTH {
            return false;
        }

        let mut matched = None;
        for (index, backup) in config.backup_codes.iter().enumerate() {
            let ok = constant_time_compare(backup.code.as_bytes(), code.as_bytes());
            if ok && !backup.used && matched.is_none() {
                matched = Some(index);
            }
        }

        match matched {
            Some(index) => {
                config.backup_codes[index].used = true;
                true
            }
            None => false,
        }
    }

    /// Seconds left in the current step, between 1 and the period.
    pub fn time_remaining(&self) -> u64 {
        self.config.period_secs - self.unix_now() % self.config.period_secs
    }

    /// Step containing the current instant.
    pub fn current_step(&self) -> u64 {
        self.unix_now() / self.config.period_secs
    }

    fn unix_now(&self) -> u64 {
        u64::try_from(self.clock.now().timestamp()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    // RFC 6238 appendix B secret, "12345678901234567890".
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    fn engine_at(unix: i64) -> (TotpEngine, ManualClock) {
        let clock = ManualClock::at_unix(unix);
        let engine = TotpEngine::new(TotpConfig::default(), Arc::new(clock.clone())).unwrap();
        (engine, clock)
    }

    #[test]
    fn test_secret_encoding() {
        assert_eq!(encode_secret(b"Hello!\xDE\xAD\xBE\xEF"), "JBSWY3DPEHPK3PXP");
        assert_eq!(encode_secret(b"12345678901234567890"), RFC_SECRET);
        assert_eq!(
            decode_secret("jbsw y3dp ehpk 3pxp====").unwrap(),
            b"Hello!\xDE\xAD\xBE\xEF"
        );
        assert!(decode_secret("JBSW1").is_err());
        assert!(decode_secret("").is_err());
    }

    #[test]
    fn test_rfc6238_vectors() {
        let (engine, _) = engine_at(0);
        assert_eq!(engine.generate_code_at(RFC_SECRET, 59).unwrap(), "287082");
        assert_eq!(
            engine.generate_code_at(RFC_SECRET, 1_111_111_109).unwrap(),
            "081804"
        );
        assert_eq!(
            engine.generate_code_at(RFC_SECRET, 1_234_567_890).unwrap(),
            "005924"
        );
    }

    #[test]
    fn test_round_trip_with_drift() {
        let (engine, clock) = engine_at(1_700_000_000);
        let enrollment = engine
            .generate_two_factor_config("acct_1", "alice@example.com")
            .unwrap();
        let secret = enrollment.config.secret.clone();
        let code = engine.generate_current_code(&secret).unwrap();
        assert!(engine.verify_code(&secret, &code));

        clock.advance(Duration::seconds(30));
        assert!(engine.verify_code(&secret, &code));

        clock.advance(Duration::seconds(30));
        assert!(!engine.verify_code(&secret, &code));

        clock.set(chrono::DateTime::from_timestamp(1_700_000_000 - 30, 0).unwrap());
        assert!(engine.verify_code(&secret, &code));
    }

    #[test]
    fn test_verify_returns_matching_step() {
        let (engine, _) = engine_at(1_700_000_010);
        let step = engine.current_step();
        let previous = engine
            .generate_code_at(RFC_SECRET, (step - 1) * 30)
            .unwrap();
        assert_eq!(engine.verify_code_step(RFC_SECRET, &previous), Some(step - 1));
    }

    #[test]
    fn test_malformed_codes_are_rejected() {
        let (engine, _) = engine_at(1_700_000_000);
        let code = engine.generate_current_code(RFC_SECRET).unwrap();
        assert!(engine.verify_code(RFC_SECRET, &format!("{} {}", &code[..3], &code[3..])));
        assert!(!engine.verify_code(RFC_SECRET, ""));
        assert!(!engine.verify_code(RFC_SECRET, "12345"));
        assert!(!engine.verify_code(RFC_SECRET, "1234567"));
        assert!(!engine.verify_code(RFC_SECRET, "abcdef"));
        assert!(!engine.verify_code("not base32!", &code));
    }

    #[test]
    fn test_enrollment_shape() {
        let (engine, _) = engine_at(1_700_000_000);
        let enrollment = engine
            .generate_two_factor_config("acct_1", "alice@example.com")
            .unwrap();

        assert_eq!(decode_secret(&enrollment.config.secret).unwrap().len(), 20);
        assert_eq!(enrollment.config.backup_codes.len(), 10);
        let unique: HashSet<_> = enrollment
            .config
            .backup_codes
            .iter()
            .map(|c| c.code.clone())
            .collect();
        assert_eq!(unique.len(), 10);
        for code in &enrollment.config.backup_codes {
            assert_eq!(code.code.len(), BACKUP_CODE_LENGTH);
            assert!(code.code.bytes().all(|b| BACKUP_CODE_ALPHABET.contains(&b)));
            assert!(!code.used);
        }

        assert!(enrollment.otpauth_uri.starts_with(&format!(
            "otpauth://totp/Rampart:alice@example.com?secret={}&issuer=Rampart",
            enrollment.config.secret
        )));
    }

    #[test]
    fn test_otpauth_uri_encodes_spaces() {
        let clock = ManualClock::at_unix(1_700_000_000);
        let config = TotpConfig {
            issuer: "Example Corp".to_string(),
            ..Default::default()
        };
        let engine = TotpEngine::new(config, Arc::new(clock)).unwrap();
        let uri = engine.otpauth_uri("JBSWY3DPEHPK3PXP", "Alice Smith").unwrap();

        assert!(uri.starts_with("otpauth://totp/Example%20Corp:Alice%20Smith?"));
        assert!(uri.contains("issuer=Example%20Corp"));
        assert!(!uri.contains('+'));
    }

    #[test]
    fn test_display_name_is_validated() {
        let (engine, _) = engine_at(1_700_000_000);
        assert!(engine.generate_two_factor_config("acct", "").is_err());
        assert!(engine.generate_two_factor_config("acct", "a:b").is_err());
        assert!(
            engine
                .generate_two_factor_config("acct", &"x".repeat(101))
                .is_err()
        );
        assert!(
            engine
                .generate_two_factor_config("", "alice@example.com")
                .is_err()
        );
    }

    #[test]
    fn test_backup_code_single_use() {
        let (engine, _) = engine_at(1_700_000_000);
        let mut config = engine
            .generate_two_factor_config("acct_1", "alice@example.com")
            .unwrap()
            .config;
        let code = config.backup_codes[3].code.clone();
        let typed = format!("{}-{}", code[..4].to_lowercase(), &code[4..]);

        assert!(engine.verify_backup_code(&mut config, &typed));
        assert!(config.backup_codes[3].used);
        assert_eq!(config.remaining_backup_codes(), 9);
        assert!(!engine.verify_backup_code(&mut config, &code));
        assert!(!engine.verify_backup_code(&mut config, "AAAA"));
    }

    #[test]
    fn test_time_remaining() {
        let (engine, clock) = engine_at(1_699_999_990);
        assert_eq!(engine.time_remaining(), 20);
        clock.advance(Duration::seconds(19));
        assert_eq!(engine.time_remaining(), 1);
        clock.advance(Duration::seconds(1));
        assert_eq!(engine.time_remaining(), 30);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TotpConfig {
            secret_bytes: 10,
            ..Default::default()
        };
        assert!(TotpEngine::new(config, Arc::new(ManualClock::default())).is_err());
    }
}
