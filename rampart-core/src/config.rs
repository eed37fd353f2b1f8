//! Runtime configuration
//!
//! Configuration can be built in code, deserialized from JSON, or read from
//! the environment. Whatever the source, [`RampartConfig::validate`] must pass
//! before any service is constructed: a rule set or key that cannot be
//! enforced stops startup instead of weakening a check.
//!
//! # Environment variables
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `RAMPART_CONFIG` | Path to a JSON file used as the base configuration |
//! | `RAMPART_ISSUER` | TOTP issuer shown in authenticator apps |
//! | `RAMPART_SECRET_KEY` | Base64 encoded 32-byte key for sealing secrets |
//! | `RAMPART_CSRF_TOKEN_TTL_SECS` | CSRF token lifetime |
//! | `RAMPART_SWEEP_INTERVAL_SECS` | Attempt record sweep cadence, `0` disables |

use std::{collections::HashSet, fmt, path::Path};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigurationError, storage::SecurityRule};

pub const ENV_CONFIG_PATH: &str = "RAMPART_CONFIG";
pub const ENV_ISSUER: &str = "RAMPART_ISSUER";
pub const ENV_SECRET_KEY: &str = "RAMPART_SECRET_KEY";
pub const ENV_CSRF_TOKEN_TTL_SECS: &str = "RAMPART_CSRF_TOKEN_TTL_SECS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "RAMPART_SWEEP_INTERVAL_SECS";

const DEFAULT_ISSUER: &str = "Rampart";
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// TOTP parameters. The defaults are the RFC 6238 values every common
/// authenticator app expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TotpConfig {
    pub issuer: String,
    pub digits: u32,
    pub period_secs: u64,
    /// Steps accepted on either side of the current one.
    pub skew_steps: u64,
    pub secret_bytes: usize,
    pub backup_code_count: usize,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            digits: 6,
            period_secs: 30,
            skew_steps: 1,
            secret_bytes: 20,
            backup_code_count: 10,
        }
    }
}

impl TotpConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.issuer.trim().is_empty() || self.issuer.contains(':') {
            return Err(ConfigurationError::InvalidValue(
                "totp.issuer must be non-empty and must not contain ':'".to_string(),
            ));
        }
        if !(6..=8).contains(&self.digits) {
            return Err(ConfigurationError::InvalidValue(
                "totp.digits must be between 6 and 8".to_string(),
            ));
        }
        if !(15..=300).contains(&self.period_secs) {
            return Err(ConfigurationError::InvalidValue(
                "totp.period_secs must be between 15 and 300".to_string(),
            ));
        }
        if self.skew_steps > 2 {
            return Err(ConfigurationError::InvalidValue(
                "totp.skew_steps must be at most 2".to_string(),
            ));
        }
        if !(20..=64).contains(&self.secret_bytes) {
            return Err(ConfigurationError::InvalidValue(
                "totp.secret_bytes must be between 20 (160 bits) and 64".to_string(),
            ));
        }
        if !(8..=32).contains(&self.backup_code_count) {
            return Err(ConfigurationError::InvalidValue(
                "totp.backup_code_count must be between 8 and 32".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CsrfConfig {
    pub token_ttl_secs: u64,
    /// Live tokens kept per session. `1` means issuing a token invalidates
    /// the previous one; higher values allow several open tabs.
    pub max_tokens_per_session: usize,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 3600,
            max_tokens_per_session: 1,
        }
    }
}

impl CsrfConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.token_ttl_secs == 0 || self.token_ttl_secs > 7 * 24 * 3600 {
            return Err(ConfigurationError::InvalidValue(
                "csrf.token_ttl_secs must be between 1 second and 7 days".to_string(),
            ));
        }
        if !(1..=16).contains(&self.max_tokens_per_session) {
            return Err(ConfigurationError::InvalidValue(
                "csrf.max_tokens_per_session must be between 1 and 16".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RampartConfig {
    pub rules: Vec<SecurityRule>,
    /// Cadence of the attempt record sweep. `0` disables it.
    pub sweep_interval_secs: u64,
    pub totp: TotpConfig,
    pub csrf: CsrfConfig,
    /// Base64 encoded 32-byte key used to seal TOTP secrets and key backup
    /// code digests.
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
}

impl Default for RampartConfig {
    fn default() -> Self {
        Self {
            rules: SecurityRule::defaults(),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            totp: TotpConfig::default(),
            csrf: CsrfConfig::default(),
            secret_key: None,
        }
    }
}

impl fmt::Debug for RampartConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RampartConfig")
            .field("rules", &self.rules)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("totp", &self.totp)
            .field("csrf", &self.csrf)
            .field(
                "secret_key",
                &self.secret_key.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl RampartConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(json).map_err(|e| ConfigurationError::Load(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::Load(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&contents)
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// `RAMPART_CONFIG` selects the base file; the other variables override
    /// individual fields. A variable that is set but unparsable is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(ENV_CONFIG_PATH) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(issuer) = lookup(ENV_ISSUER) {
            config.totp.issuer = issuer;
        }
        if let Some(key) = lookup(ENV_SECRET_KEY) {
            config.secret_key = Some(key);
        }
        if let Some(ttl) = lookup(ENV_CSRF_TOKEN_TTL_SECS) {
            config.csrf.token_ttl_secs = parse_var(ENV_CSRF_TOKEN_TTL_SECS, &ttl)?;
        }
        if let Some(interval) = lookup(ENV_SWEEP_INTERVAL_SECS) {
            config.sweep_interval_secs = parse_var(ENV_SWEEP_INTERVAL_SECS, &interval)?;
        }

        Ok(config)
    }

    pub fn with_secret_key(mut self, key: impl Into<String>) -> Self {
        self.secret_key = Some(key.into());
        self
    }

    pub fn with_rule(mut self, rule: SecurityRule) -> Self {
        self.rules.retain(|r| r.name != rule.name);
        self.rules.push(rule);
        self
    }

    pub fn rule(&self, name: &str) -> Option<&SecurityRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Check the whole configuration. The secret key itself is checked when
    /// the sealer is built from it.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut names = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigurationError::InvalidRule(format!(
                    "{}: duplicate rule name",
                    rule.name
                )));
            }
        }

        self.totp.validate()?;
        self.csrf.validate()?;
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigurationError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigurationError::InvalidValue(format!("{name} has an invalid value")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RuleScope;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = RampartConfig::default();
        config.validate().unwrap();
        assert_eq!(config.totp.digits, 6);
        assert_eq!(config.totp.period_secs, 30);
        assert_eq!(config.csrf.max_tokens_per_session, 1);
        assert!(config.rule(SecurityRule::LOGIN_EMAIL).is_some());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = RampartConfig::from_json_str(
            r#"{
                "rules": [
                    {
                        "name": "login_email",
                        "scope": "account",
                        "max_attempts": 3,
                        "window_ms": 60000,
                        "block_duration_ms": 300000,
                        "alert_type": "email_blocked"
                    }
                ],
                "totp": { "issuer": "Acme" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.rules.len(), 1);
        assert!(config.rules[0].enabled);
        assert!(config.rules[0].reset_on_success);
        assert_eq!(config.rules[0].scope, RuleScope::Account);
        assert_eq!(config.totp.issuer, "Acme");
        assert_eq!(config.totp.digits, 6);
        assert_eq!(config.csrf.token_ttl_secs, 3600);
        config.validate().unwrap();
    }

    #[test]
    fn test_malformed_json_is_load_error() {
        assert!(matches!(
            RampartConfig::from_json_str("{ not json"),
            Err(ConfigurationError::Load(_))
        ));
    }

    #[test]
    fn test_lookup_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_ISSUER, "Example Corp"),
            (ENV_SECRET_KEY, "a2V5"),
            (ENV_CSRF_TOKEN_TTL_SECS, "900"),
            (ENV_SWEEP_INTERVAL_SECS, "0"),
        ]);
        let config =
            RampartConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.totp.issuer, "Example Corp");
        assert_eq!(config.secret_key.as_deref(), Some("a2V5"));
        assert_eq!(config.csrf.token_ttl_secs, 900);
        assert_eq!(config.sweep_interval_secs, 0);
    }

    #[test]
    fn test_unparsable_variable_fails_closed() {
        let result = RampartConfig::from_lookup(|key| {
            (key == ENV_CSRF_TOKEN_TTL_SECS).then(|| "an hour".to_string())
        });
        assert!(matches!(result, Err(ConfigurationError::InvalidValue(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RampartConfig::default();
        config.totp.secret_bytes = 10;
        assert!(config.validate().is_err());

        let mut config = RampartConfig::default();
        config.totp.issuer = "Acme:Corp".into();
        assert!(config.validate().is_err());

        let mut config = RampartConfig::default();
        config.csrf.token_ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RampartConfig::default();
        config.rules.push(SecurityRule::new(
            SecurityRule::LOGIN_IP,
            RuleScope::Ip,
            1,
            1,
            1,
        ));
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidRule(_))
        ));
    }

    #[test]
    fn test_with_rule_replaces_by_name() {
        let config = RampartConfig::default().with_rule(SecurityRule::new(
            SecurityRule::LOGIN_EMAIL,
            RuleScope::Account,
            2,
            1_000,
            1_000,
        ));
        assert_eq!(config.rules.len(), 5);
        assert_eq!(config.rule(SecurityRule::LOGIN_EMAIL).unwrap().max_attempts, 2);
    }

    #[test]
    fn test_debug_redacts_secret_key() {
        let config = RampartConfig::default().with_secret_key("c2VjcmV0");
        assert!(!format!("{config:?}").contains("c2VjcmV0"));
    }
}
