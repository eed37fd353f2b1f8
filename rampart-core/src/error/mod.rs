pub mod utilities;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Two-factor error: {0}")]
    TwoFactor(#[from] TwoFactorError),

    #[error("CSRF error: {0}")]
    Csrf(#[from] CsrfError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid email: {0}")]
    InvalidEmail(String),

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Raised when a tracked identity has exhausted a rule.
///
/// The message is deliberately the same for every rule so that a caller
/// cannot tell whether the address or the account triggered the block.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Too many attempts, retry after {}s", .retry_after_ms.div_ceil(1000))]
    Exceeded { retry_after_ms: u64 },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TwoFactorError {
    /// A TOTP or backup code did not verify. Which factor failed is not reported.
    #[error("Invalid verification code")]
    InvalidCode,

    #[error("Two-factor authentication is not enabled")]
    NotEnrolled,

    #[error("Two-factor authentication is already enabled")]
    AlreadyEnrolled,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CsrfError {
    #[error("CSRF token expired")]
    TokenExpired,

    #[error("CSRF token mismatch")]
    TokenMismatch,

    #[error("CSRF token missing")]
    MissingToken,

    #[error("Invalid session identifier")]
    InvalidSession,
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Unknown security rule: {0}")]
    UnknownRule(String),

    #[error("Invalid security rule: {0}")]
    InvalidRule(String),

    #[error("Secret key is not configured")]
    MissingSecretKey,

    #[error("Invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Record not found")]
    NotFound,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Event bus error: {0}")]
    BusError(String),

    #[error("Event handler error: {0}")]
    HandlerError(String),
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Random number generation failed: {0}")]
    Random(String),

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed")]
    Decryption,

    #[error("Invalid secret encoding: {0}")]
    InvalidSecret(String),
}

impl Error {
    /// Errors caused by the request itself. These are answered with a
    /// structured rejection instead of being treated as a server fault.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::RateLimit(_)
                | Error::TwoFactor(TwoFactorError::InvalidCode)
                | Error::Csrf(_)
        )
    }

    /// Configuration problems must stop the affected component from serving.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }

    pub fn is_validation_error(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub fn is_rate_limit_error(&self) -> bool {
        matches!(self, Error::RateLimit(_))
    }

    /// The retry hint carried by a rate limit rejection.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Error::RateLimit(RateLimitError::Exceeded { retry_after_ms }) => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// A message that is safe to show to an end user.
    ///
    /// Internal detail (storage failures, key problems, which rule blocked a
    /// login, whether a CSRF token was stale or forged) is never included.
    pub fn public_message(&self) -> String {
        match self {
            Error::Validation(e) => e.to_string(),
            Error::RateLimit(e) => e.to_string(),
            Error::TwoFactor(TwoFactorError::AlreadyEnrolled) => {
                TwoFactorError::AlreadyEnrolled.to_string()
            }
            Error::TwoFactor(_) => TwoFactorError::InvalidCode.to_string(),
            Error::Csrf(_) => "Invalid or expired CSRF token".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let validation_error =
            Error::Validation(ValidationError::InvalidEmail("missing domain".to_string()));
        assert_eq!(
            validation_error.to_string(),
            "Validation error: Invalid email: missing domain"
        );

        let storage_error = Error::Storage(StorageError::NotFound);
        assert_eq!(storage_error.to_string(), "Storage error: Record not found");
    }

    #[test]
    fn test_rate_limit_message_rounds_up_to_seconds() {
        let err = RateLimitError::Exceeded {
            retry_after_ms: 1_001,
        };
        assert_eq!(err.to_string(), "Too many attempts, retry after 2s");

        let err = RateLimitError::Exceeded {
            retry_after_ms: 300_000,
        };
        assert_eq!(err.to_string(), "Too many attempts, retry after 300s");
    }

    #[test]
    fn test_is_request_error() {
        assert!(Error::Validation(ValidationError::MissingField("email".into())).is_request_error());
        assert!(
            Error::RateLimit(RateLimitError::Exceeded {
                retry_after_ms: 10
            })
            .is_request_error()
        );
        assert!(Error::TwoFactor(TwoFactorError::InvalidCode).is_request_error());
        assert!(Error::Csrf(CsrfError::TokenExpired).is_request_error());
        assert!(!Error::Storage(StorageError::NotFound).is_request_error());
        assert!(!Error::Configuration(ConfigurationError::MissingSecretKey).is_request_error());
    }

    #[test]
    fn test_is_fatal() {
        assert!(Error::Configuration(ConfigurationError::UnknownRule("x".into())).is_fatal());
        assert!(!Error::Csrf(CsrfError::TokenMismatch).is_fatal());
    }

    #[test]
    fn test_retry_after_ms() {
        let err: Error = RateLimitError::Exceeded {
            retry_after_ms: 4_000,
        }
        .into();
        assert!(err.is_rate_limit_error());
        assert_eq!(err.retry_after_ms(), Some(4_000));
        assert_eq!(Error::Csrf(CsrfError::MissingToken).retry_after_ms(), None);
    }

    #[test]
    fn test_public_message_hides_internal_detail() {
        let err = Error::Storage(StorageError::Database("no such table: alerts".into()));
        assert_eq!(err.public_message(), "Internal server error");

        let err = Error::Configuration(ConfigurationError::UnknownRule("login_ip".into()));
        assert!(!err.public_message().contains("login_ip"));

        let expired = Error::Csrf(CsrfError::TokenExpired).public_message();
        let mismatch = Error::Csrf(CsrfError::TokenMismatch).public_message();
        assert_eq!(expired, mismatch);

        let not_enrolled = Error::TwoFactor(TwoFactorError::NotEnrolled).public_message();
        assert_eq!(not_enrolled, "Invalid verification code");
    }

    #[test]
    fn test_error_from_conversions() {
        let error: Error = CsrfError::TokenMismatch.into();
        assert!(matches!(error, Error::Csrf(CsrfError::TokenMismatch)));

        let error: Error = TwoFactorError::InvalidCode.into();
        assert!(matches!(error, Error::TwoFactor(TwoFactorError::InvalidCode)));
    }
}
