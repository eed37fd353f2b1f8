use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header that carries the CSRF token on state-changing requests.
pub const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfTokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Where the middleware finds the session a CSRF token is bound to.
#[derive(Debug, Clone)]
pub struct CsrfSettings {
    /// Name of the cookie holding the session identifier.
    pub session_cookie: String,
    pub header: String,
}

impl Default for CsrfSettings {
    fn default() -> Self {
        Self {
            session_cookie: "session_id".to_string(),
            header: CSRF_HEADER.to_string(),
        }
    }
}

impl CsrfSettings {
    pub fn new(session_cookie: impl Into<String>) -> Self {
        Self {
            session_cookie: session_cookie.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = header.into();
        self
    }
}
