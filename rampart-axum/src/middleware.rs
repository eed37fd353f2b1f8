use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use axum_extra::extract::CookieJar;
use rampart::{Rampart, RepositoryProvider};

use crate::{error::HttpError, types::CsrfSettings};

pub struct CsrfState<R: RepositoryProvider> {
    pub rampart: Arc<Rampart<R>>,
    pub settings: CsrfSettings,
}

impl<R: RepositoryProvider> CsrfState<R> {
    pub fn new(rampart: Arc<Rampart<R>>) -> Self {
        Self {
            rampart,
            settings: CsrfSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: CsrfSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The session identifier from the configured cookie.
    pub(crate) fn session_id(&self, jar: &CookieJar) -> Option<String> {
        jar.get(&self.settings.session_cookie)
            .map(|cookie| cookie.value().to_string())
            .filter(|value| !value.is_empty())
    }
}

impl<R: RepositoryProvider> Clone for CsrfState<R> {
    fn clone(&self) -> Self {
        Self {
            rampart: self.rampart.clone(),
            settings: self.settings.clone(),
        }
    }
}

fn is_safe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// Reject state-changing requests without a valid CSRF token.
///
/// Safe methods pass through. Everything else needs the session cookie and a
/// token in the CSRF header that was issued to that session; otherwise the
/// response is `403` with a generic body.
pub async fn require_csrf<R>(
    State(state): State<CsrfState<R>>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Result<Response, HttpError>
where
    R: RepositoryProvider,
{
    if is_safe_method(request.method()) {
        return Ok(next.run(request).await);
    }

    let Some(session_id) = state.session_id(&jar) else {
        tracing::debug!(method = %request.method(), "CSRF check without a session cookie");
        return Err(HttpError::CsrfRejected);
    };

    let token = request
        .headers()
        .get(state.settings.header.as_str())
        .and_then(|header| header.to_str().ok())
        .unwrap_or_default();

    state.rampart.verify_csrf_token(&session_id, token).await?;

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_methods() {
        assert!(is_safe_method(&Method::GET));
        assert!(is_safe_method(&Method::HEAD));
        assert!(is_safe_method(&Method::OPTIONS));
        assert!(!is_safe_method(&Method::POST));
        assert!(!is_safe_method(&Method::PUT));
        assert!(!is_safe_method(&Method::PATCH));
        assert!(!is_safe_method(&Method::DELETE));
    }
}
