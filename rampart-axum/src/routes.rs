use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
};
use axum_extra::extract::CookieJar;
use rampart::{Rampart, RepositoryProvider};

use crate::{
    error::{HttpError, Result},
    middleware::CsrfState,
    types::*,
};

pub fn create_router<R>(rampart: Arc<Rampart<R>>, settings: CsrfSettings) -> Router
where
    R: RepositoryProvider + 'static,
{
    let state = CsrfState::new(rampart).with_settings(settings);

    Router::new()
        .route("/health", get(health_handler))
        .route("/csrf-token", get(csrf_token_handler))
        .with_state(state)
}

async fn health_handler<R>(State(state): State<CsrfState<R>>) -> Result<impl IntoResponse>
where
    R: RepositoryProvider,
{
    state.rampart.health_check().await?;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

/// Issue a CSRF token for the session named by the session cookie.
///
/// The value is only ever returned here; the server keeps its hash.
async fn csrf_token_handler<R>(
    State(state): State<CsrfState<R>>,
    jar: CookieJar,
) -> Result<impl IntoResponse>
where
    R: RepositoryProvider,
{
    let session_id = state.session_id(&jar).ok_or(HttpError::Unauthorized)?;
    let token = state.rampart.issue_csrf_token(&session_id).await?;

    Ok((
        [(header::CACHE_CONTROL, "no-store")],
        Json(CsrfTokenResponse {
            token: token.value,
            expires_at: token.expires_at,
        }),
    ))
}
