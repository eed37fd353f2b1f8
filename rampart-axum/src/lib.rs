//! # Rampart Axum Integration
//!
//! Axum glue for [`rampart`]:
//!
//! - [`require_csrf`]: middleware that rejects state-changing requests whose
//!   `x-csrf-token` header does not hold a token issued to the session in the
//!   session cookie
//! - `GET /csrf-token`: issues a token for the current session
//! - [`HttpError`]: maps [`rampart::Error`] to a status code and a generic
//!   `{"error", "code"}` body, with `Retry-After` on rate limits
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use axum::{Router, routing::post};
//! use rampart::{InMemoryRepositoryProvider, RampartBuilder};
//! use rampart_axum::{CsrfState, require_csrf};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rampart = Arc::new(
//!         RampartBuilder::new()
//!             .with_memory()
//!             .with_secret_key("<base64 key>")
//!             .build()
//!             .await?,
//!     );
//!
//!     let app = Router::new()
//!         .route("/profile", post(update_profile))
//!         .layer(axum::middleware::from_fn_with_state(
//!             CsrfState::new(rampart.clone()),
//!             require_csrf::<InMemoryRepositoryProvider>,
//!         ))
//!         .nest("/security", rampart_axum::routes(rampart).build());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//!
//! async fn update_profile() -> &'static str {
//!     "updated"
//! }
//! ```

mod error;
mod middleware;
mod routes;
mod types;

pub use error::{HttpError, Result};
pub use middleware::{CsrfState, require_csrf};
pub use routes::create_router;
pub use types::{CSRF_HEADER, CsrfSettings, CsrfTokenResponse, HealthResponse};

use std::sync::Arc;

use axum::Router;
use rampart::{Rampart, RepositoryProvider};

/// Create the Rampart routes (`/csrf-token`, `/health`).
///
/// Nest the returned builder's router anywhere in the application.
pub fn routes<R>(rampart: Arc<Rampart<R>>) -> RampartRouterBuilder<R>
where
    R: RepositoryProvider + 'static,
{
    RampartRouterBuilder {
        rampart,
        settings: CsrfSettings::default(),
    }
}

/// Builder for configuring the Rampart routes
pub struct RampartRouterBuilder<R: RepositoryProvider> {
    rampart: Arc<Rampart<R>>,
    settings: CsrfSettings,
}

impl<R: RepositoryProvider + 'static> RampartRouterBuilder<R> {
    /// Use a different session cookie or header name.
    ///
    /// The CSRF middleware must be given the same settings.
    pub fn with_settings(mut self, settings: CsrfSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Router {
        create_router(self.rampart, self.settings)
    }
}

impl<R: RepositoryProvider + 'static> From<RampartRouterBuilder<R>> for Router {
    fn from(builder: RampartRouterBuilder<R>) -> Self {
        builder.build()
    }
}
