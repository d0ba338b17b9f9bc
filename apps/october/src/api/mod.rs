//! # October HTTP Module
//!
//! Serves theme pages over HTTP using axum.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - everything else - handed to the engine (`Site::handle`)
//!
//! ## Configuration (Environment Variables)
//!
//! - `OCTOBER_RATE_LIMIT`: page views per second (default: 100, 0 to disable)
//! - `OCTOBER_HANDLER_RATE_LIMIT`: AJAX and form posts per second
//!   (default: 20, 0 to disable)

mod handlers;
mod middleware;
mod types;

pub use handlers::{health_handler, page_handler};
pub use middleware::{RateLimits, RequestClass};
pub use types::{CSRF_COOKIE, HealthResponse, from_cms_response, to_cms_request};

use axum::{Router, middleware as axum_middleware, routing::get};
use october_core::{CmsError, Site};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state: the engine services.
#[derive(Clone)]
pub struct AppState {
    pub site: Arc<Site>,
}

impl AppState {
    #[must_use]
    pub fn new(site: Site) -> Self {
        Self {
            site: Arc::new(site),
        }
    }
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with limits from the environment.
pub fn create_router(state: AppState) -> Router {
    create_router_with_limits(state, RateLimits::from_env())
}

/// Create the axum router.
///
/// Middleware stack (outer to inner):
/// 1. Tracing - logs all requests
/// 2. Body limit
/// 3. Rate Limiting - per request class (if enabled)
pub fn create_router_with_limits(state: AppState, limits: RateLimits) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .fallback(handlers::page_handler);

    if limits.is_enabled() {
        tracing::info!("Rate limiting enabled");
        router = router.layer(axum_middleware::from_fn_with_state(
            limits,
            middleware::rate_limit_middleware,
        ));
    } else {
        tracing::info!("Rate limiting disabled");
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Start the HTTP server.
pub async fn run_server(addr: &str, site: Site) -> Result<(), CmsError> {
    let state = AppState::new(site);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| CmsError::Io(format!("Bind failed: {}", e)))?;

    tracing::info!("October server listening on {}", addr);

    axum::serve(listener, router)
        .await
        .map_err(|e| CmsError::Io(format!("Server error: {}", e)))
}
