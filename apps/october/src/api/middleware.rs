//! # Middleware Module
//!
//! Rate limiting for the site server.
//!
//! Requests are split by what they cost the engine: `/health` is never
//! limited, page views share one budget, and requests that run a handler
//! (AJAX calls and form posts) share a smaller one.
//!
//! ## Configuration
//!
//! - `OCTOBER_RATE_LIMIT`: page views per second (default: 100, 0 disables)
//! - `OCTOBER_HANDLER_RATE_LIMIT`: handler requests per second
//!   (default: 20, 0 disables)

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use october_core::primitives::AJAX_HANDLER_HEADER;
use std::num::NonZeroU32;
use std::sync::Arc;

const DEFAULT_PAGE_RPS: u32 = 100;
const DEFAULT_HANDLER_RPS: u32 = 20;

// =============================================================================
// REQUEST CLASSES
// =============================================================================

/// How a request is budgeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Health check; never limited.
    Health,
    /// A page view.
    Page,
    /// An AJAX call or form post that runs a handler.
    Handler,
}

impl RequestClass {
    #[must_use]
    pub fn of(request: &Request<Body>) -> Self {
        if request.uri().path() == "/health" {
            Self::Health
        } else if request.method() == Method::POST
            || request.headers().contains_key(AJAX_HANDLER_HEADER)
        {
            Self::Handler
        } else {
            Self::Page
        }
    }
}

// =============================================================================
// RATE LIMITERS
// =============================================================================

pub type GlobalRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// `None` when `requests_per_second` is zero.
pub fn create_rate_limiter(requests_per_second: u32) -> Option<GlobalRateLimiter> {
    let rps = NonZeroU32::new(requests_per_second)?;
    Some(Arc::new(RateLimiter::direct(Quota::per_second(rps))))
}

/// Budgets for page views and handler requests.
#[derive(Clone, Default)]
pub struct RateLimits {
    pages: Option<GlobalRateLimiter>,
    handlers: Option<GlobalRateLimiter>,
}

impl RateLimits {
    /// Requests per second for each class; zero leaves a class unlimited.
    #[must_use]
    pub fn new(page_rps: u32, handler_rps: u32) -> Self {
        Self {
            pages: create_rate_limiter(page_rps),
            handlers: create_rate_limiter(handler_rps),
        }
    }

    /// Read `OCTOBER_RATE_LIMIT` and `OCTOBER_HANDLER_RATE_LIMIT`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(
            env_rate("OCTOBER_RATE_LIMIT", DEFAULT_PAGE_RPS),
            env_rate("OCTOBER_HANDLER_RATE_LIMIT", DEFAULT_HANDLER_RPS),
        )
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.pages.is_some() || self.handlers.is_some()
    }

    fn limiter(&self, class: RequestClass) -> Option<&GlobalRateLimiter> {
        match class {
            RequestClass::Health => None,
            RequestClass::Page => self.pages.as_ref(),
            RequestClass::Handler => self.handlers.as_ref(),
        }
    }

    /// Whether a request of `class` may proceed now.
    #[must_use]
    pub fn admit(&self, class: RequestClass) -> bool {
        self.limiter(class).is_none_or(|limiter| limiter.check().is_ok())
    }
}

fn env_rate(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Answer 429 once the request's budget runs dry.
pub async fn rate_limit_middleware(
    State(limits): State<RateLimits>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, (StatusCode, &'static str)> {
    let class = RequestClass::of(&request);
    if limits.admit(class) {
        return Ok(next.run(request).await);
    }
    tracing::warn!(path = %request.uri().path(), ?class, "rate limit exceeded");
    Err((StatusCode::TOO_MANY_REQUESTS, "Too Many Requests"))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, path: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .expect("request")
    }

    #[test]
    fn classifies_requests() {
        assert_eq!(RequestClass::of(&request(Method::GET, "/health")), RequestClass::Health);
        assert_eq!(RequestClass::of(&request(Method::GET, "/blog/x")), RequestClass::Page);
        assert_eq!(RequestClass::of(&request(Method::POST, "/contact")), RequestClass::Handler);

        let mut ajax = request(Method::GET, "/contact");
        ajax.headers_mut().insert(
            "x-october-request-handler",
            axum::http::HeaderValue::from_static("onSend"),
        );
        assert_eq!(RequestClass::of(&ajax), RequestClass::Handler);
    }

    #[test]
    fn zero_rate_disables_class() {
        let limits = RateLimits::new(0, 1);
        for _ in 0..50 {
            assert!(limits.admit(RequestClass::Page));
        }
        assert!(limits.admit(RequestClass::Handler));
        assert!(!limits.admit(RequestClass::Handler));
    }

    #[test]
    fn health_is_never_limited() {
        let limits = RateLimits::new(1, 1);
        for _ in 0..50 {
            assert!(limits.admit(RequestClass::Health));
        }
        assert!(!RateLimits::new(0, 0).is_enabled());
    }
}
