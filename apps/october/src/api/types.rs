//! # HTTP Conversion Types
//!
//! Translation between axum requests/responses and the engine's
//! `CmsRequest`/`CmsResponse`, plus the CSRF cookie.
//!
//! CSRF protection is double-submit: the `october_csrf` cookie becomes the
//! session token, and forms echo it back in `_token` (or the AJAX
//! framework in `X-CSRF-TOKEN`). Visitors without the cookie get a fresh
//! token, exposed to templates as `this.session.csrf_token`.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use october_core::{CmsRequest, CmsResponse, ResponseBody};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Cookie carrying the visitor's CSRF token.
pub const CSRF_COOKIE: &str = "october_csrf";

/// Session value exposing the token to templates.
const CSRF_SESSION_KEY: &str = "csrf_token";

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub theme: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(theme: &str) -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            theme: theme.to_string(),
        }
    }
}

// =============================================================================
// CSRF TOKENS
// =============================================================================

/// A fresh 64-hex-digit token from 32 random bytes.
fn mint_token() -> String {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    blake3::hash(&nonce).to_hex().to_string()
}

/// Value of cookie `name` from the `Cookie` headers.
#[must_use]
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

// =============================================================================
// REQUEST CONVERSION
// =============================================================================

/// Build the engine request.
///
/// Returns the token minted for this visitor when they had no cookie yet.
#[must_use]
pub fn to_cms_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    post: BTreeMap<String, String>,
) -> (CmsRequest, Option<String>) {
    let url = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());

    let mut request = CmsRequest::get(url);
    request.method = method.as_str().to_string();
    request.post = post;
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            request.headers.insert(name.as_str().to_string(), value.to_string());
        }
    }

    let (token, minted) = match cookie_value(headers, CSRF_COOKIE) {
        Some(token) => (token.to_string(), None),
        None => {
            let token = mint_token();
            (token.clone(), Some(token))
        }
    };
    request
        .session
        .values
        .insert(CSRF_SESSION_KEY.to_string(), Value::from(token.as_str()));
    request.session.token = Some(token);

    (request, minted)
}

// =============================================================================
// RESPONSE CONVERSION
// =============================================================================

/// Turn an engine response into an HTTP response, setting the CSRF cookie
/// when a token was minted.
pub fn from_cms_response(response: CmsResponse, minted_token: Option<&str>) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let (content_type, body) = match response.body {
        ResponseBody::Html(html) => (Some("text/html; charset=utf-8"), Body::from(html)),
        ResponseBody::Json(value) => (Some("application/json"), Body::from(value.to_string())),
        ResponseBody::Text(text) => (Some("text/plain; charset=utf-8"), Body::from(text)),
        ResponseBody::Empty => (None, Body::empty()),
    };

    let mut http = (status, body).into_response();
    let headers = http.headers_mut();
    if let Some(content_type) = content_type {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    for (name, value) in &response.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "dropping invalid response header"),
        }
    }
    if let Some(token) = minted_token {
        let cookie = format!("{}={}; Path=/; SameSite=Lax", CSRF_COOKIE, token);
        if let Ok(value) = HeaderValue::try_from(cookie) {
            headers.append(header::SET_COOKIE, value);
        }
    }
    http
}
