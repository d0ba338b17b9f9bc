//! # HTTP Handlers

use super::{
    AppState,
    types::{HealthResponse, from_cms_response, to_cms_request},
};
use axum::{
    Form, Json,
    body::{Body, Bytes},
    extract::{FromRequest, Request, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// HEALTH HANDLER
// =============================================================================

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse::new(&state.site.config().active_theme))
}

// =============================================================================
// PAGE HANDLER
// =============================================================================

/// Serve any path through the engine on the blocking pool.
pub async fn page_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let post = if method == Method::POST {
        decode_form(&headers, body).await
    } else {
        BTreeMap::new()
    };
    let (request, minted) = to_cms_request(&method, &uri, &headers, post);

    let site = Arc::clone(&state.site);
    match tokio::task::spawn_blocking(move || site.handle(request)).await {
        Ok(response) => from_cms_response(response, minted.as_deref()),
        Err(e) => {
            tracing::error!(error = %e, path = %uri.path(), "engine task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

/// Decode a urlencoded form body; other bodies yield no fields.
async fn decode_form(headers: &HeaderMap, body: Bytes) -> BTreeMap<String, String> {
    let Some(content_type) = headers.get(header::CONTENT_TYPE) else {
        return BTreeMap::new();
    };
    let is_form = content_type
        .to_str()
        .is_ok_and(|v| v.starts_with("application/x-www-form-urlencoded"));
    if !is_form {
        tracing::debug!("POST body is not a urlencoded form, ignoring");
        return BTreeMap::new();
    }

    let request = match Request::builder()
        .method(Method::POST)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
    {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "cannot rebuild form request");
            return BTreeMap::new();
        }
    };
    match Form::<BTreeMap<String, String>>::from_request(request, &()).await {
        Ok(Form(fields)) => fields,
        Err(e) => {
            tracing::warn!(error = %e, "malformed form body");
            BTreeMap::new()
        }
    }
}
