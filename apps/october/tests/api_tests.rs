//! Integration tests for the October HTTP server.
//!
//! Uses axum-test to drive the router over an on-disk theme without
//! starting a real server.

#![allow(clippy::unwrap_used, clippy::panic)]

use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum_test::TestServer;
use october::api::{
    AppState, CSRF_COOKIE, HealthResponse, RateLimits, create_router, create_router_with_limits,
};
use october_core::{CmsConfig, CmsError, HandlerResult, PageCode, PageContext, Site};
use serde_json::{Map, Value, json};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const HANDLER_HEADER: HeaderName = HeaderName::from_static("x-october-request-handler");

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// A `demo` theme on disk with a layout, pages, a partial and an error page.
fn create_theme() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let theme = dir.path().join("demo");
    write(&theme, "theme.toml", "name = \"Demo\"\nauthor = \"October\"\n");
    write(
        &theme,
        "layouts/default.htm",
        "description = \"Default layout\"\n==\n<html><title>{{ this.page.title }}</title><body>{% page %}</body></html>",
    );
    write(
        &theme,
        "pages/home.htm",
        "url = \"/\"\nlayout = \"default\"\ntitle = \"Home\"\n==\n<h1>{{ this.theme.name }}</h1>",
    );
    write(
        &theme,
        "pages/blog/post.htm",
        "url = \"/blog/:slug\"\nlayout = \"default\"\ntitle = \"Post\"\n==\n<article>{{ this.param.slug }}</article>",
    );
    write(
        &theme,
        "pages/contact.htm",
        "url = \"/contact\"\n==\n<form><input name=\"_token\" value=\"{{ this.session.csrf_token }}\"></form>{{ message|default('') }}",
    );
    write(&theme, "pages/404.htm", "url = \"/404\"\n==\n<p>Nothing here</p>");
    write(&theme, "partials/notice.htm", "<p>{{ message|default('none') }}</p>");
    dir
}

#[derive(Default)]
struct ContactCode;

impl PageCode for ContactCode {
    fn has_handler(&self, name: &str) -> bool {
        name == "onSend"
    }

    fn run_handler(&mut self, _name: &str, ctx: &mut PageContext) -> Result<HandlerResult, CmsError> {
        let name = ctx.input("name").unwrap_or("stranger").to_string();
        ctx.set_var("message", format!("Thanks {}", name));
        let mut data = Map::new();
        data.insert("sent".to_string(), Value::from(true));
        Ok(HandlerResult::Data(data))
    }
}

fn create_site(dir: &TempDir, csrf: bool) -> Site {
    let mut config = CmsConfig::default();
    config.themes_path = dir.path().to_path_buf();
    config.storage_path = dir.path().join("storage");
    config.active_theme = "demo".to_string();
    config.testing = true;
    config.enable_csrf_protection = csrf;

    let mut site = Site::new(config).unwrap();
    site.code_mut().register("pages/contact.htm", || ContactCode);
    site
}

fn create_test_server(csrf: bool) -> (TestServer, TempDir) {
    let dir = create_theme();
    let site = create_site(&dir, csrf);
    let server = TestServer::new(create_router(AppState::new(site))).unwrap();
    (server, dir)
}

// =============================================================================
// HEALTH
// =============================================================================

#[tokio::test]
async fn test_health() {
    let (server, _dir) = create_test_server(false);
    let response = server.get("/health").await;
    response.assert_status_ok();
    let health: HealthResponse = response.json();
    assert_eq!(health.status, "ok");
    assert_eq!(health.theme, "demo");
}

// =============================================================================
// PAGES
// =============================================================================

#[tokio::test]
async fn test_home_page_with_layout() {
    let (server, _dir) = create_test_server(false);
    let response = server.get("/").await;
    response.assert_status_ok();
    assert_eq!(
        response.text(),
        "<html><title>Home</title><body><h1>Demo</h1></body></html>"
    );
    let content_type = response.header("content-type");
    assert!(content_type.to_str().unwrap().starts_with("text/html"));
}

#[tokio::test]
async fn test_route_parameters() {
    let (server, _dir) = create_test_server(false);
    let response = server.get("/blog/hello-world").await;
    response.assert_status_ok();
    assert!(response.text().contains("<article>hello-world</article>"));
}

#[tokio::test]
async fn test_query_string_is_ignored_for_routing() {
    let (server, _dir) = create_test_server(false);
    let response = server.get("/blog/first?utm=x").await;
    response.assert_status_ok();
    assert!(response.text().contains("<article>first</article>"));
}

#[tokio::test]
async fn test_not_found_uses_theme_page() {
    let (server, _dir) = create_test_server(false);
    let response = server.get("/missing/page").await;
    response.assert_status_not_found();
    assert_eq!(response.text(), "<p>Nothing here</p>");
}

// =============================================================================
// AJAX
// =============================================================================

#[tokio::test]
async fn test_ajax_handler_with_partial() {
    let (server, _dir) = create_test_server(false);
    let response = server
        .post("/contact")
        .add_header(HANDLER_HEADER, HeaderValue::from_static("onSend"))
        .add_header(
            HeaderName::from_static("x-october-request-partials"),
            HeaderValue::from_static("notice"),
        )
        .form(&[("name", "Ada")])
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["sent"], json!(true));
    assert_eq!(body["notice"], json!("<p>Thanks Ada</p>"));
}

#[tokio::test]
async fn test_ajax_unknown_handler_is_plain_text_error() {
    let (server, _dir) = create_test_server(false);
    let response = server
        .post("/contact")
        .add_header(HANDLER_HEADER, HeaderValue::from_static("onMissing"))
        .await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.text(), "AJAX handler 'onMissing' was not found.");
}

// =============================================================================
// CSRF
// =============================================================================

#[tokio::test]
async fn test_first_visit_sets_csrf_cookie() {
    let (server, _dir) = create_test_server(true);
    let response = server.get("/contact").await;
    response.assert_status_ok();
    let cookie = response.cookie(CSRF_COOKIE);
    assert_eq!(cookie.value().len(), 64);
    assert!(response.text().contains(cookie.value()));
}

#[tokio::test]
async fn test_postback_requires_matching_token() {
    let (server, _dir) = create_test_server(true);
    let cookie = format!("{}=secret-token", CSRF_COOKIE);

    let forged = server
        .post("/contact")
        .add_header(header::COOKIE, cookie.parse::<HeaderValue>().unwrap())
        .form(&[("_handler", "onSend"), ("_token", "forged"), ("name", "Eve")])
        .await;
    forged.assert_status_ok();
    assert!(!forged.text().contains("Thanks"));

    let genuine = server
        .post("/contact")
        .add_header(header::COOKIE, cookie.parse::<HeaderValue>().unwrap())
        .form(&[("_handler", "onSend"), ("_token", "secret-token"), ("name", "Ada")])
        .await;
    genuine.assert_status_ok();
    assert!(genuine.text().contains("Thanks Ada"));
}

#[tokio::test]
async fn test_ajax_without_token_is_forbidden() {
    let (server, _dir) = create_test_server(true);
    let response = server
        .post("/contact")
        .add_header(HANDLER_HEADER, HeaderValue::from_static("onSend"))
        .await;
    response.assert_status(StatusCode::FORBIDDEN);
}

// =============================================================================
// RATE LIMITING
// =============================================================================

#[tokio::test]
async fn test_rate_limits_by_request_class() {
    let dir = create_theme();
    let site = create_site(&dir, false);
    let router = create_router_with_limits(AppState::new(site), RateLimits::new(1, 1));
    let server = TestServer::new(router).unwrap();

    for _ in 0..5 {
        server.get("/health").await.assert_status_ok();
    }

    server.get("/").await.assert_status_ok();
    server.get("/").await.assert_status(StatusCode::TOO_MANY_REQUESTS);

    // Handler requests draw on their own budget.
    let ajax = || {
        server
            .post("/contact")
            .add_header(HANDLER_HEADER, HeaderValue::from_static("onSend"))
    };
    ajax().await.assert_status_ok();
    ajax().await.assert_status(StatusCode::TOO_MANY_REQUESTS);
}
