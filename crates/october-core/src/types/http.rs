//! Request and response model handed between the HTTP layer and the engine.
//!
//! The engine never touches sockets; the binary converts to and from these.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::primitives::{
    AJAX_FLASH_HEADER, AJAX_HANDLER_HEADER, AJAX_PARTIALS_HEADER, POSTBACK_HANDLER_FIELD,
};

/// Session state the HTTP layer carried in for this request.
#[derive(Debug, Clone, Default)]
pub struct SessionData {
    /// CSRF token bound to the visitor.
    pub token: Option<String>,
    /// Flash messages keyed by type (`success`, `error`, ...).
    pub flash: BTreeMap<String, String>,
    /// Field errors left by a previous failed postback.
    pub errors: BTreeMap<String, Vec<String>>,
    /// Input of a previous failed postback.
    pub old_input: BTreeMap<String, String>,
    /// Free-form session values exposed as `this.session`.
    pub values: Map<String, Value>,
}

/// A single HTTP request as seen by the engine.
#[derive(Debug, Clone)]
pub struct CmsRequest {
    pub method: String,
    pub url: String,
    /// Header names are stored lowercase.
    pub headers: BTreeMap<String, String>,
    /// Decoded form fields of a POST body.
    pub post: BTreeMap<String, String>,
    pub session: SessionData,
    /// Set when a backend user is signed in; unlocks hidden pages and
    /// bypasses maintenance mode.
    pub backend_user: bool,
}

impl CmsRequest {
    /// A bare GET request for `url`.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            post: BTreeMap::new(),
            session: SessionData::default(),
            backend_user: false,
        }
    }

    /// A POST request for `url` with form fields.
    #[must_use]
    pub fn post(url: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        Self {
            method: "POST".to_string(),
            post: fields,
            ..Self::get(url)
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    #[must_use]
    pub fn is_post(&self) -> bool {
        self.method.eq_ignore_ascii_case("POST")
    }

    /// True when the client is an AJAX framework request.
    #[must_use]
    pub fn is_ajax(&self) -> bool {
        self.ajax_handler().is_some()
            || self
                .header("x-requested-with")
                .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
    }

    /// Handler named by the AJAX handler header.
    #[must_use]
    pub fn ajax_handler(&self) -> Option<&str> {
        self.header(AJAX_HANDLER_HEADER)
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }

    /// Partials requested alongside an AJAX handler (`&`-separated).
    #[must_use]
    pub fn ajax_partials(&self) -> Vec<String> {
        self.header(AJAX_PARTIALS_HEADER)
            .map(|raw| {
                raw.split('&')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn wants_flash(&self) -> bool {
        self.header(AJAX_FLASH_HEADER).is_some()
    }

    /// Handler named by a plain form postback.
    #[must_use]
    pub fn postback_handler(&self) -> Option<&str> {
        if !self.is_post() {
            return None;
        }
        self.post
            .get(POSTBACK_HANDLER_FIELD)
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
    }
}

/// Body of an engine response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Html(String),
    Json(Value),
    Text(String),
    Empty,
}

/// Response produced by the engine, or by a hook that short-circuits it.
#[derive(Debug, Clone, PartialEq)]
pub struct CmsResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

impl CmsResponse {
    #[must_use]
    pub fn html(status: u16, html: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: ResponseBody::Html(html.into()),
        }
    }

    #[must_use]
    pub fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: ResponseBody::Json(value),
        }
    }

    #[must_use]
    pub fn text(status: u16, text: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: ResponseBody::Text(text.into()),
        }
    }

    /// A 302 redirect.
    #[must_use]
    pub fn redirect(location: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("location".to_string(), location.into());
        Self {
            status: 302,
            headers,
            body: ResponseBody::Empty,
        }
    }

    #[must_use]
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status) && self.headers.contains_key("location")
    }

    #[must_use]
    pub fn location(&self) -> Option<&str> {
        self.headers.get("location").map(String::as_str)
    }

    /// Rendered HTML, if this is an HTML response.
    #[must_use]
    pub fn html_body(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Html(html) => Some(html),
            _ => None,
        }
    }
}

/// What an AJAX or postback handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerResult {
    /// Nothing to return; requested partials are still rendered.
    Empty,
    /// Key/value data merged into the AJAX response.
    Data(Map<String, Value>),
    /// Redirect the browser.
    Redirect(String),
    /// A complete response that replaces the default one.
    Response(CmsResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ajax_partials_split_on_ampersand() {
        let request = CmsRequest::get("/")
            .with_header("X-OCTOBER-REQUEST-HANDLER", "onSave")
            .with_header("X-OCTOBER-REQUEST-PARTIALS", "cart& totals &");

        assert!(request.is_ajax());
        assert_eq!(request.ajax_handler(), Some("onSave"));
        assert_eq!(request.ajax_partials(), vec!["cart", "totals"]);
    }

    #[test]
    fn postback_requires_post() {
        let mut fields = BTreeMap::new();
        fields.insert("_handler".to_string(), "onSubscribe".to_string());

        let post = CmsRequest::post("/", fields.clone());
        assert_eq!(post.postback_handler(), Some("onSubscribe"));

        let mut get = CmsRequest::get("/");
        get.post = fields;
        assert_eq!(get.postback_handler(), None);
    }

    #[test]
    fn redirect_detection() {
        let response = CmsResponse::redirect("/thanks");
        assert!(response.is_redirect());
        assert_eq!(response.location(), Some("/thanks"));
        assert!(!CmsResponse::html(200, "ok").is_redirect());
    }
}
