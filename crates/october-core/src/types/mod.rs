//! # Core Type Definitions
//!
//! This module contains the types shared by every part of the engine:
//! - Object identity (`ObjectKind`, `ObjectRef`)
//! - Routing parameters (`RouteParams`)
//! - Request/response model (`CmsRequest`, `CmsResponse`, `HandlerResult`)
//! - Error types (`CmsError`, `ErrorPhase`)

mod http;

pub use http::{CmsRequest, CmsResponse, HandlerResult, ResponseBody, SessionData};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// =============================================================================
// OBJECT IDENTITY
// =============================================================================

/// The kind of theme object a file belongs to.
///
/// Each kind lives in its own theme sub-directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Page,
    Layout,
    Partial,
    Content,
}

impl ObjectKind {
    /// Theme sub-directory holding objects of this kind.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Page => "pages",
            Self::Layout => "layouts",
            Self::Partial => "partials",
            Self::Content => "content",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Page => "page",
            Self::Layout => "layout",
            Self::Partial => "partial",
            Self::Content => "content",
        };
        f.write_str(name)
    }
}

/// Points at one theme object, used for error attribution and cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub file_name: String,
}

impl ObjectRef {
    #[must_use]
    pub fn new(kind: ObjectKind, file_name: impl Into<String>) -> Self {
        Self {
            kind,
            file_name: file_name.into(),
        }
    }

    /// Theme-relative path, e.g. `pages/blog/post.htm`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{}/{}", self.kind.dir_name(), self.file_name)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

// =============================================================================
// ROUTING PARAMETERS
// =============================================================================

/// Ordered name → value map extracted while matching a URL.
///
/// Order follows the parameter order of the matched pattern. Backed by a
/// vector so it serializes with postcard and keeps insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteParams(Vec<(String, String)>);

impl RouteParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter, replacing an existing value in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Overlay `other` on top of `self`; values in `other` win.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for (k, v) in other.iter() {
            merged.insert(k, v);
        }
        merged
    }

    /// Template-facing view (`this.param`).
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RouteParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Execution phase an object was in when an error was raised.
///
/// Attached to masked errors so a failure is reported against the exact
/// page, layout or partial that was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorPhase {
    /// Settings parsing and code-section initialisation.
    CodeInit,
    /// Lifecycle hooks and handlers.
    Execution,
    /// Markup rendering.
    Render,
}

impl ErrorPhase {
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::CodeInit => 200,
            Self::Execution => 300,
            Self::Render => 400,
        }
    }
}

/// Errors that can occur in the engine.
///
/// A missing route is never an error; routing misses are `None`.
/// Hook short-circuits are results, not errors.
#[derive(Debug, Error)]
pub enum CmsError {
    /// The active or requested theme does not exist.
    #[error("The theme '{0}' is not found.")]
    ThemeNotFound(String),

    /// A page declared a layout that is not in the theme.
    #[error("The layout '{0}' is not found.")]
    LayoutNotFound(String),

    /// A partial requested by markup or an AJAX request is missing.
    #[error("The partial '{0}' is not found.")]
    PartialNotFound(String),

    /// A content file requested by markup is missing.
    #[error("The content file '{0}' is not found.")]
    ContentNotFound(String),

    /// A component could not be resolved by name, code or class.
    #[error("A component with the name '{0}' is not found.")]
    ComponentNotFound(String),

    /// No component in scope carries the alias.
    #[error("A component with the alias '{0}' is not found in the page.")]
    ComponentAliasNotFound(String),

    /// Something other than the built-in ViewBag tried to claim `viewBag`.
    #[error("The component code 'viewBag' is reserved and cannot be registered by '{0}'.")]
    ReservedComponentCode(String),

    /// Handler name fails `^(?:\w+::)?on[A-Z]\w*$`.
    #[error("Invalid AJAX handler name: {0}.")]
    InvalidAjaxHandler(String),

    /// No page, layout or component method answers the handler.
    #[error("AJAX handler '{0}' was not found.")]
    AjaxHandlerNotFound(String),

    /// Requested partial name contains forbidden characters.
    #[error("Invalid partial name: {0}.")]
    InvalidPartialName(String),

    /// The settings section is not valid INI.
    #[error("Error parsing the settings section on line {line}: {message}")]
    IniSyntax { line: usize, message: String },

    /// Field-keyed validation failure raised by handlers or settings.
    #[error("{message}")]
    Validation {
        message: String,
        fields: BTreeMap<String, Vec<String>>,
    },

    /// Markup could not be parsed or violated the sandbox policy.
    #[error("Template error: {0}")]
    Template(String),

    /// Error raised by host code (page code, component, plugin).
    #[error("{0}")]
    Application(String),

    /// Bad configuration file or value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),

    /// An error attributed to the object and phase that produced it.
    #[error("{source} (in {object}, phase {})", phase.code())]
    Masked {
        object: ObjectRef,
        phase: ErrorPhase,
        source: Box<CmsError>,
    },
}

impl CmsError {
    /// Build a single-field validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut fields = BTreeMap::new();
        fields.insert(field.into(), vec![message.clone()]);
        Self::Validation { message, fields }
    }

    /// Attribute this error to an object and phase.
    ///
    /// An error that is already masked keeps its innermost attribution.
    #[must_use]
    pub fn mask(self, object: &ObjectRef, phase: ErrorPhase) -> Self {
        match self {
            masked @ Self::Masked { .. } => masked,
            other => Self::Masked {
                object: object.clone(),
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The error with any masking removed.
    #[must_use]
    pub fn unmasked(&self) -> &Self {
        match self {
            Self::Masked { source, .. } => source.unmasked(),
            other => other,
        }
    }

    /// Message and per-field errors if this is a validation failure.
    #[must_use]
    pub fn validation_fields(&self) -> Option<(&str, &BTreeMap<String, Vec<String>>)> {
        match self.unmasked() {
            Self::Validation { message, fields } => Some((message, fields)),
            _ => None,
        }
    }

    /// Errors whose text must never reach a production visitor.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(
            self.unmasked(),
            Self::Io(_) | Self::Serialization(_) | Self::Config(_)
        )
    }

    /// Stable translation key for the message.
    #[must_use]
    pub fn lang_key(&self) -> &'static str {
        match self.unmasked() {
            Self::ThemeNotFound(_) => "cms::lang.theme.not_found",
            Self::LayoutNotFound(_) => "cms::lang.layout.not_found_name",
            Self::PartialNotFound(_) => "cms::lang.partial.not_found_name",
            Self::ContentNotFound(_) => "cms::lang.content.not_found_name",
            Self::ComponentNotFound(_) => "cms::lang.component.not_found",
            Self::ComponentAliasNotFound(_) => "cms::lang.component.alias_not_found",
            Self::ReservedComponentCode(_) => "cms::lang.component.reserved_code",
            Self::InvalidAjaxHandler(_) => "cms::lang.ajax_handler.invalid_name",
            Self::AjaxHandlerNotFound(_) => "cms::lang.ajax_handler.not_found",
            Self::InvalidPartialName(_) => "cms::lang.partial.invalid_name",
            Self::IniSyntax { .. } => "cms::lang.cms_object.invalid_ini",
            Self::Validation { .. } => "system::lang.validation.failed",
            Self::Template(_) => "cms::lang.template.syntax_error",
            Self::Application(_) => "system::lang.app.error",
            Self::Config(_) => "system::lang.config.invalid",
            Self::Serialization(_) | Self::Io(_) => "system::lang.page.custom_error",
            Self::Masked { .. } => "cms::lang.cms_object.error",
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_params_keep_insertion_order() {
        let mut params = RouteParams::new();
        params.insert("year", "2024");
        params.insert("slug", "hello");
        params.insert("year", "2025");

        let pairs: Vec<_> = params.iter().collect();
        assert_eq!(pairs, vec![("year", "2025"), ("slug", "hello")]);
    }

    #[test]
    fn route_params_merge_prefers_overlay() {
        let base: RouteParams = [("a", "1"), ("b", "2")].into_iter().collect();
        let overlay: RouteParams = [("b", "3")].into_iter().collect();

        let merged = base.merged(&overlay);
        assert_eq!(merged.get("a"), Some("1"));
        assert_eq!(merged.get("b"), Some("3"));
    }

    #[test]
    fn mask_keeps_innermost_attribution() {
        let partial = ObjectRef::new(ObjectKind::Partial, "nav.htm");
        let page = ObjectRef::new(ObjectKind::Page, "home.htm");

        let err = CmsError::PartialNotFound("menu".into())
            .mask(&partial, ErrorPhase::Render)
            .mask(&page, ErrorPhase::Render);

        match err {
            CmsError::Masked { object, phase, .. } => {
                assert_eq!(object, partial);
                assert_eq!(phase.code(), 400);
            }
            other => unreachable!("expected masked error, got {other:?}"),
        }
    }

    #[test]
    fn validation_fields_seen_through_mask() {
        let page = ObjectRef::new(ObjectKind::Page, "contact.htm");
        let err = CmsError::validation("email", "The email field is required.")
            .mask(&page, ErrorPhase::Execution);

        let (message, fields) = err.validation_fields().expect("validation");
        assert_eq!(message, "The email field is required.");
        assert_eq!(fields["email"], vec!["The email field is required."]);
        assert_eq!(err.lang_key(), "system::lang.validation.failed");
    }

    #[test]
    fn object_ref_path() {
        let r = ObjectRef::new(ObjectKind::Page, "blog/post.htm");
        assert_eq!(r.path(), "pages/blog/post.htm");
    }
}
