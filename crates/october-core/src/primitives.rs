//! # Engine Primitives
//!
//! Fixed constants of the engine: wire-protocol names, reserved
//! identifiers, file-format markers and input limits.

// =============================================================================
// AJAX WIRE PROTOCOL
// =============================================================================

/// Request header naming the AJAX handler to run.
pub const AJAX_HANDLER_HEADER: &str = "X-OCTOBER-REQUEST-HANDLER";

/// Request header listing partials to re-render (`&`-separated).
pub const AJAX_PARTIALS_HEADER: &str = "X-OCTOBER-REQUEST-PARTIALS";

/// Request header asking for flash messages in the response.
pub const AJAX_FLASH_HEADER: &str = "X-OCTOBER-REQUEST-FLASH";

/// Response key carrying a redirect target for the AJAX client.
pub const AJAX_REDIRECT_KEY: &str = "X_OCTOBER_REDIRECT";

/// Response key carrying flash messages.
pub const AJAX_FLASH_KEY: &str = "X_OCTOBER_FLASH_MESSAGES";

/// Response key carrying per-field validation errors.
pub const AJAX_ERROR_FIELDS_KEY: &str = "X_OCTOBER_ERROR_FIELDS";

/// Response key carrying the validation summary message.
pub const AJAX_ERROR_MESSAGE_KEY: &str = "X_OCTOBER_ERROR_MESSAGE";

/// Status code of an AJAX validation failure.
pub const AJAX_VALIDATION_STATUS: u16 = 406;

/// Form field naming a postback handler.
pub const POSTBACK_HANDLER_FIELD: &str = "_handler";

/// Form field carrying the CSRF token.
pub const CSRF_TOKEN_FIELD: &str = "_token";

/// Request header carrying the CSRF token of an AJAX request.
pub const CSRF_TOKEN_HEADER: &str = "X-CSRF-TOKEN";

/// Valid handler names: `onSomething` or `alias::onSomething`.
pub const AJAX_HANDLER_PATTERN: &str = r"^(?:\w+::)?on[A-Z]\w*$";

/// Valid partial names: optional `alias::` or `@` prefix, then a path.
pub const PARTIAL_NAME_PATTERN: &str = r"(?i)^(?:\w+::|@)?[a-z0-9_\-./]+$";

// =============================================================================
// RESERVED NAMES
// =============================================================================

/// Component code reserved for the built-in ViewBag.
pub const VIEW_BAG_CODE: &str = "viewBag";

/// Settings key holding component declarations after parsing.
pub const COMPONENTS_KEY: &str = "components";

/// Markup of the synthesized fallback layout.
pub const FALLBACK_LAYOUT_MARKUP: &str = "{% page %}";

/// File name given to the synthesized fallback layout.
pub const FALLBACK_LAYOUT_NAME: &str = "__fallback.htm";

/// Default extension of theme objects.
pub const DEFAULT_EXTENSION: &str = "htm";

/// URL of the theme's custom not-found page.
pub const NOT_FOUND_URL: &str = "/404";

/// URL of the theme's custom error page.
pub const ERROR_URL: &str = "/error";

/// Owner label of components registered by engine modules.
pub const MODULE_OWNER: &str = "module";

// =============================================================================
// ROUTE MANIFEST FORMAT
// =============================================================================

/// Magic bytes of a baked route manifest.
pub const MANIFEST_MAGIC: &[u8; 4] = b"OCRM";

/// Current route manifest format version.
pub const MANIFEST_VERSION: u8 = 1;

// =============================================================================
// INPUT LIMITS
// =============================================================================

/// Longest URL the router will try to match.
pub const MAX_URL_LENGTH: usize = 2048;

/// Deepest partial nesting before rendering is aborted.
pub const MAX_PARTIAL_DEPTH: usize = 64;

/// Largest theme object the loader accepts (4 MB).
pub const MAX_OBJECT_SIZE: u64 = 4 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_magic_correct() {
        assert_eq!(MANIFEST_MAGIC, b"OCRM");
    }

    #[test]
    fn fallback_layout_renders_page_only() {
        assert_eq!(FALLBACK_LAYOUT_MARKUP, "{% page %}");
    }
}
