//! AJAX and postback handler dispatch.
//!
//! Handlers are searched in a fixed order and the first match wins:
//! `alias::onHandler` on the named component, the page code, the layout
//! code (never for the fallback layout), then page components followed
//! by layout components.

use super::{Controller, Slot};
use crate::object::CompoundObject;
use crate::primitives::{
    AJAX_ERROR_FIELDS_KEY, AJAX_ERROR_MESSAGE_KEY, AJAX_FLASH_KEY, AJAX_HANDLER_PATTERN,
    AJAX_REDIRECT_KEY, AJAX_VALIDATION_STATUS, CSRF_TOKEN_FIELD, CSRF_TOKEN_HEADER,
    PARTIAL_NAME_PATTERN,
};
use crate::types::{CmsResponse, HandlerResult};
use crate::{CmsError, ErrorPhase};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use subtle::ConstantTimeEq;

static HANDLER_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(AJAX_HANDLER_PATTERN).ok());

static PARTIAL_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(PARTIAL_NAME_PATTERN).ok());

/// `onSave` and `alias::onSave` pass; `onsave` and `save` do not.
#[must_use]
pub fn is_valid_handler_name(name: &str) -> bool {
    HANDLER_NAME.as_ref().is_some_and(|re| re.is_match(name))
}

#[must_use]
pub fn is_valid_partial_name(name: &str) -> bool {
    PARTIAL_NAME.as_ref().is_some_and(|re| re.is_match(name)) && !name.contains("..")
}

fn validation_response(message: &str, fields: &BTreeMap<String, Vec<String>>) -> CmsResponse {
    let fields: Map<String, Value> = fields
        .iter()
        .map(|(field, messages)| (field.clone(), Value::from(messages.clone())))
        .collect();
    let mut body = Map::new();
    body.insert(AJAX_ERROR_MESSAGE_KEY.to_string(), Value::from(message));
    body.insert(AJAX_ERROR_FIELDS_KEY.to_string(), Value::Object(fields));
    CmsResponse::json(AJAX_VALIDATION_STATUS, Value::Object(body))
}

impl Controller<'_> {
    /// Run the AJAX handler named by the request header, if any.
    pub(super) fn exec_ajax_handlers(
        &mut self,
        page: &CompoundObject,
        layout: &CompoundObject,
    ) -> Result<Option<CmsResponse>, CmsError> {
        let Some(handler) = self.ctx.request.ajax_handler().map(str::to_string) else {
            return Ok(None);
        };
        if !self.verify_csrf_token() {
            tracing::warn!(handler = %handler, "AJAX request rejected: invalid security token");
            return Ok(Some(CmsResponse::text(403, "Invalid security token.")));
        }
        if !is_valid_handler_name(&handler) {
            return Err(CmsError::InvalidAjaxHandler(handler));
        }
        let partials = self.ctx.request.ajax_partials();
        if let Some(bad) = partials.iter().find(|p| !is_valid_partial_name(p)) {
            return Err(CmsError::InvalidPartialName(bad.clone()));
        }

        tracing::debug!(handler = %handler, partials = partials.len(), "running AJAX handler");
        let depth = self.component_context.len();
        let response = self.ajax_response(handler, partials, page, layout);
        self.component_context.truncate(depth);
        response.map(Some)
    }

    /// Run the handler, then render the requested partials while the
    /// answering component stays in context.
    fn ajax_response(
        &mut self,
        handler: String,
        partials: Vec<String>,
        page: &CompoundObject,
        layout: &CompoundObject,
    ) -> Result<CmsResponse, CmsError> {
        let result = match self.run_ajax_handler(&handler, page, layout) {
            Ok(Some(result)) => result,
            Ok(None) => return Err(CmsError::AjaxHandlerNotFound(handler)),
            Err(err) => match err.validation_fields() {
                Some((message, fields)) => return Ok(validation_response(message, fields)),
                None => return Err(err),
            },
        };

        let mut body = Map::new();
        match result {
            HandlerResult::Empty => {}
            HandlerResult::Data(data) => body.extend(data),
            HandlerResult::Redirect(url) => {
                body.insert(AJAX_REDIRECT_KEY.to_string(), Value::String(url));
            }
            HandlerResult::Response(response) => match response.location() {
                Some(location) if response.is_redirect() => {
                    body.insert(AJAX_REDIRECT_KEY.to_string(), Value::from(location));
                }
                _ => return Ok(response),
            },
        }

        for partial in partials {
            let html = self.render_partial(&partial, Map::new())?;
            body.insert(partial, Value::String(html));
        }

        if self.ctx.request.wants_flash() {
            body.insert(AJAX_FLASH_KEY.to_string(), self.flash_messages());
        }

        Ok(CmsResponse::json(200, Value::Object(body)))
    }

    /// Run a `_handler` named by a plain form post.
    ///
    /// Data results become page variables. A validation failure is exposed
    /// through `errors` and rendering continues.
    pub(super) fn exec_postback_handler(
        &mut self,
        page: &CompoundObject,
        layout: &CompoundObject,
    ) -> Result<Option<CmsResponse>, CmsError> {
        let Some(handler) = self.ctx.request.postback_handler().map(str::to_string) else {
            return Ok(None);
        };
        if !is_valid_handler_name(&handler) {
            return Err(CmsError::InvalidAjaxHandler(handler));
        }
        if !self.verify_csrf_token() {
            tracing::warn!(handler = %handler, "postback ignored: invalid security token");
            return Ok(None);
        }

        let depth = self.component_context.len();
        let outcome = self.run_ajax_handler(&handler, page, layout);
        self.component_context.truncate(depth);
        let result = match outcome {
            Ok(Some(result)) => result,
            Ok(None) => return Err(CmsError::AjaxHandlerNotFound(handler)),
            Err(err) => match err.validation_fields() {
                Some((_, fields)) => {
                    let errors: Map<String, Value> = fields
                        .iter()
                        .map(|(field, messages)| (field.clone(), Value::from(messages.clone())))
                        .collect();
                    self.ctx.vars.insert("errors".to_string(), Value::Object(errors));
                    return Ok(None);
                }
                None => return Err(err),
            },
        };

        match result {
            HandlerResult::Empty => Ok(None),
            HandlerResult::Data(data) => {
                self.ctx.vars.extend(data);
                Ok(None)
            }
            HandlerResult::Redirect(url) => Ok(Some(CmsResponse::redirect(url))),
            HandlerResult::Response(response) => Ok(Some(response)),
        }
    }

    /// Find and run a handler. `Ok(None)` when nothing answers it.
    ///
    /// A component that answers is pushed onto the component context and
    /// left there; callers truncate the context when done.
    pub(super) fn run_ajax_handler(
        &mut self,
        handler: &str,
        page: &CompoundObject,
        layout: &CompoundObject,
    ) -> Result<Option<HandlerResult>, CmsError> {
        let page_ref = page.object_ref();
        let exec = |e: CmsError| e.mask(&page_ref, ErrorPhase::Execution);

        if let Some((alias, method)) = handler.split_once("::") {
            let slot = self
                .locate(alias)
                .ok_or_else(|| CmsError::ComponentAliasNotFound(alias.to_string()))?;
            let answers = self.component(slot).is_some_and(|c| c.has_handler(method));
            if !answers {
                return Err(CmsError::AjaxHandlerNotFound(handler.to_string()));
            }
            self.component_context.push(alias.to_string());
            return self
                .with_component(slot, |component, ctx| component.run_handler(method, ctx))
                .transpose()
                .map_err(exec);
        }

        if self.page_code.has_handler(handler) {
            return self
                .page_code
                .run_handler(handler, &mut self.ctx)
                .map(Some)
                .map_err(exec);
        }

        if !layout.is_fallback() && self.layout_code.has_handler(handler) {
            let layout_ref = layout.object_ref();
            return self
                .layout_code
                .run_handler(handler, &mut self.ctx)
                .map(Some)
                .map_err(|e| e.mask(&layout_ref, ErrorPhase::Execution));
        }

        let slot = self
            .page_components
            .iter()
            .position(|c| c.has_handler(handler))
            .map(Slot::Page)
            .or_else(|| {
                self.layout_components
                    .iter()
                    .position(|c| c.has_handler(handler))
                    .map(Slot::Layout)
            });
        let Some(slot) = slot else {
            return Ok(None);
        };
        if let Some(alias) = self.component(slot).map(|c| c.alias().to_string()) {
            self.component_context.push(alias);
        }
        self.with_component(slot, |component, ctx| component.run_handler(handler, ctx))
            .transpose()
            .map_err(exec)
    }

    /// The submitted token must equal the session token.
    fn verify_csrf_token(&self) -> bool {
        if !self.site.config().enable_csrf_protection {
            return true;
        }
        let request = &self.ctx.request;
        let Some(expected) = request.session.token.as_deref() else {
            return false;
        };
        let submitted = request
            .post
            .get(CSRF_TOKEN_FIELD)
            .map(String::as_str)
            .or_else(|| request.header(CSRF_TOKEN_HEADER));
        submitted.is_some_and(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())))
    }

    /// Session flash overlaid with messages set during this request.
    fn flash_messages(&self) -> Value {
        let mut messages = Map::new();
        for (kind, message) in self
            .ctx
            .request
            .session
            .flash
            .iter()
            .chain(self.ctx.flash.iter())
        {
            messages.insert(kind.clone(), Value::from(message.as_str()));
        }
        Value::Object(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_names() {
        assert!(is_valid_handler_name("onSave"));
        assert!(is_valid_handler_name("blogPost::onSave"));
        assert!(is_valid_handler_name("onX"));
        assert!(!is_valid_handler_name("onsave"));
        assert!(!is_valid_handler_name("save"));
        assert!(!is_valid_handler_name("a::b::onSave"));
        assert!(!is_valid_handler_name("onSave; drop"));
    }

    #[test]
    fn partial_names() {
        assert!(is_valid_partial_name("cart"));
        assert!(is_valid_partial_name("blog/card-item"));
        assert!(is_valid_partial_name("@default"));
        assert!(is_valid_partial_name("posts::item"));
        assert!(!is_valid_partial_name("../secret"));
        assert!(!is_valid_partial_name("cart<script>"));
        assert!(!is_valid_partial_name(""));
    }
}
