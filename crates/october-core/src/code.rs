//! # Code Sections
//!
//! The code section of a page, layout or partial is host code. Hosts
//! implement `PageCode` for it and register a factory per object path;
//! objects without a registration get `EmptyCode`. A fresh code object is
//! built for every request.
//!
//! `PageContext` is the mutable request state every hook, handler and
//! component works against.

use crate::primitives::VIEW_BAG_CODE;
use crate::types::{CmsRequest, CmsResponse, HandlerResult};
use crate::{CmsError, RouteParams};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// PAGE CONTEXT
// =============================================================================

/// Request-scoped state shared by the lifecycle.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub request: CmsRequest,
    /// Normalized request URL.
    pub url: String,
    pub params: RouteParams,
    /// Template variables.
    pub vars: Map<String, Value>,
    /// Flash messages set during this request.
    pub flash: BTreeMap<String, String>,
}

impl PageContext {
    #[must_use]
    pub fn new(request: CmsRequest, url: impl Into<String>) -> Self {
        Self {
            request,
            url: url.into(),
            params: RouteParams::new(),
            vars: Map::new(),
            flash: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    /// Form field, falling back to a route parameter.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&str> {
        self.request
            .post
            .get(name)
            .map(String::as_str)
            .or_else(|| self.params.get(name))
    }

    pub fn flash(&mut self, kind: impl Into<String>, message: impl Into<String>) {
        self.flash.insert(kind.into(), message.into());
    }

    /// Properties of the page's view bag, as seen by templates.
    #[must_use]
    pub fn view_bag(&self) -> Option<&Map<String, Value>> {
        self.vars.get(VIEW_BAG_CODE).and_then(Value::as_object)
    }
}

// =============================================================================
// PAGE CODE
// =============================================================================

/// Host code attached to a page, layout or partial.
///
/// Lifecycle hooks return `Some(response)` to end the request with it.
pub trait PageCode: Send {
    fn on_init(&mut self, _ctx: &mut PageContext) -> Result<Option<CmsResponse>, CmsError> {
        Ok(None)
    }

    fn on_start(&mut self, _ctx: &mut PageContext) -> Result<Option<CmsResponse>, CmsError> {
        Ok(None)
    }

    fn on_end(&mut self, _ctx: &mut PageContext) -> Result<Option<CmsResponse>, CmsError> {
        Ok(None)
    }

    /// Layouts only: runs between layout components and the page cycle.
    fn on_before_page_start(
        &mut self,
        _ctx: &mut PageContext,
    ) -> Result<Option<CmsResponse>, CmsError> {
        Ok(None)
    }

    fn has_handler(&self, _name: &str) -> bool {
        false
    }

    fn run_handler(
        &mut self,
        name: &str,
        _ctx: &mut PageContext,
    ) -> Result<HandlerResult, CmsError> {
        Err(CmsError::AjaxHandlerNotFound(name.to_string()))
    }
}

/// Code object of an object with no registered code.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCode;

impl PageCode for EmptyCode {}

type CodeFactory = Arc<dyn Fn() -> Box<dyn PageCode> + Send + Sync>;

/// Object path (e.g. `pages/home.htm`) to code factory.
#[derive(Default, Clone)]
pub struct CodeRegistry {
    factories: HashMap<String, CodeFactory>,
}

impl fmt::Debug for CodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<_> = self.factories.keys().collect();
        paths.sort();
        f.debug_struct("CodeRegistry").field("paths", &paths).finish()
    }
}

impl CodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register code for the object at `path`.
    pub fn register<F, C>(&mut self, path: &str, factory: F)
    where
        F: Fn() -> C + Send + Sync + 'static,
        C: PageCode + 'static,
    {
        self.factories.insert(
            path.trim_start_matches('/').to_string(),
            Arc::new(move || Box::new(factory()) as Box<dyn PageCode>),
        );
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.factories.contains_key(path)
    }

    /// A fresh code object for `path`.
    #[must_use]
    pub fn instantiate(&self, path: &str) -> Box<dyn PageCode> {
        match self.factories.get(path) {
            Some(factory) => factory(),
            None => Box::new(EmptyCode),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        runs: u32,
    }

    impl PageCode for Counter {
        fn on_start(&mut self, ctx: &mut PageContext) -> Result<Option<CmsResponse>, CmsError> {
            self.runs += 1;
            ctx.set_var("runs", self.runs);
            Ok(None)
        }

        fn has_handler(&self, name: &str) -> bool {
            name == "onPing"
        }

        fn run_handler(
            &mut self,
            _name: &str,
            _ctx: &mut PageContext,
        ) -> Result<HandlerResult, CmsError> {
            let mut data = Map::new();
            data.insert("pong".into(), Value::Bool(true));
            Ok(HandlerResult::Data(data))
        }
    }

    #[test]
    fn unregistered_paths_get_empty_code() {
        let registry = CodeRegistry::new();
        let mut code = registry.instantiate("pages/none.htm");
        let mut ctx = PageContext::new(CmsRequest::get("/"), "/");

        assert!(!code.has_handler("onSave"));
        assert!(code.on_start(&mut ctx).expect("start").is_none());
        assert!(matches!(
            code.run_handler("onSave", &mut ctx),
            Err(CmsError::AjaxHandlerNotFound(_))
        ));
    }

    #[test]
    fn instances_are_fresh_per_call() {
        let mut registry = CodeRegistry::new();
        registry.register("/pages/home.htm", Counter::default);
        assert!(registry.contains("pages/home.htm"));

        let mut ctx = PageContext::new(CmsRequest::get("/"), "/");
        registry
            .instantiate("pages/home.htm")
            .on_start(&mut ctx)
            .expect("start");
        registry
            .instantiate("pages/home.htm")
            .on_start(&mut ctx)
            .expect("start");
        assert_eq!(ctx.var("runs"), Some(&Value::from(1)));
    }

    #[test]
    fn input_prefers_form_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), "form".to_string());
        let mut ctx = PageContext::new(CmsRequest::post("/x", fields), "/x");
        ctx.params.insert("id", "route");
        ctx.params.insert("slug", "hello");

        assert_eq!(ctx.input("id"), Some("form"));
        assert_eq!(ctx.input("slug"), Some("hello"));
    }
}
