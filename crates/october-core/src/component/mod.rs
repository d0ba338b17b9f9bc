//! # Components
//!
//! Reusable behaviour attached to pages, layouts and partials through
//! `[name alias]` settings sections. Host crates implement `Component`
//! and register it under a short code with the `ComponentManager`.

mod manager;
mod view_bag;

pub use manager::{
    ComponentFactory, ComponentListing, ComponentManager, ComponentRegistry, Plugin,
};
pub use view_bag::ViewBag;

use crate::code::PageContext;
use crate::types::{CmsResponse, HandlerResult};
use crate::{CmsError, RouteParams};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::LazyLock;

// =============================================================================
// COMPONENT TRAIT
// =============================================================================

/// Name and description shown in component listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComponentDetails {
    pub name: String,
    pub description: String,
}

impl ComponentDetails {
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// One declared component property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyDefinition {
    pub name: String,
    pub title: String,
    pub description: String,
    /// Inspector field type (`string`, `checkbox`, `dropdown`, ...).
    pub kind: String,
    pub default: Option<Value>,
    pub validation_pattern: Option<String>,
}

impl PropertyDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            description: String::new(),
            kind: "string".to_string(),
            default: None,
            validation_pattern: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

/// Everything a component hook can reach.
pub struct ComponentContext<'a> {
    pub alias: &'a str,
    pub properties: &'a Map<String, Value>,
    pub page: &'a mut PageContext,
}

impl ComponentContext<'_> {
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// String form of a property, numbers included.
    #[must_use]
    pub fn property_str(&self, name: &str) -> Option<String> {
        match self.properties.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// A pluggable unit of page behaviour.
///
/// Hooks returning `Some(response)` end the request with that response.
pub trait Component: Send {
    fn details(&self) -> ComponentDetails;

    fn define_properties(&self) -> Vec<PropertyDefinition> {
        Vec::new()
    }

    /// Called once the component is attached, before any markup renders.
    fn init(&mut self, _ctx: &mut ComponentContext<'_>) -> Result<(), CmsError> {
        Ok(())
    }

    fn on_run(&mut self, _ctx: &mut ComponentContext<'_>) -> Result<Option<CmsResponse>, CmsError> {
        Ok(None)
    }

    fn has_handler(&self, _name: &str) -> bool {
        false
    }

    fn run_handler(
        &mut self,
        name: &str,
        _ctx: &mut ComponentContext<'_>,
    ) -> Result<HandlerResult, CmsError> {
        Err(CmsError::AjaxHandlerNotFound(name.to_string()))
    }

    /// Built-in markup of a component partial (`default` for
    /// `{% component %}`), used when the theme does not override it.
    fn partial(&self, _name: &str) -> Option<String> {
        None
    }

    /// Value bound to the component alias in templates.
    fn template_value(&self, alias: &str, properties: &Map<String, Value>) -> Value {
        let mut value = Map::new();
        value.insert("alias".into(), Value::from(alias));
        value.insert("properties".into(), Value::Object(properties.clone()));
        Value::Object(value)
    }
}

// =============================================================================
// COMPONENT INSTANCE
// =============================================================================

/// A component attached to an object for one request.
pub struct ComponentInstance {
    alias: String,
    name: String,
    class: String,
    properties: Map<String, Value>,
    component: Box<dyn Component>,
}

impl fmt::Debug for ComponentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInstance")
            .field("alias", &self.alias)
            .field("name", &self.name)
            .field("class", &self.class)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl ComponentInstance {
    pub(crate) fn new(
        alias: String,
        name: String,
        class: String,
        properties: Map<String, Value>,
        component: Box<dyn Component>,
    ) -> Self {
        Self {
            alias,
            name,
            class,
            properties,
            component,
        }
    }

    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// The code or class the declaration used.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }

    #[must_use]
    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set_properties(&mut self, properties: Map<String, Value>) {
        self.properties = properties;
    }

    #[must_use]
    pub fn template_value(&self) -> Value {
        self.component.template_value(&self.alias, &self.properties)
    }

    #[must_use]
    pub fn has_handler(&self, name: &str) -> bool {
        self.component.has_handler(name)
    }

    #[must_use]
    pub fn partial(&self, name: &str) -> Option<String> {
        self.component.partial(name)
    }

    pub fn init(&mut self, page: &mut PageContext) -> Result<(), CmsError> {
        let mut ctx = ComponentContext {
            alias: &self.alias,
            properties: &self.properties,
            page,
        };
        self.component.init(&mut ctx)
    }

    pub fn on_run(&mut self, page: &mut PageContext) -> Result<Option<CmsResponse>, CmsError> {
        let mut ctx = ComponentContext {
            alias: &self.alias,
            properties: &self.properties,
            page,
        };
        self.component.on_run(&mut ctx)
    }

    pub fn run_handler(
        &mut self,
        handler: &str,
        page: &mut PageContext,
    ) -> Result<HandlerResult, CmsError> {
        let mut ctx = ComponentContext {
            alias: &self.alias,
            properties: &self.properties,
            page,
        };
        self.component.run_handler(handler, &mut ctx)
    }
}

// =============================================================================
// PROPERTY BINDING
// =============================================================================

static ROUTE_BINDING: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\{\{\s*:([\w-]+)\s*\}\}$").ok());

static VAR_BINDING: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\{\{\s*([\w.]+)\s*\}\}$").ok());

fn lookup_path<'v>(vars: &'v Map<String, Value>, path: &str) -> Option<&'v Value> {
    let mut parts = path.split('.');
    let mut current = vars.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

/// Resolve `{{ :param }}` and `{{ var }}` property values.
///
/// A route binding to an absent parameter becomes an empty string; a
/// variable binding to an absent variable becomes `null`.
#[must_use]
pub fn bind_properties(
    properties: &Map<String, Value>,
    params: &RouteParams,
    vars: &Map<String, Value>,
) -> Map<String, Value> {
    properties
        .iter()
        .map(|(key, value)| {
            if let Some(name) = bound_parameter(value) {
                let bound = params.get(name).unwrap_or_default();
                return (key.clone(), Value::from(bound));
            }
            let Value::String(text) = value else {
                return (key.clone(), value.clone());
            };
            let var = VAR_BINDING
                .as_ref()
                .and_then(|re| re.captures(text))
                .and_then(|c| c.get(1));
            if let Some(path) = var {
                let bound = lookup_path(vars, path.as_str()).cloned().unwrap_or(Value::Null);
                return (key.clone(), bound);
            }
            (key.clone(), value.clone())
        })
        .collect()
}

/// Name of the route parameter a property is bound to, if any.
#[must_use]
pub fn bound_parameter(value: &Value) -> Option<&str> {
    let text = value.as_str()?;
    let re = ROUTE_BINDING.as_ref()?;
    let name = re.captures(text)?.get(1)?;
    Some(name.as_str())
}

// =============================================================================
// TESTS
// =============================================================================
