//! # Component Manager
//!
//! Keeps the two-way code <-> class map of every registered component
//! and builds instances on demand.
//!
//! Registration is lazy: module callbacks and plugins are only asked for
//! their components the first time the registry is needed. The `viewBag`
//! code is reserved for the built-in `ViewBag`.

use super::{Component, ComponentDetails, ComponentInstance, PropertyDefinition, ViewBag};
use crate::CmsError;
use crate::primitives::{MODULE_OWNER, VIEW_BAG_CODE};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

// =============================================================================
// FACTORY
// =============================================================================

type Builder = Arc<dyn Fn() -> Box<dyn Component> + Send + Sync>;

/// Builds instances of one component class.
#[derive(Clone)]
pub struct ComponentFactory {
    class: String,
    build: Builder,
}

impl fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentFactory")
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

impl ComponentFactory {
    /// Factory for a `Default` component, named after its Rust type.
    #[must_use]
    pub fn of<C: Component + Default + 'static>() -> Self {
        Self::new(std::any::type_name::<C>(), || Box::new(C::default()))
    }

    #[must_use]
    pub fn new<F>(class: impl Into<String>, build: F) -> Self
    where
        F: Fn() -> Box<dyn Component> + Send + Sync + 'static,
    {
        Self {
            class: class.into(),
            build: Arc::new(build),
        }
    }

    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }

    #[must_use]
    pub fn build(&self) -> Box<dyn Component> {
        (self.build)()
    }
}

fn view_bag_class() -> &'static str {
    std::any::type_name::<ViewBag>()
}

// =============================================================================
// REGISTRY
// =============================================================================

/// The loaded set of components.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    /// class -> factory
    factories: HashMap<String, ComponentFactory>,
    /// code -> class
    codes: HashMap<String, String>,
    /// class -> code
    class_codes: HashMap<String, String>,
    /// class -> owner
    owners: HashMap<String, String>,
    /// classes in registration order
    order: Vec<String>,
}

impl ComponentRegistry {
    /// Record a component under `code`, attributed to `owner`.
    ///
    /// Registering a class again moves it to the new code.
    pub fn register(
        &mut self,
        factory: ComponentFactory,
        code: &str,
        owner: &str,
    ) -> Result<(), CmsError> {
        let class = factory.class.clone();
        if code == VIEW_BAG_CODE && class != view_bag_class() {
            return Err(CmsError::ReservedComponentCode(class));
        }

        if let Some(previous) = self.class_codes.insert(class.clone(), code.to_string()) {
            if previous != code && self.codes.get(&previous) == Some(&class) {
                self.codes.remove(&previous);
            }
        }
        if let Some(displaced) = self.codes.insert(code.to_string(), class.clone()) {
            if displaced != class {
                tracing::warn!(code, %displaced, %class, "component code reassigned");
                self.class_codes.remove(&displaced);
            }
        }
        if !self.factories.contains_key(&class) {
            self.order.push(class.clone());
        }
        self.owners.insert(class.clone(), owner.to_string());
        self.factories.insert(class, factory);
        Ok(())
    }

    /// Class for a code, or the name itself when it is a class.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&str> {
        match self.codes.get(name) {
            Some(class) => Some(class.as_str()),
            None => self
                .factories
                .get_key_value(name)
                .map(|(class, _)| class.as_str()),
        }
    }

    #[must_use]
    pub fn factory(&self, name: &str) -> Option<&ComponentFactory> {
        self.factories.get(self.resolve(name)?)
    }

    #[must_use]
    pub fn code_of(&self, class: &str) -> Option<&str> {
        self.class_codes.get(class).map(String::as_str)
    }

    #[must_use]
    pub fn owner_of(&self, class: &str) -> Option<&str> {
        self.owners.get(class).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// =============================================================================
// PLUGINS
// =============================================================================

/// A package contributing components.
pub trait Plugin: Send + Sync {
    /// Owner label, e.g. `Acme.Blog`.
    fn identifier(&self) -> &str;

    /// Components as `(factory, code)` pairs.
    fn register_components(&self) -> Vec<(ComponentFactory, String)>;
}

/// One row of `list_components`.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentListing {
    pub code: String,
    pub class: String,
    pub owner: String,
    pub details: ComponentDetails,
    pub properties: Vec<PropertyDefinition>,
}

// =============================================================================
// MANAGER
// =============================================================================

type ModuleCallback = Arc<dyn Fn(&mut ComponentRegistry) -> Result<(), CmsError> + Send + Sync>;

/// Registration front door and instance builder.
pub struct ComponentManager {
    callbacks: Vec<ModuleCallback>,
    plugins: Vec<Arc<dyn Plugin>>,
    strict: bool,
    loaded: Mutex<Option<Arc<ComponentRegistry>>>,
}

impl fmt::Debug for ComponentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentManager")
            .field("callbacks", &self.callbacks.len())
            .field("plugins", &self.plugins.len())
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}

impl Default for ComponentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentManager {
    /// A strict manager with only the built-in ViewBag.
    #[must_use]
    pub fn new() -> Self {
        Self {
            callbacks: Vec::new(),
            plugins: Vec::new(),
            strict: true,
            loaded: Mutex::new(None),
        }
    }

    /// In lenient mode unknown components are skipped instead of failing.
    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Add a first-party registration callback.
    pub fn register_components<F>(&mut self, callback: F)
    where
        F: Fn(&mut ComponentRegistry) -> Result<(), CmsError> + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
        self.invalidate();
    }

    /// Convenience for a single module component.
    pub fn register_component(&mut self, factory: ComponentFactory, code: &str) {
        let code = code.to_string();
        self.register_components(move |registry| {
            registry.register(factory.clone(), &code, MODULE_OWNER)
        });
    }

    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
        self.invalidate();
    }

    fn invalidate(&self) {
        *self.loaded.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// The registry, loading every source on first use.
    pub fn registry(&self) -> Result<Arc<ComponentRegistry>, CmsError> {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(registry) = loaded.as_ref() {
            return Ok(Arc::clone(registry));
        }

        let mut registry = ComponentRegistry::default();
        registry.register(ComponentFactory::of::<ViewBag>(), VIEW_BAG_CODE, MODULE_OWNER)?;
        for callback in &self.callbacks {
            callback(&mut registry)?;
        }
        for plugin in &self.plugins {
            for (factory, code) in plugin.register_components() {
                registry.register(factory, &code, plugin.identifier())?;
            }
        }
        tracing::debug!(components = registry.len(), "component registry loaded");

        let registry = Arc::new(registry);
        *loaded = Some(Arc::clone(&registry));
        Ok(registry)
    }

    /// Every registered component with its details and properties.
    pub fn list_components(&self) -> Result<Vec<ComponentListing>, CmsError> {
        let registry = self.registry()?;
        Ok(registry
            .order
            .iter()
            .filter_map(|class| {
                let factory = registry.factories.get(class)?;
                let instance = factory.build();
                Some(ComponentListing {
                    code: registry.code_of(class).unwrap_or_default().to_string(),
                    class: class.clone(),
                    owner: registry.owner_of(class).unwrap_or(MODULE_OWNER).to_string(),
                    details: instance.details(),
                    properties: instance.define_properties(),
                })
            })
            .collect())
    }

    /// Class behind a code or class name.
    pub fn resolve(&self, name: &str) -> Result<Option<String>, CmsError> {
        Ok(self.registry()?.resolve(name).map(str::to_string))
    }

    pub fn has_component(&self, name: &str) -> Result<bool, CmsError> {
        Ok(self.registry()?.resolve(name).is_some())
    }

    /// Defaults of every defined property; `None` for unknown components.
    pub fn property_defaults(&self, name: &str) -> Result<Option<Map<String, Value>>, CmsError> {
        let registry = self.registry()?;
        let Some(factory) = registry.factory(name) else {
            return Ok(None);
        };
        let defaults = factory
            .build()
            .define_properties()
            .into_iter()
            .filter_map(|def| Some((def.name, def.default?)))
            .collect();
        Ok(Some(defaults))
    }

    /// Build a component instance with `properties` over its defaults.
    ///
    /// Unknown components are an error in strict mode and `None` otherwise.
    pub fn make_component(
        &self,
        name: &str,
        alias: &str,
        properties: Map<String, Value>,
    ) -> Result<Option<ComponentInstance>, CmsError> {
        let registry = self.registry()?;
        let Some(factory) = registry.factory(name) else {
            if self.strict {
                return Err(CmsError::ComponentNotFound(name.to_string()));
            }
            tracing::warn!(component = name, alias, "unknown component skipped");
            return Ok(None);
        };

        let component = factory.build();
        let mut merged: Map<String, Value> = component
            .define_properties()
            .into_iter()
            .filter_map(|def| Some((def.name, def.default?)))
            .collect();
        for (k, v) in properties {
            merged.insert(k, v);
        }

        Ok(Some(ComponentInstance::new(
            alias.to_string(),
            name.to_string(),
            factory.class.clone(),
            merged,
            component,
        )))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Posts;

    impl Component for Posts {
        fn details(&self) -> ComponentDetails {
            ComponentDetails::new("Posts", "Lists blog posts")
        }

        fn define_properties(&self) -> Vec<PropertyDefinition> {
            vec![
                PropertyDefinition::new("perPage", "Per page").with_default(10),
                PropertyDefinition::new("category", "Category"),
            ]
        }
    }

    #[derive(Default)]
    struct FakeBag;

    impl Component for FakeBag {
        fn details(&self) -> ComponentDetails {
            ComponentDetails::new("Fake", "Tries to take over viewBag")
        }
    }

    struct Blog;

    impl Plugin for Blog {
        fn identifier(&self) -> &str {
            "Acme.Blog"
        }

        fn register_components(&self) -> Vec<(ComponentFactory, String)> {
            vec![(ComponentFactory::of::<Posts>(), "blogPosts".to_string())]
        }
    }

    #[test]
    fn view_bag_code_is_reserved() {
        let mut manager = ComponentManager::new();
        manager.register_component(ComponentFactory::of::<FakeBag>(), VIEW_BAG_CODE);

        let err = manager.registry().expect_err("reserved");
        assert!(matches!(err, CmsError::ReservedComponentCode(_)));
        assert_eq!(err.lang_key(), "cms::lang.component.reserved_code");
    }

    #[test]
    fn resolves_codes_and_classes() {
        let mut manager = ComponentManager::new();
        manager.register_plugin(Arc::new(Blog));
        let class = std::any::type_name::<Posts>();

        assert_eq!(manager.resolve("blogPosts").expect("load").as_deref(), Some(class));
        assert_eq!(manager.resolve(class).expect("load").as_deref(), Some(class));
        assert_eq!(manager.resolve("nothing").expect("load"), None);
        assert!(manager.has_component(VIEW_BAG_CODE).expect("load"));
    }

    #[test]
    fn listing_includes_owner_and_details() {
        let mut manager = ComponentManager::new();
        manager.register_plugin(Arc::new(Blog));

        let listing = manager.list_components().expect("list");
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].code, VIEW_BAG_CODE);
        assert_eq!(listing[0].owner, MODULE_OWNER);
        assert_eq!(listing[1].code, "blogPosts");
        assert_eq!(listing[1].owner, "Acme.Blog");
        assert_eq!(listing[1].details.name, "Posts");
    }

    #[test]
    fn make_component_merges_defaults() {
        let mut manager = ComponentManager::new();
        manager.register_plugin(Arc::new(Blog));

        let mut props = Map::new();
        props.insert("category".into(), Value::from("news"));
        let instance = manager
            .make_component("blogPosts", "posts", props)
            .expect("make")
            .expect("known");

        assert_eq!(instance.alias(), "posts");
        assert_eq!(instance.property("perPage"), Some(&Value::from(10)));
        assert_eq!(instance.property("category"), Some(&Value::from("news")));

        let defaults = manager.property_defaults("blogPosts").expect("load").expect("known");
        assert_eq!(defaults.len(), 1);
    }

    #[test]
    fn strictness_controls_unknown_components() {
        let strict = ComponentManager::new();
        assert!(matches!(
            strict.make_component("missing", "m", Map::new()),
            Err(CmsError::ComponentNotFound(_))
        ));

        let lenient = ComponentManager::new().with_strict(false);
        assert!(lenient.make_component("missing", "m", Map::new()).expect("ok").is_none());
    }

    #[test]
    fn reregistering_moves_code() {
        let mut registry = ComponentRegistry::default();
        registry
            .register(ComponentFactory::of::<Posts>(), "posts", "a")
            .expect("register");
        registry
            .register(ComponentFactory::of::<Posts>(), "blogPosts", "a")
            .expect("register");

        assert_eq!(registry.resolve("posts"), None);
        assert!(registry.resolve("blogPosts").is_some());
        assert_eq!(registry.len(), 1);
    }
}
