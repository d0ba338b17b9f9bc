//! # Compound Objects
//!
//! Pages, layouts and partials share one file format of up to three
//! sections separated by `==` lines:
//!
//! ```text
//! url = "/blog/:slug"          <- settings (INI)
//! [blogPost post]
//! slug = "{{ :slug }}"
//! ==
//! <?php                        <- code
//! function onStart() {}
//! ?>
//! ==
//! <h1>{{ post.title }}</h1>    <- markup
//! ```
//!
//! With two sections the code section is absent; a single section is all
//! markup. Settings whose value is a map are component declarations and
//! are moved under `settings.components`.

use crate::cache::CmsCache;
use crate::component::ComponentManager;
use crate::ini;
use crate::primitives::{
    COMPONENTS_KEY, FALLBACK_LAYOUT_MARKUP, FALLBACK_LAYOUT_NAME, VIEW_BAG_CODE,
};
use crate::{CmsError, ErrorPhase, ObjectKind, ObjectRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// COMPONENT DECLARATIONS
// =============================================================================

/// One `[name alias]` entry of an object's settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDeclaration {
    /// The raw settings key, `name` or `name alias`.
    pub key: String,
    pub name: String,
    pub alias: String,
    pub properties: Map<String, Value>,
}

impl ComponentDeclaration {
    /// Split a declaration key on its first whitespace into name and alias.
    ///
    /// A key without an alias uses the name as alias.
    #[must_use]
    pub fn split_key(key: &str) -> (String, String) {
        let key = key.trim();
        match key.split_once(char::is_whitespace) {
            Some((name, alias)) if !alias.trim().is_empty() => {
                (name.to_string(), alias.trim().to_string())
            }
            _ => (key.to_string(), key.to_string()),
        }
    }
}

// =============================================================================
// COMPOUND OBJECT
// =============================================================================

/// A parsed page, layout or partial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundObject {
    kind: ObjectKind,
    file_name: String,
    mtime: u64,
    settings: Map<String, Value>,
    view_bag: Map<String, Value>,
    code: String,
    markup: String,
    /// Line and message of an INI failure, surfaced by `validate`.
    settings_error: Option<(usize, String)>,
    fallback: bool,
}

impl CompoundObject {
    /// Parse file content into a compound object.
    #[must_use]
    pub fn parse(kind: ObjectKind, file_name: impl Into<String>, content: &str, mtime: u64) -> Self {
        let sections = split_sections(content);
        let mut object = Self {
            kind,
            file_name: file_name.into(),
            mtime,
            settings: Map::new(),
            view_bag: Map::new(),
            code: sections.code.map(strip_code_tags).unwrap_or_default(),
            markup: sections.markup,
            settings_error: None,
            fallback: false,
        };

        match ini::parse(&sections.settings.unwrap_or_default()) {
            Ok(parsed) => object.apply_settings(parsed),
            Err(CmsError::IniSyntax { line, message }) => {
                object.settings_error = Some((line, message));
                object.apply_settings(Map::new());
            }
            Err(other) => {
                object.settings_error = Some((0, other.to_string()));
                object.apply_settings(Map::new());
            }
        }
        object
    }

    /// The synthesized layout used by pages that declare none.
    #[must_use]
    pub fn fallback_layout() -> Self {
        let mut layout = Self::parse(ObjectKind::Layout, FALLBACK_LAYOUT_NAME, FALLBACK_LAYOUT_MARKUP, 0);
        layout.fallback = true;
        layout
    }

    /// Move map-valued settings under `components`, keeping scalars.
    fn apply_settings(&mut self, parsed: Map<String, Value>) {
        let mut settings = Map::new();
        let mut components = Map::new();

        for (key, value) in parsed {
            match value {
                Value::Object(props) if key == COMPONENTS_KEY => {
                    for (k, v) in props {
                        components.insert(k, v);
                    }
                }
                Value::Object(props) => {
                    if key == VIEW_BAG_CODE {
                        self.view_bag = props.clone();
                    }
                    components.insert(key, Value::Object(props));
                }
                scalar => {
                    settings.insert(key, scalar);
                }
            }
        }

        if !components.contains_key(VIEW_BAG_CODE) {
            components.insert(
                VIEW_BAG_CODE.to_string(),
                Value::Object(self.view_bag.clone()),
            );
        }
        settings.insert(COMPONENTS_KEY.to_string(), Value::Object(components));
        self.settings = settings;
    }

    // -------------------------------------------------------------------------
    // Declared fields
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// File name without its extension.
    #[must_use]
    pub fn base_file_name(&self) -> &str {
        match self.file_name.rsplit_once('.') {
            Some((base, ext)) if !ext.contains('/') => base,
            _ => &self.file_name,
        }
    }

    #[must_use]
    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    #[must_use]
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind, self.file_name.clone())
    }

    #[must_use]
    pub fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    #[must_use]
    pub fn view_bag(&self) -> &Map<String, Value> {
        &self.view_bag
    }

    #[must_use]
    pub fn markup(&self) -> &str {
        &self.markup
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// URL pattern of a page.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.setting_str("url")
    }

    /// Layout a page renders into.
    #[must_use]
    pub fn layout(&self) -> Option<&str> {
        self.setting_str("layout")
    }

    #[must_use]
    pub fn title(&self) -> Option<&str> {
        self.setting_str("title")
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.setting_str("description")
    }

    /// Hidden pages are only served to backend users.
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.settings.get("is_hidden").is_some_and(is_truthy)
    }

    // -------------------------------------------------------------------------
    // Attribute lookup
    // -------------------------------------------------------------------------

    fn declared_field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "fileName" | "file_name" => Value::String(self.file_name.clone()),
            "baseFileName" => Value::String(self.base_file_name().to_string()),
            "id" => Value::String(self.base_file_name().replace('/', "-")),
            "markup" => Value::String(self.markup.clone()),
            "code" => Value::String(self.code.clone()),
            "mtime" => Value::from(self.mtime),
            _ => return None,
        };
        Some(value)
    }

    /// Look up an attribute: declared fields, then settings, then view bag.
    #[must_use]
    pub fn resolve_attribute(&self, name: &str) -> Option<Value> {
        self.declared_field(name)
            .or_else(|| self.settings.get(name).cloned())
            .or_else(|| self.view_bag.get(name).cloned())
    }

    /// Attributes visible to templates (`this.page`, `this.layout`).
    ///
    /// Same precedence as `resolve_attribute`.
    #[must_use]
    pub fn template_attributes(&self) -> Value {
        let mut attrs = self.view_bag.clone();
        for (k, v) in &self.settings {
            if k != COMPONENTS_KEY {
                attrs.insert(k.clone(), v.clone());
            }
        }
        for name in ["fileName", "baseFileName", "id"] {
            if let Some(v) = self.declared_field(name) {
                attrs.insert(name.to_string(), v);
            }
        }
        Value::Object(attrs)
    }

    // -------------------------------------------------------------------------
    // Components
    // -------------------------------------------------------------------------

    /// Component declarations in file order.
    ///
    /// The synthesized `viewBag` entry is included only when asked for.
    #[must_use]
    pub fn component_declarations(&self, include_view_bag: bool) -> Vec<ComponentDeclaration> {
        let Some(Value::Object(components)) = self.settings.get(COMPONENTS_KEY) else {
            return Vec::new();
        };
        components
            .iter()
            .filter(|(key, _)| include_view_bag || key.as_str() != VIEW_BAG_CODE)
            .map(|(key, props)| {
                let (name, alias) = ComponentDeclaration::split_key(key);
                ComponentDeclaration {
                    key: key.clone(),
                    name,
                    alias,
                    properties: props.as_object().cloned().unwrap_or_default(),
                }
            })
            .collect()
    }

    /// Declaration key of a component used on this object, matched by
    /// name, alias or resolved class.
    pub fn has_component(
        &self,
        name: &str,
        manager: &ComponentManager,
    ) -> Result<Option<String>, CmsError> {
        for decl in self.component_declarations(true) {
            if decl.name == name || decl.alias == name {
                return Ok(Some(decl.key));
            }
            if manager.resolve(&decl.name)?.as_deref() == Some(name) {
                return Ok(Some(decl.key));
            }
        }
        Ok(None)
    }

    /// Properties of a component usage: its defined defaults overlaid with
    /// the values declared on this object.
    ///
    /// `name` may be the component name, its alias or its class. Results
    /// are memoized in `cache` under the theme's namespace; unknown
    /// components yield an empty map.
    pub fn component_properties(
        &self,
        name: &str,
        manager: &ComponentManager,
        cache: &CmsCache,
        theme_key: &str,
    ) -> Result<Map<String, Value>, CmsError> {
        let object_code = format!("{}@{}", self.object_ref().path(), self.mtime);
        if let Some(props) = cache.component_properties(theme_key, &object_code, name) {
            return Ok(props);
        }

        for decl in self.component_declarations(true) {
            let class = manager.resolve(&decl.name)?;
            let matched =
                decl.name == name || decl.alias == name || class.as_deref() == Some(name);
            if !matched {
                continue;
            }

            let mut props = manager.property_defaults(&decl.name)?.unwrap_or_default();
            for (k, v) in decl.properties {
                props.insert(k, v);
            }
            cache.store_component_properties(theme_key, &object_code, name, &props);
            return Ok(props);
        }

        Ok(Map::new())
    }

    // -------------------------------------------------------------------------
    // Mutation and serialization
    // -------------------------------------------------------------------------

    /// Update the object from editor-style attributes.
    ///
    /// `markup`, `code` and `settings` replace their sections; any other
    /// key is written as a plain setting (maps become components).
    pub fn fill(&mut self, attributes: Map<String, Value>) {
        let mut settings = self.raw_settings();
        for (key, value) in attributes {
            match (key.as_str(), value) {
                ("markup", Value::String(markup)) => self.markup = markup,
                ("code", Value::String(code)) => self.code = strip_code_tags(&code),
                ("settings", Value::Object(map)) => {
                    for (k, v) in map {
                        settings.insert(k, v);
                    }
                }
                (_, value) => {
                    settings.insert(key, value);
                }
            }
        }
        self.view_bag = Map::new();
        self.apply_settings(settings);
        self.settings_error = None;
    }

    /// Settings in file form: scalars plus one map per component.
    fn raw_settings(&self) -> Map<String, Value> {
        let mut raw = Map::new();
        for (k, v) in &self.settings {
            if k != COMPONENTS_KEY {
                raw.insert(k.clone(), v.clone());
            }
        }
        if let Some(Value::Object(components)) = self.settings.get(COMPONENTS_KEY) {
            for (k, v) in components {
                let empty_view_bag = k == VIEW_BAG_CODE && v.as_object().is_none_or(Map::is_empty);
                if !empty_view_bag {
                    raw.insert(k.clone(), v.clone());
                }
            }
        }
        raw
    }

    /// Render back to the three-section file form.
    #[must_use]
    pub fn to_content(&self) -> String {
        let settings = ini::render(&self.raw_settings());
        let settings = settings.trim_end();
        let code = self.code.trim();

        if !code.is_empty() {
            format!("{}\n==\n<?php\n{}\n?>\n==\n{}", settings, code, self.markup)
        } else if !settings.is_empty() {
            format!("{}\n==\n{}", settings, self.markup)
        } else {
            self.markup.clone()
        }
    }

    /// Surface a settings parse failure as a masked validation error.
    pub fn validate(&self) -> Result<(), CmsError> {
        match &self.settings_error {
            None => Ok(()),
            Some((line, message)) => {
                let text = format!(
                    "Error parsing the settings section on line {}: {}",
                    line, message
                );
                Err(CmsError::validation("settings", text)
                    .mask(&self.object_ref(), ErrorPhase::CodeInit))
            }
        }
    }
}

/// Loose truthiness for settings values.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().is_none_or(|i| i != 0),
        Value::String(s) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// =============================================================================
// SECTION SPLITTING
// =============================================================================

struct Sections {
    settings: Option<String>,
    code: Option<String>,
    markup: String,
}

fn is_separator(line: &str) -> bool {
    let trimmed = line.trim_end();
    trimmed.len() >= 2 && trimmed.chars().all(|c| c == '=')
}

fn split_sections(content: &str) -> Sections {
    let mut parts: Vec<String> = vec![String::new()];
    for line in content.split_inclusive('\n') {
        if parts.len() < 3 && is_separator(line) {
            parts.push(String::new());
            continue;
        }
        if let Some(last) = parts.last_mut() {
            last.push_str(line);
        }
    }

    let mut parts = parts.into_iter();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(settings), Some(code), Some(markup)) => Sections {
            settings: Some(settings),
            code: Some(code),
            markup,
        },
        (Some(settings), Some(markup), None) => Sections {
            settings: Some(settings),
            code: None,
            markup,
        },
        (Some(markup), _, _) => Sections {
            settings: None,
            code: None,
            markup,
        },
        (None, _, _) => Sections {
            settings: None,
            code: None,
            markup: String::new(),
        },
    }
}

fn strip_code_tags(code: impl AsRef<str>) -> String {
    let code = code.as_ref().trim();
    let code = code.strip_prefix("<?php").unwrap_or(code);
    let code = code.strip_suffix("?>").unwrap_or(code);
    code.trim().to_string()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const POST_PAGE: &str = r#"url = "/blog/:post_id"
layout = "default"
title = "Post"

[blogPost post]
id = "{{ :post_id }}"

[viewBag]
menu = "blog"
==
<?php
function onStart() {}
?>
==
<h1>{{ post.title }}</h1>
"#;

    #[test]
    fn three_sections() {
        let page = CompoundObject::parse(ObjectKind::Page, "blog/post.htm", POST_PAGE, 7);

        assert_eq!(page.url(), Some("/blog/:post_id"));
        assert_eq!(page.layout(), Some("default"));
        assert_eq!(page.code(), "function onStart() {}");
        assert_eq!(page.markup(), "<h1>{{ post.title }}</h1>\n");
        assert_eq!(page.base_file_name(), "blog/post");
        assert!(page.validate().is_ok());
    }

    #[test]
    fn maps_become_components() {
        let page = CompoundObject::parse(ObjectKind::Page, "blog/post.htm", POST_PAGE, 7);
        let decls = page.component_declarations(false);

        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, "blogPost");
        assert_eq!(decls[0].alias, "post");
        assert_eq!(decls[0].properties["id"], "{{ :post_id }}");
        assert!(!page.settings().contains_key("blogPost post"));
    }

    #[test]
    fn view_bag_always_present() {
        let partial = CompoundObject::parse(ObjectKind::Partial, "nav.htm", "<nav></nav>", 0);
        let decls = partial.component_declarations(true);

        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, VIEW_BAG_CODE);
        assert!(partial.settings()[COMPONENTS_KEY].is_object());
        assert_eq!(partial.markup(), "<nav></nav>");
    }

    #[test]
    fn two_sections_have_no_code() {
        let layout = CompoundObject::parse(
            ObjectKind::Layout,
            "default.htm",
            "description = \"Main\"\n==\n<html>{% page %}</html>",
            0,
        );
        assert_eq!(layout.description(), Some("Main"));
        assert_eq!(layout.code(), "");
        assert_eq!(layout.markup(), "<html>{% page %}</html>");
    }

    #[test]
    fn attribute_lookup_order() {
        let page = CompoundObject::parse(
            ObjectKind::Page,
            "about.htm",
            "title = \"Settings title\"\n[viewBag]\ntitle = \"Bag title\"\nsnippet = yes\n==\n",
            0,
        );

        assert_eq!(page.resolve_attribute("title"), Some(Value::from("Settings title")));
        assert_eq!(page.resolve_attribute("snippet"), Some(Value::Bool(true)));
        assert_eq!(page.resolve_attribute("fileName"), Some(Value::from("about.htm")));
        assert_eq!(page.resolve_attribute("missing"), None);

        let attrs = page.template_attributes();
        assert_eq!(attrs["title"], "Settings title");
        assert_eq!(attrs["id"], "about");
    }

    #[test]
    fn malformed_settings_become_masked_validation_error() {
        let page = CompoundObject::parse(
            ObjectKind::Page,
            "broken.htm",
            "url = \"/broken\"\nthis line is not ini\n==\n<p>x</p>",
            0,
        );

        let err = page.validate().expect_err("must fail");
        match &err {
            CmsError::Masked { object, phase, .. } => {
                assert_eq!(object.file_name, "broken.htm");
                assert_eq!(*phase, ErrorPhase::CodeInit);
            }
            other => unreachable!("unexpected {other:?}"),
        }
        let (_, fields) = err.validation_fields().expect("validation");
        assert!(fields["settings"][0].contains("line 2"));
        assert!(page.settings()[COMPONENTS_KEY].is_object());
    }

    #[test]
    fn fallback_layout_is_flagged() {
        let layout = CompoundObject::fallback_layout();
        assert!(layout.is_fallback());
        assert_eq!(layout.markup(), FALLBACK_LAYOUT_MARKUP);
    }

    #[test]
    fn fill_and_render_back() {
        let mut page = CompoundObject::parse(ObjectKind::Page, "home.htm", "url = \"/\"\n==\n<p>old</p>", 0);
        let mut attrs = Map::new();
        attrs.insert("markup".into(), Value::from("<p>new</p>"));
        attrs.insert("title".into(), Value::from("Home"));
        attrs.insert("hero".into(), serde_json::json!({"size": 2}));
        page.fill(attrs);

        assert_eq!(page.title(), Some("Home"));
        assert_eq!(page.component_declarations(false)[0].alias, "hero");

        let content = page.to_content();
        let reparsed = CompoundObject::parse(ObjectKind::Page, "home.htm", &content, 0);
        assert_eq!(reparsed.markup(), "<p>new</p>");
        assert_eq!(reparsed.title(), Some("Home"));
        assert_eq!(reparsed.component_declarations(false).len(), 1);
    }

    #[test]
    fn hidden_flag_truthiness() {
        let hidden = CompoundObject::parse(ObjectKind::Page, "a.htm", "is_hidden = 1\n==\n", 0);
        let shown = CompoundObject::parse(ObjectKind::Page, "b.htm", "is_hidden = 0\n==\n", 0);
        assert!(hidden.is_hidden());
        assert!(!shown.is_hidden());
    }

    struct Feed;

    impl crate::component::Component for Feed {
        fn details(&self) -> crate::component::ComponentDetails {
            crate::component::ComponentDetails::new("Feed", "Lists posts")
        }

        fn define_properties(&self) -> Vec<crate::component::PropertyDefinition> {
            vec![
                crate::component::PropertyDefinition::new("title", "Title").with_default("Latest"),
                crate::component::PropertyDefinition::new("perPage", "Per page").with_default(10),
            ]
        }
    }

    fn feed_manager() -> ComponentManager {
        let mut manager = ComponentManager::new();
        manager.register_component(
            crate::component::ComponentFactory::new("Acme\\Blog\\Feed", || Box::new(Feed)),
            "blogFeed",
        );
        manager
    }

    const FEED_PAGE: &str = "url = \"/\"\n\n[blogFeed posts]\nperPage = 5\n==\n{% component 'posts' %}";

    #[test]
    fn component_found_by_name_alias_or_class() {
        let page = CompoundObject::parse(ObjectKind::Page, "home.htm", FEED_PAGE, 1);
        let manager = feed_manager();
        let cache = CmsCache::in_memory();

        for name in ["blogFeed", "posts", "Acme\\Blog\\Feed"] {
            assert_eq!(
                page.has_component(name, &manager).expect("lookup").as_deref(),
                Some("blogFeed posts")
            );
        }
        assert_eq!(page.has_component("other", &manager).expect("lookup"), None);

        let by_name = page.component_properties("blogFeed", &manager, &cache, "t").expect("props");
        let by_alias = page.component_properties("posts", &manager, &cache, "t").expect("props");
        let by_class = page
            .component_properties("Acme\\Blog\\Feed", &manager, &cache, "t")
            .expect("props");
        assert_eq!(by_name, by_alias);
        assert_eq!(by_name, by_class);
        assert_eq!(by_name.get("title"), Some(&Value::from("Latest")));
        assert_ne!(by_name.get("perPage"), Some(&Value::from(10)));
    }

    #[test]
    fn component_properties_cached_until_cleared() {
        let page = CompoundObject::parse(ObjectKind::Page, "home.htm", FEED_PAGE, 1);
        let manager = feed_manager();
        let cache = CmsCache::in_memory();
        let fresh = page.component_properties("posts", &manager, &cache, "t").expect("props");

        let object_code = format!("{}@{}", page.object_ref().path(), page.mtime());
        let mut stale = Map::new();
        stale.insert("title".into(), Value::from("stale"));
        cache.store_component_properties("t", &object_code, "posts", &stale);
        assert_eq!(page.component_properties("posts", &manager, &cache, "t").expect("props"), stale);

        cache.clear_component_properties("t");
        assert_eq!(page.component_properties("posts", &manager, &cache, "t").expect("props"), fresh);
    }
}
