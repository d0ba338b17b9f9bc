//! # Markup Engine
//!
//! A small Twig-flavoured template language for theme markup:
//!
//! - `{{ expr }}` prints, HTML-escaped unless the last filter is `raw`
//!   or `escape`
//! - filters: `raw`, `escape`/`e`, `upper`, `lower`, `default(x)`,
//!   `length`, `page(params)`, `theme`
//! - tags: `page`, `partial`, `component`, `content`, `if`/`elseif`/`else`,
//!   `for ... in ...`/`else`
//! - `{# comments #}` and `-` whitespace control
//!
//! Tags that reach outside the template (`page`, `partial`, `component`,
//! `content`, and the `page`/`theme` filters) are delegated to a
//! `RenderHost`. Parsed templates are cached by key when enabled, and an
//! optional `SecurityPolicy` restricts what markup may use.

mod parser;
mod policy;

pub use parser::{CompareOp, Expr, Node, TagArgs};
pub use policy::{KNOWN_FILTERS, KNOWN_TAGS, SecurityPolicy};

use crate::CmsError;
use crate::config::CmsConfig;
use crate::object::is_truthy;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Entries kept before the parsed-template cache is reset.
const MAX_CACHED_TEMPLATES: usize = 512;

// =============================================================================
// HOST
// =============================================================================

/// Services markup needs from the page being rendered.
pub trait RenderHost {
    /// Output of `{% page %}`.
    fn page_contents(&mut self) -> Result<String, CmsError>;

    /// `scope` holds every variable visible at the tag.
    fn render_partial(
        &mut self,
        name: &str,
        params: Map<String, Value>,
        scope: &Map<String, Value>,
    ) -> Result<String, CmsError>;

    fn render_component(
        &mut self,
        alias: &str,
        params: Map<String, Value>,
        scope: &Map<String, Value>,
    ) -> Result<String, CmsError>;

    fn render_content(&mut self, name: &str, params: Map<String, Value>)
    -> Result<String, CmsError>;

    /// URL of a page for the `page` filter.
    fn page_url(&mut self, name: &str, params: Map<String, Value>) -> Result<String, CmsError>;

    /// URL of a theme asset for the `theme` filter.
    fn theme_url(&mut self, path: &str) -> String;
}

// =============================================================================
// TEMPLATE
// =============================================================================

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Literal partial names referenced anywhere in the tree.
    #[must_use]
    pub fn partials(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_partials(&self.nodes, &mut names);
        names
    }

    pub fn render(
        &self,
        vars: &Map<String, Value>,
        host: &mut dyn RenderHost,
    ) -> Result<String, CmsError> {
        let mut renderer = Renderer {
            host,
            base: vars,
            frames: Vec::new(),
        };
        let mut out = String::new();
        renderer.nodes(&self.nodes, &mut out)?;
        Ok(out)
    }
}

fn collect_partials(nodes: &[Node], names: &mut Vec<String>) {
    for node in nodes {
        match node {
            Node::Partial {
                name: Expr::Literal(Value::String(name)),
                ..
            } => names.push(name.clone()),
            Node::If {
                then, otherwise, ..
            } => {
                collect_partials(then, names);
                collect_partials(otherwise, names);
            }
            Node::For { body, empty, .. } => {
                collect_partials(body, names);
                collect_partials(empty, names);
            }
            _ => {}
        }
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Parses and renders markup, with an optional parsed-template cache.
#[derive(Debug)]
pub struct MarkupEngine {
    policy: SecurityPolicy,
    cache_enabled: bool,
    cache: Mutex<HashMap<String, Arc<Template>>>,
}

impl Default for MarkupEngine {
    fn default() -> Self {
        Self::new(SecurityPolicy::permissive(), true)
    }
}

impl MarkupEngine {
    #[must_use]
    pub fn new(policy: SecurityPolicy, cache_enabled: bool) -> Self {
        Self {
            policy,
            cache_enabled,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Sandboxed in safe mode; caching per `enable_template_cache`.
    #[must_use]
    pub fn from_config(config: &CmsConfig) -> Self {
        let policy = if config.safe_mode {
            SecurityPolicy::sandboxed()
        } else {
            SecurityPolicy::permissive()
        };
        Self::new(policy, config.enable_template_cache)
    }

    #[must_use]
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Parse without caching, for node-tree introspection.
    pub fn parse(&self, source: &str) -> Result<Template, CmsError> {
        Ok(Template {
            nodes: parser::parse(source, &self.policy)?,
        })
    }

    /// Parse through the cache. `key` must change whenever `source` does.
    pub fn load(&self, key: &str, source: &str) -> Result<Arc<Template>, CmsError> {
        if !self.cache_enabled {
            return Ok(Arc::new(self.parse(source)?));
        }
        if let Some(hit) = self.lock().get(key) {
            return Ok(Arc::clone(hit));
        }

        let template = Arc::new(self.parse(source)?);
        let mut cache = self.lock();
        if cache.len() >= MAX_CACHED_TEMPLATES {
            cache.clear();
        }
        cache.insert(key.to_string(), Arc::clone(&template));
        Ok(template)
    }

    pub fn render(
        &self,
        key: &str,
        source: &str,
        vars: &Map<String, Value>,
        host: &mut dyn RenderHost,
    ) -> Result<String, CmsError> {
        self.load(key, source)?.render(vars, host)
    }

    pub fn clear_cache(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Template>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// RENDERER
// =============================================================================

/// HTML-escape text for safe output.
#[must_use]
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            other => out.push(other),
        }
    }
    out
}

/// Printable form of a value.
#[must_use]
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            }
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match op {
        CompareOp::Eq => ordering.map_or(left == right, Ordering::is_eq),
        CompareOp::Ne => ordering.map_or(left != right, Ordering::is_ne),
        CompareOp::Lt => ordering.is_some_and(Ordering::is_lt),
        CompareOp::Le => ordering.is_some_and(Ordering::is_le),
        CompareOp::Gt => ordering.is_some_and(Ordering::is_gt),
        CompareOp::Ge => ordering.is_some_and(Ordering::is_ge),
    }
}

fn lookup(base: &Value, key: &Value) -> Value {
    let found = match (base, key) {
        (Value::Object(map), Value::String(k)) => map.get(k),
        (Value::Object(map), Value::Number(n)) => map.get(&n.to_string()),
        (Value::Array(items), Value::Number(n)) => {
            n.as_u64().and_then(|i| items.get(i as usize))
        }
        (Value::Array(items), Value::String(k)) => {
            k.parse::<usize>().ok().and_then(|i| items.get(i))
        }
        _ => None,
    };
    found.cloned().unwrap_or(Value::Null)
}

/// Output is left as-is when the outermost filter already made it safe.
fn is_safe(expr: &Expr) -> bool {
    matches!(expr, Expr::Filter { name, .. } if matches!(name.as_str(), "raw" | "escape" | "e"))
}

struct Renderer<'r> {
    host: &'r mut dyn RenderHost,
    base: &'r Map<String, Value>,
    frames: Vec<Map<String, Value>>,
}

impl Renderer<'_> {
    fn var(&self, name: &str) -> Value {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name))
            .or_else(|| self.base.get(name))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Every visible variable, innermost winning.
    fn scope(&self) -> Map<String, Value> {
        let mut scope = self.base.clone();
        for frame in &self.frames {
            for (k, v) in frame {
                scope.insert(k.clone(), v.clone());
            }
        }
        scope
    }

    fn nodes(&mut self, nodes: &[Node], out: &mut String) -> Result<(), CmsError> {
        for node in nodes {
            self.node(node, out)?;
        }
        Ok(())
    }

    fn node(&mut self, node: &Node, out: &mut String) -> Result<(), CmsError> {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Print(expr) => {
                let text = to_text(&self.eval(expr)?);
                if is_safe(expr) {
                    out.push_str(&text);
                } else {
                    out.push_str(&escape_html(&text));
                }
            }
            Node::Page => out.push_str(&self.host.page_contents()?),
            Node::Partial { name, args } => {
                let name = to_text(&self.eval(name)?);
                let params = self.args(args)?;
                let scope = self.scope();
                out.push_str(&self.host.render_partial(&name, params, &scope)?);
            }
            Node::Component { alias, args } => {
                let alias = to_text(&self.eval(alias)?);
                let params = self.args(args)?;
                let scope = self.scope();
                out.push_str(&self.host.render_component(&alias, params, &scope)?);
            }
            Node::Content { name, args } => {
                let name = to_text(&self.eval(name)?);
                let params = self.args(args)?;
                out.push_str(&self.host.render_content(&name, params)?);
            }
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                if is_truthy(&self.eval(cond)?) {
                    self.nodes(then, out)?;
                } else {
                    self.nodes(otherwise, out)?;
                }
            }
            Node::For {
                key,
                value,
                iter,
                body,
                empty,
            } => {
                let items: Vec<(Value, Value)> = match self.eval(iter)? {
                    Value::Array(items) => items
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| (Value::from(i), v))
                        .collect(),
                    Value::Object(map) => map
                        .into_iter()
                        .map(|(k, v)| (Value::String(k), v))
                        .collect(),
                    _ => Vec::new(),
                };
                if items.is_empty() {
                    return self.nodes(empty, out);
                }

                let length = items.len();
                for (index, (k, v)) in items.into_iter().enumerate() {
                    let mut frame = Map::new();
                    if let Some(key) = key {
                        frame.insert(key.clone(), k);
                    }
                    frame.insert(value.clone(), v);
                    frame.insert(
                        "loop".to_string(),
                        serde_json::json!({
                            "index": index + 1,
                            "index0": index,
                            "first": index == 0,
                            "last": index + 1 == length,
                            "length": length,
                        }),
                    );
                    self.frames.push(frame);
                    let result = self.nodes(body, out);
                    self.frames.pop();
                    result?;
                }
            }
        }
        Ok(())
    }

    fn args(&mut self, args: &TagArgs) -> Result<Map<String, Value>, CmsError> {
        let mut map = Map::new();
        for (name, expr) in args {
            map.insert(name.clone(), self.eval(expr)?);
        }
        Ok(map)
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, CmsError> {
        Ok(match expr {
            Expr::Literal(v) => v.clone(),
            Expr::Var(name) => self.var(name),
            Expr::Lookup(base, key) => {
                let base = self.eval(base)?;
                let key = self.eval(key)?;
                lookup(&base, &key)
            }
            Expr::Map(entries) => {
                let mut map = Map::new();
                for (k, e) in entries {
                    map.insert(k.clone(), self.eval(e)?);
                }
                Value::Object(map)
            }
            Expr::List(items) => {
                let mut list = Vec::with_capacity(items.len());
                for e in items {
                    list.push(self.eval(e)?);
                }
                Value::Array(list)
            }
            Expr::Not(inner) => Value::Bool(!is_truthy(&self.eval(inner)?)),
            Expr::And(a, b) => {
                Value::Bool(is_truthy(&self.eval(a)?) && is_truthy(&self.eval(b)?))
            }
            Expr::Or(a, b) => Value::Bool(is_truthy(&self.eval(a)?) || is_truthy(&self.eval(b)?)),
            Expr::Compare(a, op, b) => {
                let left = self.eval(a)?;
                let right = self.eval(b)?;
                Value::Bool(compare(&left, *op, &right))
            }
            Expr::Filter { name, input, args } => {
                let input = self.eval(input)?;
                let mut evaluated = Vec::with_capacity(args.len());
                for a in args {
                    evaluated.push(self.eval(a)?);
                }
                self.filter(name, input, evaluated)?
            }
        })
    }

    fn filter(&mut self, name: &str, input: Value, args: Vec<Value>) -> Result<Value, CmsError> {
        Ok(match name {
            "raw" => input,
            "escape" | "e" => Value::String(escape_html(&to_text(&input))),
            "upper" => Value::String(to_text(&input).to_uppercase()),
            "lower" => Value::String(to_text(&input).to_lowercase()),
            "default" => {
                if is_empty(&input) {
                    args.into_iter().next().unwrap_or(Value::String(String::new()))
                } else {
                    input
                }
            }
            "length" => Value::from(match &input {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                _ => 1,
            }),
            "page" => {
                let params = match args.into_iter().next() {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                Value::String(self.host.page_url(&to_text(&input), params)?)
            }
            "theme" => Value::String(self.host.theme_url(&to_text(&input))),
            other => return Err(CmsError::Template(format!("unknown filter '{}'", other))),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
