//! Partial stack, component partials, content files and the markup host.

use super::{Controller, PartialFrame, is_valid_partial_name};
use crate::component::bind_properties;
use crate::event::{CmsEvent, EventResult};
use crate::object::CompoundObject;
use crate::primitives::MAX_PARTIAL_DEPTH;
use crate::template::{RenderHost, escape_html, to_text};
use crate::theme::normalize_file_name;
use crate::types::CmsResponse;
use crate::{CmsError, ErrorPhase, ObjectKind, ObjectRef, RouteParams};
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Variable holding the component whose partial is rendering.
const SELF_VAR: &str = "__SELF__";

static MEDIA_REF: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(?i)(\b(?:src|href)\s*=\s*["'])media:/*"#).ok());

/// Rewrite `media:` references in `src` and `href` attributes.
#[must_use]
pub fn rewrite_media_urls(html: &str, media_url: &str) -> String {
    let Some(re) = MEDIA_REF.as_ref() else {
        return html.to_string();
    };
    let base = media_url.trim_end_matches('/');
    re.replace_all(html, |caps: &Captures<'_>| {
        let attr = caps.get(1).map_or("", |m| m.as_str());
        format!("{}{}/", attr, base)
    })
    .into_owned()
}

/// Output of a partial hook that answered with a response.
fn response_output(response: CmsResponse) -> String {
    response.html_body().unwrap_or_default().to_string()
}

impl Controller<'_> {
    /// Render a partial with the page variables in scope.
    pub fn render_partial(&mut self, name: &str, params: Map<String, Value>) -> Result<String, CmsError> {
        let scope = self.ctx.vars.clone();
        self.render_partial_in(name, params, &scope)
    }

    fn render_partial_in(
        &mut self,
        name: &str,
        params: Map<String, Value>,
        scope: &Map<String, Value>,
    ) -> Result<String, CmsError> {
        if !is_valid_partial_name(name) {
            return Err(CmsError::InvalidPartialName(name.to_string()));
        }
        if self.partial_stack.len() >= MAX_PARTIAL_DEPTH {
            return Err(CmsError::Template(format!(
                "partial '{}' nested deeper than {} levels",
                name, MAX_PARTIAL_DEPTH
            )));
        }

        let site = self.site;
        if let Some(EventResult::Content(content)) =
            site.events().fire(&CmsEvent::BeforeRenderPartial { name })
        {
            return Ok(content);
        }

        let output = if let Some(partial) = name.strip_prefix('@') {
            let alias = self
                .component_context
                .last()
                .cloned()
                .ok_or_else(|| CmsError::PartialNotFound(name.to_string()))?;
            self.render_component_partial(&alias, partial, params, scope)?
        } else if let Some((alias, partial)) = name.split_once("::") {
            self.render_component_partial(alias, partial, params, scope)?
        } else {
            match self.find_object(ObjectKind::Partial, name)? {
                Some(partial) => self.render_theme_partial(&partial, params, scope)?,
                None => match self.component_context.last().cloned() {
                    Some(alias) => self.render_component_partial(&alias, name, params, scope)?,
                    None => return Err(CmsError::PartialNotFound(name.to_string())),
                },
            }
        };

        let answer = site.events().fire(&CmsEvent::RenderPartial {
            name,
            content: &output,
        });
        Ok(match answer {
            Some(EventResult::Content(content)) => content,
            _ => output,
        })
    }

    /// Push a frame, run the partial's components and code, render, pop.
    ///
    /// The caller's variables are restored whatever the outcome.
    fn render_theme_partial(
        &mut self,
        partial: &CompoundObject,
        params: Map<String, Value>,
        scope: &Map<String, Value>,
    ) -> Result<String, CmsError> {
        partial.validate()?;
        let partial_ref = partial.object_ref();

        let mut vars = scope.clone();
        vars.extend(params);
        let saved = std::mem::replace(&mut self.ctx.vars, vars);
        self.partial_stack.push(PartialFrame {
            partial: partial_ref.clone(),
            components: Vec::new(),
        });

        let result = self.run_partial(partial, &partial_ref);

        self.partial_stack.pop();
        self.ctx.vars = saved;
        result
    }

    fn run_partial(&mut self, partial: &CompoundObject, partial_ref: &ObjectRef) -> Result<String, CmsError> {
        let site = self.site;

        for decl in partial.component_declarations(false) {
            let made = site
                .components()
                .make_component(&decl.name, &decl.alias, decl.properties)
                .map_err(|e| e.mask(partial_ref, ErrorPhase::CodeInit))?;
            let Some(mut component) = made else {
                self.ctx.vars.insert(decl.alias, Value::Null);
                continue;
            };
            let bound = bind_properties(component.properties(), &self.ctx.params, &self.ctx.vars);
            component.set_properties(bound);
            component
                .init(&mut self.ctx)
                .map_err(|e| e.mask(partial_ref, ErrorPhase::CodeInit))?;
            self.ctx
                .vars
                .insert(decl.alias.clone(), component.template_value());
            if let Some(frame) = self.partial_stack.last_mut() {
                frame.components.push(component);
            }
        }

        let exec = |e: CmsError| e.mask(partial_ref, ErrorPhase::Execution);
        let mut code = site.code().instantiate(&partial_ref.path());
        if let Some(response) = code.on_start(&mut self.ctx).map_err(exec)? {
            return Ok(response_output(response));
        }

        if let Some(frame) = self.partial_stack.last_mut() {
            for component in &mut frame.components {
                if let Some(response) = component.on_run(&mut self.ctx).map_err(exec)? {
                    return Ok(response_output(response));
                }
                self.ctx
                    .vars
                    .insert(component.alias().to_string(), component.template_value());
            }
        }

        if let Some(response) = code.on_end(&mut self.ctx).map_err(exec)? {
            return Ok(response_output(response));
        }

        self.render_object(partial)
    }

    /// Render partial `name` of the component bound to `alias`.
    ///
    /// A theme partial at `<alias>/<name>` overrides the component's own
    /// markup.
    fn render_component_partial(
        &mut self,
        alias: &str,
        name: &str,
        params: Map<String, Value>,
        scope: &Map<String, Value>,
    ) -> Result<String, CmsError> {
        let slot = self
            .locate(alias)
            .ok_or_else(|| CmsError::ComponentAliasNotFound(alias.to_string()))?;
        let (self_value, builtin, class) = match self.component(slot) {
            Some(c) => (c.template_value(), c.partial(name), c.class().to_string()),
            None => return Err(CmsError::ComponentAliasNotFound(alias.to_string())),
        };

        let mut vars = scope.clone();
        vars.insert(SELF_VAR.to_string(), self_value);
        let theme_override = self.find_object(ObjectKind::Partial, &format!("{}/{}", alias, name))?;

        self.component_context.push(alias.to_string());
        let result = match (theme_override, builtin) {
            (Some(partial), _) => self.render_theme_partial(&partial, params, &vars),
            (None, Some(markup)) => {
                vars.extend(params);
                let saved = std::mem::replace(&mut self.ctx.vars, vars);
                let owner = ObjectRef::new(ObjectKind::Partial, format!("{}::{}", alias, name));
                let key = format!("component:{}/{}", class, name);
                let rendered = self.render_markup(&key, &markup, &owner);
                self.ctx.vars = saved;
                rendered
            }
            (None, None) => Err(CmsError::PartialNotFound(format!("{}::{}", alias, name))),
        };
        self.component_context.pop();
        result
    }

    fn render_content_file(&mut self, name: &str, params: Map<String, Value>) -> Result<String, CmsError> {
        let Some(source) = self.theme.find_content(name)? else {
            return Err(CmsError::ContentNotFound(name.to_string()));
        };

        let file_name = normalize_file_name(name);
        let is_html = file_name.ends_with(".htm") || file_name.ends_with(".html");
        let mut text = if is_html {
            source.content
        } else {
            escape_html(&source.content)
        };
        for (key, value) in &params {
            text = text.replace(&format!("{{{}}}", key), &escape_html(&to_text(value)));
        }
        Ok(text)
    }
}

// =============================================================================
// MARKUP HOST
// =============================================================================

impl RenderHost for Controller<'_> {
    fn page_contents(&mut self) -> Result<String, CmsError> {
        Ok(self.page_contents.clone().unwrap_or_default())
    }

    fn render_partial(
        &mut self,
        name: &str,
        params: Map<String, Value>,
        scope: &Map<String, Value>,
    ) -> Result<String, CmsError> {
        self.render_partial_in(name, params, scope)
    }

    fn render_component(
        &mut self,
        alias: &str,
        params: Map<String, Value>,
        scope: &Map<String, Value>,
    ) -> Result<String, CmsError> {
        self.render_component_partial(alias, "default", params, scope)
    }

    fn render_content(&mut self, name: &str, params: Map<String, Value>) -> Result<String, CmsError> {
        self.render_content_file(name, params)
    }

    fn page_url(&mut self, name: &str, params: Map<String, Value>) -> Result<String, CmsError> {
        let params: RouteParams = params.iter().map(|(k, v)| (k.clone(), to_text(v))).collect();
        Ok(Controller::page_url(self, name, &params, true).unwrap_or_default())
    }

    fn theme_url(&mut self, path: &str) -> String {
        format!(
            "/themes/{}/{}",
            self.theme.dir_name(),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_references_rewritten() {
        let html = r#"<img src="media:/photos/a.jpg"><a href='media:doc.pdf'>x</a> media:plain"#;
        assert_eq!(
            rewrite_media_urls(html, "/storage/app/media/"),
            r#"<img src="/storage/app/media/photos/a.jpg"><a href='/storage/app/media/doc.pdf'>x</a> media:plain"#
        );
    }
}
