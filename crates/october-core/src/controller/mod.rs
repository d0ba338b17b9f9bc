//! # Controller
//!
//! Runs one request through the page lifecycle:
//!
//! ```text
//! run(url)
//!   route -> hidden check -> maintenance -> cms.page.beforeDisplay -> 404 chain
//! run_page(page)
//!   layout -> variables -> code objects -> components (layout, then page)
//!   -> cms.page.init -> layout.onInit -> page.onInit
//!   -> AJAX handler | postback handler
//!   -> page cycle -> render page -> render layout -> postprocess
//! ```
//!
//! Any hook or event answering with a response ends the pipeline with
//! that response. Partials rendered from markup push a frame on the
//! partial stack so each nesting level gets its own component namespace.

mod ajax;
mod partials;

pub use ajax::{is_valid_handler_name, is_valid_partial_name};
pub use partials::rewrite_media_urls;

use crate::code::{EmptyCode, PageCode, PageContext};
use crate::component::{ComponentInstance, bind_properties};
use crate::event::{CmsEvent, EventResult};
use crate::object::CompoundObject;
use crate::primitives::{ERROR_URL, NOT_FOUND_URL, VIEW_BAG_CODE};
use crate::router::{Router, normalize_url};
use crate::site::Site;
use crate::template::escape_html;
use crate::theme::{Theme, normalize_file_name};
use crate::types::{CmsRequest, CmsResponse, ResponseBody};
use crate::{CmsError, ErrorPhase, ObjectKind, ObjectRef, RouteParams};
use serde_json::{Map, Value, json};
use std::fmt;
use std::time::Duration;

const NOT_FOUND_HTML: &str = "<!DOCTYPE html>\n<html><head><title>Page not found</title></head>\
<body><h1>Page not found</h1><p>The requested page cannot be found.</p></body></html>";

const GENERIC_ERROR: &str = "We're sorry, but something went wrong and the page cannot be displayed.";

// =============================================================================
// PARTIAL STACK
// =============================================================================

/// Components attached while one partial renders.
#[derive(Debug)]
struct PartialFrame {
    partial: ObjectRef,
    components: Vec<ComponentInstance>,
}

/// Where a component instance lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Partial(usize, usize),
    Page(usize),
    Layout(usize),
}

/// Map a halting event answer to the response it carries, if any.
fn into_response(result: EventResult) -> Option<CmsResponse> {
    match result {
        EventResult::Response(response) => Some(response),
        EventResult::Content(content) => Some(CmsResponse::html(200, content)),
        EventResult::Page(_) | EventResult::Halt => None,
    }
}

/// Map a component event answer to the response ending the page cycle.
///
/// An answer without a response still ends the cycle, with an empty page.
fn halt_response(result: EventResult) -> CmsResponse {
    into_response(result).unwrap_or_else(|| CmsResponse::html(200, String::new()))
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Per-request page controller over one theme.
pub struct Controller<'a> {
    site: &'a Site,
    theme: &'a Theme,
    router: Router<'a>,
    ctx: PageContext,
    page: Option<CompoundObject>,
    layout: Option<CompoundObject>,
    page_file: Option<String>,
    page_code: Box<dyn PageCode>,
    layout_code: Box<dyn PageCode>,
    page_components: Vec<ComponentInstance>,
    layout_components: Vec<ComponentInstance>,
    partial_stack: Vec<PartialFrame>,
    /// Aliases of the components whose partials are rendering.
    component_context: Vec<String>,
    page_contents: Option<String>,
}

impl fmt::Debug for Controller<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("theme", &self.theme.dir_name())
            .field("url", &self.ctx.url)
            .field("page", &self.page_file)
            .field("partial_depth", &self.partial_stack.len())
            .finish_non_exhaustive()
    }
}

impl<'a> Controller<'a> {
    #[must_use]
    pub fn new(site: &'a Site, theme: &'a Theme) -> Self {
        let router =
            Router::new(theme, site.cache(), site.router_options(theme)).with_events(site.events());
        Self {
            site,
            theme,
            router,
            ctx: PageContext::new(CmsRequest::get("/"), "/"),
            page: None,
            layout: None,
            page_file: None,
            page_code: Box::new(EmptyCode),
            layout_code: Box::new(EmptyCode),
            page_components: Vec::new(),
            layout_components: Vec::new(),
            partial_stack: Vec::new(),
            component_context: Vec::new(),
            page_contents: None,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn theme(&self) -> &Theme {
        self.theme
    }

    #[must_use]
    pub fn router(&mut self) -> &mut Router<'a> {
        &mut self.router
    }

    #[must_use]
    pub fn context(&self) -> &PageContext {
        &self.ctx
    }

    #[must_use]
    pub fn vars(&self) -> &Map<String, Value> {
        &self.ctx.vars
    }

    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.ctx.params.get(name)
    }

    /// The page the last `run_page` served.
    #[must_use]
    pub fn page(&self) -> Option<&CompoundObject> {
        self.page.as_ref()
    }

    #[must_use]
    pub fn layout(&self) -> Option<&CompoundObject> {
        self.layout.as_ref()
    }

    /// Page components in declaration order.
    #[must_use]
    pub fn page_components(&self) -> &[ComponentInstance] {
        &self.page_components
    }

    /// Layout components in declaration order.
    #[must_use]
    pub fn layout_components(&self) -> &[ComponentInstance] {
        &self.layout_components
    }

    /// Partials currently rendering, outermost first.
    #[must_use]
    pub fn partial_stack(&self) -> Vec<&ObjectRef> {
        self.partial_stack.iter().map(|frame| &frame.partial).collect()
    }

    fn object_ttl(&self) -> Duration {
        Duration::from_secs(self.site.config().parsed_page_cache_ttl)
    }

    fn find_object(&self, kind: ObjectKind, name: &str) -> Result<Option<CompoundObject>, CmsError> {
        self.theme
            .find(kind, name, self.site.cache(), self.object_ttl())
    }

    // -------------------------------------------------------------------------
    // Entry points
    // -------------------------------------------------------------------------

    /// Serve a request, turning errors into error pages.
    pub fn handle(&mut self, request: CmsRequest) -> CmsResponse {
        match self.run(request) {
            Ok(response) => response,
            Err(err) => self.render_error(&err),
        }
    }

    /// Resolve the request URL to a page and run it.
    pub fn run(&mut self, request: CmsRequest) -> Result<CmsResponse, CmsError> {
        let site = self.site;
        let config = site.config();
        let url = normalize_url(&request.url).unwrap_or_else(|| request.url.clone());
        let backend_user = request.backend_user;
        let is_ajax = request.is_ajax();
        self.ctx = PageContext::new(request, url.clone());

        let mut page = self.router.find_by_url(&url);
        self.ctx.params = self.router.parameters().clone();

        if page.as_ref().is_some_and(CompoundObject::is_hidden) && !backend_user {
            tracing::debug!(url = %url, "hidden page requested without a backend session");
            page = None;
        }

        let mut status = 200;
        if config.maintenance.enabled && !backend_user {
            if let Some(name) = config.maintenance.page.as_deref() {
                if let Some(maintenance) = self.find_object(ObjectKind::Page, name)? {
                    page = Some(maintenance);
                    self.ctx.params = RouteParams::new();
                }
            }
            if !is_ajax {
                status = 503;
            }
        }

        let answer = site.events().fire(&CmsEvent::BeforeDisplay {
            url: &url,
            page: page.as_ref(),
        });
        match answer {
            Some(EventResult::Response(response)) => return Ok(response),
            Some(EventResult::Content(content)) => return Ok(CmsResponse::html(status, content)),
            Some(EventResult::Page(name)) => page = self.find_object(ObjectKind::Page, &name)?,
            Some(EventResult::Halt) | None => {}
        }

        let page = match page {
            Some(page) => page,
            None => {
                if !config.testing {
                    tracing::info!(url = %url, "page not found");
                }
                status = 404;
                match self.router.find_by_url(NOT_FOUND_URL) {
                    Some(page) => {
                        self.ctx.params = RouteParams::new();
                        page
                    }
                    None => return Ok(CmsResponse::html(404, NOT_FOUND_HTML)),
                }
            }
        };

        let mut response = self.run_page(page, true)?;
        if response.status == 200 {
            response.status = status;
        }

        let answer = match &response.body {
            ResponseBody::Html(html) => site.events().fire(&CmsEvent::Display {
                url: &url,
                content: html,
            }),
            _ => None,
        };
        match answer {
            Some(EventResult::Response(replacement)) => Ok(replacement),
            Some(EventResult::Content(content)) => {
                response.body = ResponseBody::Html(content);
                Ok(response)
            }
            _ => Ok(response),
        }
    }

    /// Run a page through its lifecycle and render it.
    pub fn run_page(&mut self, page: CompoundObject, use_ajax: bool) -> Result<CmsResponse, CmsError> {
        let layout = match page.layout() {
            Some(name) => self.find_object(ObjectKind::Layout, name)?.ok_or_else(|| {
                CmsError::LayoutNotFound(name.to_string())
                    .mask(&page.object_ref(), ErrorPhase::CodeInit)
            })?,
            None => CompoundObject::fallback_layout(),
        };

        let result = self.run_loaded(&page, &layout, use_ajax);
        self.page = Some(page);
        self.layout = Some(layout);
        result
    }

    fn run_loaded(
        &mut self,
        page: &CompoundObject,
        layout: &CompoundObject,
        use_ajax: bool,
    ) -> Result<CmsResponse, CmsError> {
        let site = self.site;
        page.validate()?;
        layout.validate()?;
        tracing::debug!(page = page.file_name(), layout = layout.file_name(), "running page");

        self.page_file = Some(page.file_name().to_string());
        self.page_contents = None;
        self.partial_stack.clear();
        self.component_context.clear();
        self.page_components.clear();
        self.layout_components.clear();

        self.seed_vars(page, layout);

        self.page_code = site.code().instantiate(&page.object_ref().path());
        self.layout_code = if layout.is_fallback() {
            Box::new(EmptyCode)
        } else {
            site.code().instantiate(&layout.object_ref().path())
        };

        self.init_components(page, layout)?;

        if let Some(answer) = site.events().fire(&CmsEvent::PageInit { page }) {
            if let Some(response) = into_response(answer) {
                return Ok(response);
            }
        }

        let layout_ref = layout.object_ref();
        let page_ref = page.object_ref();
        if let Some(response) = self
            .layout_code
            .on_init(&mut self.ctx)
            .map_err(|e| e.mask(&layout_ref, ErrorPhase::CodeInit))?
        {
            return Ok(response);
        }
        if let Some(response) = self
            .page_code
            .on_init(&mut self.ctx)
            .map_err(|e| e.mask(&page_ref, ErrorPhase::CodeInit))?
        {
            return Ok(response);
        }

        if use_ajax {
            if let Some(response) = self.exec_ajax_handlers(page, layout)? {
                return Ok(response);
            }
        }
        if let Some(response) = self.exec_postback_handler(page, layout)? {
            return Ok(response);
        }
        if let Some(response) = self.exec_page_cycle(page, layout)? {
            return Ok(response);
        }

        let html = self.render_page(page, layout)?;
        Ok(CmsResponse::html(200, html))
    }

    // -------------------------------------------------------------------------
    // Initialisation
    // -------------------------------------------------------------------------

    fn seed_vars(&mut self, page: &CompoundObject, layout: &CompoundObject) {
        let config = self.site.config();
        let request = &self.ctx.request;

        let mut view_bag = layout.view_bag().clone();
        for (k, v) in page.view_bag() {
            view_bag.insert(k.clone(), v.clone());
        }

        let errors: Map<String, Value> = request
            .session
            .errors
            .iter()
            .map(|(field, messages)| (field.clone(), Value::from(messages.clone())))
            .collect();
        let old: Map<String, Value> = request
            .session
            .old_input
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();

        let this = json!({
            "page": page.template_attributes(),
            "layout": layout.template_attributes(),
            "theme": self.theme.template_attributes(),
            "param": self.ctx.params.to_json(),
            "environment": config.environment,
            "session": Value::Object(request.session.values.clone()),
            "controller": {
                "url": self.ctx.url,
                "ajax": request.is_ajax(),
            },
        });

        let mut vars = Map::new();
        vars.insert("this".to_string(), this);
        vars.insert("errors".to_string(), Value::Object(errors));
        vars.insert("old".to_string(), Value::Object(old));
        vars.insert(VIEW_BAG_CODE.to_string(), Value::Object(view_bag));
        self.ctx.vars = vars;
    }

    /// Attach layout components, then page components.
    fn init_components(&mut self, page: &CompoundObject, layout: &CompoundObject) -> Result<(), CmsError> {
        let site = self.site;
        for (object, is_layout) in [(layout, true), (page, false)] {
            let owner = object.object_ref();
            for decl in object.component_declarations(false) {
                let made = site
                    .components()
                    .make_component(&decl.name, &decl.alias, decl.properties)
                    .map_err(|e| e.mask(&owner, ErrorPhase::CodeInit))?;
                let Some(mut component) = made else {
                    self.ctx.vars.insert(decl.alias, Value::Null);
                    continue;
                };

                let bound = bind_properties(component.properties(), &self.ctx.params, &self.ctx.vars);
                component.set_properties(bound);
                component
                    .init(&mut self.ctx)
                    .map_err(|e| e.mask(&owner, ErrorPhase::CodeInit))?;
                self.ctx
                    .vars
                    .insert(decl.alias.clone(), component.template_value());

                if is_layout {
                    self.layout_components.push(component);
                } else {
                    self.page_components.push(component);
                }
            }
        }

        site.events()
            .fire(&CmsEvent::InitComponents { page, layout });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Page cycle
    // -------------------------------------------------------------------------

    fn exec_page_cycle(
        &mut self,
        page: &CompoundObject,
        layout: &CompoundObject,
    ) -> Result<Option<CmsResponse>, CmsError> {
        let site = self.site;
        let events = site.events();
        if let Some(answer) = events.fire(&CmsEvent::PageStart { page }) {
            if let Some(response) = into_response(answer) {
                return Ok(Some(response));
            }
        }

        let layout_ref = layout.object_ref();
        let page_ref = page.object_ref();
        let exec = |e: CmsError, object: &ObjectRef| e.mask(object, ErrorPhase::Execution);

        if let Some(r) = self.layout_code.on_start(&mut self.ctx).map_err(|e| exec(e, &layout_ref))? {
            return Ok(Some(r));
        }
        if let Some(r) = self.run_components(true, &layout_ref)? {
            return Ok(Some(r));
        }
        if let Some(r) = self
            .layout_code
            .on_before_page_start(&mut self.ctx)
            .map_err(|e| exec(e, &layout_ref))?
        {
            return Ok(Some(r));
        }

        if let Some(r) = self.page_code.on_start(&mut self.ctx).map_err(|e| exec(e, &page_ref))? {
            return Ok(Some(r));
        }
        if let Some(r) = self.run_components(false, &page_ref)? {
            return Ok(Some(r));
        }
        if let Some(r) = self.page_code.on_end(&mut self.ctx).map_err(|e| exec(e, &page_ref))? {
            return Ok(Some(r));
        }

        if let Some(r) = self.layout_code.on_end(&mut self.ctx).map_err(|e| exec(e, &layout_ref))? {
            return Ok(Some(r));
        }

        Ok(events
            .fire(&CmsEvent::PageEnd { page })
            .and_then(into_response))
    }

    /// Run components in declaration order, halting at the first event
    /// answer or `on_run` response. Any answer ends the page cycle.
    fn run_components(&mut self, layout: bool, owner: &ObjectRef) -> Result<Option<CmsResponse>, CmsError> {
        let site = self.site;
        let events = site.events();
        let components = if layout {
            &mut self.layout_components
        } else {
            &mut self.page_components
        };

        for component in components.iter_mut() {
            if let Some(answer) = events.fire(&CmsEvent::ComponentBeforeRun {
                alias: component.alias(),
            }) {
                tracing::debug!(alias = component.alias(), "component run halted before start");
                return Ok(Some(halt_response(answer)));
            }
            if let Some(response) = component
                .on_run(&mut self.ctx)
                .map_err(|e| e.mask(owner, ErrorPhase::Execution))?
            {
                return Ok(Some(response));
            }
            self.ctx
                .vars
                .insert(component.alias().to_string(), component.template_value());
            if let Some(answer) = events.fire(&CmsEvent::ComponentRun {
                alias: component.alias(),
            }) {
                tracing::debug!(alias = component.alias(), "component run halted");
                return Ok(Some(halt_response(answer)));
            }
        }
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Rendering
    // -------------------------------------------------------------------------

    fn render_page(&mut self, page: &CompoundObject, layout: &CompoundObject) -> Result<String, CmsError> {
        let site = self.site;
        let events = site.events();

        let contents = match events.fire(&CmsEvent::BeforeRenderPage { page }) {
            Some(EventResult::Content(content)) => content,
            _ => self.render_object(page)?,
        };
        self.page_contents = Some(contents);

        let html = self.render_object(layout)?;
        let html = rewrite_media_urls(&html, &site.config().media_url);

        let answer = events.fire(&CmsEvent::PostProcess {
            url: &self.ctx.url,
            content: &html,
        });
        Ok(match answer {
            Some(EventResult::Content(content)) => content,
            _ => html,
        })
    }

    /// Render an object's markup against the current variables.
    fn render_object(&mut self, object: &CompoundObject) -> Result<String, CmsError> {
        let object_ref = object.object_ref();
        let key = format!("{}@{}", object_ref.path(), object.mtime());
        self.render_markup(&key, object.markup(), &object_ref)
    }

    fn render_markup(&mut self, key: &str, markup: &str, owner: &ObjectRef) -> Result<String, CmsError> {
        let key = format!("{}{}", self.theme.cache_key(), key);
        let template = self
            .site
            .engine()
            .load(&key, markup)
            .map_err(|e| e.mask(owner, ErrorPhase::Render))?;
        let vars = self.ctx.vars.clone();
        template
            .render(&vars, self)
            .map_err(|e| e.mask(owner, ErrorPhase::Render))
    }

    // -------------------------------------------------------------------------
    // URLs
    // -------------------------------------------------------------------------

    /// URL of a page. An empty name means the current page.
    ///
    /// With `persist`, current routing parameters fill in whatever
    /// `params` leaves out.
    pub fn page_url(&mut self, name: &str, params: &RouteParams, persist: bool) -> Option<String> {
        let file_name = if name.is_empty() {
            self.page_file.clone()?
        } else {
            normalize_file_name(name)
        };
        let params = if persist {
            self.ctx.params.merged(params)
        } else {
            params.clone()
        };
        self.router.find_by_file(&file_name, &params)
    }

    // -------------------------------------------------------------------------
    // Component lookup
    // -------------------------------------------------------------------------

    /// Innermost partial first, then page, then layout.
    fn locate(&self, alias: &str) -> Option<Slot> {
        for (f, frame) in self.partial_stack.iter().enumerate().rev() {
            if let Some(i) = frame.components.iter().position(|c| c.alias() == alias) {
                return Some(Slot::Partial(f, i));
            }
        }
        if let Some(i) = self.page_components.iter().position(|c| c.alias() == alias) {
            return Some(Slot::Page(i));
        }
        self.layout_components
            .iter()
            .position(|c| c.alias() == alias)
            .map(Slot::Layout)
    }

    fn component(&self, slot: Slot) -> Option<&ComponentInstance> {
        match slot {
            Slot::Partial(f, i) => self.partial_stack.get(f)?.components.get(i),
            Slot::Page(i) => self.page_components.get(i),
            Slot::Layout(i) => self.layout_components.get(i),
        }
    }

    fn with_component<R>(
        &mut self,
        slot: Slot,
        f: impl FnOnce(&mut ComponentInstance, &mut PageContext) -> R,
    ) -> Option<R> {
        let component = match slot {
            Slot::Partial(frame, i) => self.partial_stack.get_mut(frame)?.components.get_mut(i),
            Slot::Page(i) => self.page_components.get_mut(i),
            Slot::Layout(i) => self.layout_components.get_mut(i),
        }?;
        Some(f(component, &mut self.ctx))
    }

    /// Component bound to `alias` anywhere in scope.
    #[must_use]
    pub fn find_component(&self, alias: &str) -> Option<&ComponentInstance> {
        self.component(self.locate(alias)?)
    }

    // -------------------------------------------------------------------------
    // Errors
    // -------------------------------------------------------------------------

    /// Response for an error that escaped the lifecycle.
    ///
    /// AJAX requests get plain text. Debug mode shows the details; otherwise
    /// the theme's error page is used when present. Internal failures are
    /// never described to visitors outside debug mode.
    pub fn render_error(&mut self, err: &CmsError) -> CmsResponse {
        let site = self.site;
        let config = site.config();
        tracing::error!(error = %err, lang = err.lang_key(), url = %self.ctx.url, "request failed");

        let message = if config.debug || !err.is_internal() {
            err.to_string()
        } else {
            GENERIC_ERROR.to_string()
        };

        if self.ctx.request.is_ajax() {
            return CmsResponse::text(500, message);
        }
        if config.debug {
            return CmsResponse::html(500, debug_page(err));
        }

        if let Some(page) = self.router.find_by_url(ERROR_URL) {
            match self.run_page(page, false) {
                Ok(mut response) => {
                    if response.status == 200 {
                        response.status = 500;
                    }
                    return response;
                }
                Err(e) => tracing::warn!(error = %e, "error page failed to render"),
            }
        }

        CmsResponse::html(
            500,
            format!(
                "<!DOCTYPE html>\n<html><head><title>Error</title></head><body><h1>Error</h1><p>{}</p></body></html>",
                escape_html(&message)
            ),
        )
    }
}

fn debug_page(err: &CmsError) -> String {
    let mut html = format!(
        "<!DOCTYPE html>\n<html><head><title>{0}</title></head><body><h1>{0}</h1><p>{1}</p>",
        escape_html(err.lang_key()),
        escape_html(&err.unmasked().to_string()),
    );
    if let CmsError::Masked { object, phase, .. } = err {
        html.push_str(&format!(
            "<p>In <code>{}</code>, phase {}.</p>",
            escape_html(&object.to_string()),
            phase.code()
        ));
    }
    html.push_str("</body></html>");
    html
}
