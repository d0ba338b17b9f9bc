//! # Site
//!
//! Process-wide services shared by every request: configuration, the
//! component manager, registered page code, event listeners, the cache
//! service, the markup engine and loaded themes.
//!
//! ## Cache Backends
//!
//! - `memory`: a `MemoryStore`, lost on restart
//! - `redb`: a `RedbStore` at `<storage_path>/cms/cache.redb`, kept across
//!   restarts. redb locks the file exclusively, so only one process may use
//!   a given storage path
//!
//! Registration (`components_mut`, `code_mut`, `events_mut`) happens at
//! startup, before the site is shared.

use crate::cache::{CmsCache, MemoryStore};
use crate::code::CodeRegistry;
use crate::component::ComponentManager;
use crate::config::{CacheBackend, CmsConfig};
use crate::controller::Controller;
use crate::event::EventBus;
use crate::router::{Router, RouterOptions};
use crate::storage::RedbStore;
use crate::template::{MarkupEngine, escape_html};
use crate::theme::Theme;
use crate::types::{CmsRequest, CmsResponse};
use crate::CmsError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Shared engine services.
#[derive(Debug)]
pub struct Site {
    config: CmsConfig,
    components: ComponentManager,
    code: CodeRegistry,
    events: EventBus,
    cache: CmsCache,
    engine: MarkupEngine,
    themes: RwLock<HashMap<String, Arc<Theme>>>,
}

impl Site {
    /// Build a site, opening the configured cache backend.
    pub fn new(config: CmsConfig) -> Result<Self, CmsError> {
        let ttl = Duration::from_secs(config.parsed_page_cache_ttl);
        let cache = match config.cache_backend {
            CacheBackend::Memory => CmsCache::new(Arc::new(MemoryStore::new()), ttl),
            CacheBackend::Redb => {
                let path = Self::cache_file(&config);
                tracing::info!(path = %path.display(), "opening redb cache");
                CmsCache::new(Arc::new(RedbStore::open(path)?), ttl)
            }
        };
        Ok(Self::with_cache(config, cache))
    }

    /// Build a site over an existing cache service.
    #[must_use]
    pub fn with_cache(config: CmsConfig, cache: CmsCache) -> Self {
        Self {
            components: ComponentManager::new().with_strict(config.strict_components),
            code: CodeRegistry::new(),
            events: EventBus::new(),
            engine: MarkupEngine::from_config(&config),
            cache,
            themes: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Location of the redb cache file.
    #[must_use]
    pub fn cache_file(config: &CmsConfig) -> PathBuf {
        config.storage_path.join("cms").join("cache.redb")
    }

    // -------------------------------------------------------------------------
    // Services
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &CmsConfig {
        &self.config
    }

    #[must_use]
    pub fn components(&self) -> &ComponentManager {
        &self.components
    }

    pub fn components_mut(&mut self) -> &mut ComponentManager {
        &mut self.components
    }

    #[must_use]
    pub fn code(&self) -> &CodeRegistry {
        &self.code
    }

    pub fn code_mut(&mut self) -> &mut CodeRegistry {
        &mut self.code
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    #[must_use]
    pub fn cache(&self) -> &CmsCache {
        &self.cache
    }

    #[must_use]
    pub fn engine(&self) -> &MarkupEngine {
        &self.engine
    }

    // -------------------------------------------------------------------------
    // Themes
    // -------------------------------------------------------------------------

    /// Register a theme built elsewhere, e.g. over a `MemoryDatasource`.
    pub fn insert_theme(&self, theme: Theme) -> Arc<Theme> {
        let theme = Arc::new(theme);
        self.themes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(theme.dir_name().to_string(), Arc::clone(&theme));
        theme
    }

    /// A theme by directory name, loading it from `themes_path` once.
    pub fn theme(&self, dir_name: &str) -> Result<Arc<Theme>, CmsError> {
        if let Some(theme) = self
            .themes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(dir_name)
        {
            return Ok(Arc::clone(theme));
        }
        let theme = Theme::load(&self.config.themes_path, dir_name)?;
        tracing::debug!(theme = dir_name, key = theme.cache_key(), "theme loaded");
        Ok(self.insert_theme(theme))
    }

    pub fn active_theme(&self) -> Result<Arc<Theme>, CmsError> {
        self.theme(&self.config.active_theme)
    }

    /// The theme editors work on.
    pub fn edit_theme(&self) -> Result<Arc<Theme>, CmsError> {
        self.theme(self.config.edit_theme())
    }

    #[must_use]
    pub fn router_options(&self, theme: &Theme) -> RouterOptions {
        RouterOptions::from_config(&self.config, theme)
    }

    /// A router over `theme` wired to the site's cache and events.
    #[must_use]
    pub fn router<'a>(&'a self, theme: &'a Theme) -> Router<'a> {
        Router::new(theme, &self.cache, self.router_options(theme)).with_events(&self.events)
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Serve one request against the active theme.
    pub fn handle(&self, request: CmsRequest) -> CmsResponse {
        let theme = match self.active_theme() {
            Ok(theme) => theme,
            Err(err) => {
                tracing::error!(error = %err, theme = %self.config.active_theme, "active theme unavailable");
                let message = if self.config.debug {
                    err.to_string()
                } else {
                    "The site is not available.".to_string()
                };
                return CmsResponse::html(500, format!("<h1>Error</h1><p>{}</p>", escape_html(&message)));
            }
        };
        Controller::new(self, &theme).handle(request)
    }

    /// Drop every cached route, property map and parsed template of a theme.
    pub fn clear_cache(&self, theme: &Theme) {
        self.router(theme).clear_cache();
        self.cache.clear_component_properties(theme.cache_key());
        self.engine.clear_cache();
        tracing::info!(theme = theme.dir_name(), "theme caches cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectKind;
    use crate::theme::{MemoryDatasource, ThemeConfig};

    fn site() -> Site {
        let mut config = CmsConfig::default();
        config.active_theme = "mem".to_string();
        let site = Site::new(config).expect("site");
        let ds = MemoryDatasource::new().with(
            ObjectKind::Page,
            "home.htm",
            "url = \"/\"\n==\n<p>{{ this.theme.dirName }}</p>",
        );
        site.insert_theme(Theme::with_datasource(
            "mem",
            PathBuf::from("/themes/mem"),
            ThemeConfig::default(),
            Arc::new(ds),
        ));
        site
    }

    #[test]
    fn serves_active_theme() {
        let response = site().handle(CmsRequest::get("/"));
        assert_eq!(response.status, 200);
        assert_eq!(response.html_body(), Some("<p>mem</p>"));
    }

    #[test]
    fn missing_theme_is_a_server_error() {
        let mut config = CmsConfig::default();
        config.themes_path = PathBuf::from("/nonexistent/themes");
        let site = Site::new(config).expect("site");
        let response = site.handle(CmsRequest::get("/"));
        assert_eq!(response.status, 500);
        assert!(matches!(site.active_theme(), Err(CmsError::ThemeNotFound(_))));
    }

    #[test]
    fn redb_backend_opens_under_storage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = CmsConfig::default();
        config.storage_path = dir.path().to_path_buf();
        config.cache_backend = CacheBackend::Redb;

        let site = Site::new(config.clone()).expect("site");
        site.cache().put_json("k", &1_u32, Duration::from_secs(60));
        assert_eq!(site.cache().get_json::<u32>("k"), Some(1));
        assert!(Site::cache_file(&config).exists());
    }

    #[test]
    fn clear_cache_drops_component_properties() {
        let site = site();
        let theme = site.active_theme().expect("theme");
        let page = crate::object::CompoundObject::parse(
            ObjectKind::Page,
            "gallery.htm",
            "url = \"/gallery\"\n\n[gallery pics]\ncols = 3\n==\n",
            1,
        );
        let props = |site: &Site| {
            page.component_properties("pics", site.components(), site.cache(), theme.cache_key())
                .expect("props")
        };
        let fresh = props(&site);

        let object_code = format!("{}@{}", page.object_ref().path(), page.mtime());
        site.cache()
            .store_component_properties(theme.cache_key(), &object_code, "pics", &serde_json::Map::new());
        assert!(props(&site).is_empty());

        site.clear_cache(&theme);
        assert_eq!(props(&site), fresh);
    }
}
