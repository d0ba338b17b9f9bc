//! # Router
//!
//! Maps request URLs to theme pages and pages back to URLs.
//!
//! Rule tables come from three sources, tried in order:
//! 1. a baked manifest file (`bake_manifest`),
//! 2. the dynamic route table cache,
//! 3. a fresh compile over every page in the theme.
//!
//! Successful resolutions are also memoized per URL. Both cache layers are
//! namespaced by theme path hash and locale. When a memoized resolution
//! points at a page that no longer exists, every route cache is cleared
//! and the URL is resolved once more from scratch.

mod rule;

pub use rule::{RouteRule, RuleTable, normalize_url};

use crate::cache::CmsCache;
use crate::config::CmsConfig;
use crate::event::{CmsEvent, EventBus, EventResult};
use crate::formats::{ManifestEntry, manifest_from_bytes, manifest_to_bytes};
use crate::object::CompoundObject;
use crate::theme::{Theme, normalize_file_name};
use crate::{CmsError, ObjectKind, RouteParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

const URL_MAP_KEY: &str = "page-url-map";
const URL_LIST_KEY: &str = "page-url-list";

/// A memoized URL resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UrlMemo {
    file_name: String,
    params: RouteParams,
}

type UrlMap = BTreeMap<String, UrlMemo>;

/// Router behaviour knobs, usually derived from `CmsConfig`.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub locale: String,
    /// Enables the dynamic table cache and the URL memo.
    pub cache_routes: bool,
    pub url_ttl: Duration,
    pub table_ttl: Duration,
    /// Baked manifest location; `None` disables manifests.
    pub manifest_path: Option<PathBuf>,
}

impl RouterOptions {
    #[must_use]
    pub fn from_config(config: &CmsConfig, theme: &Theme) -> Self {
        Self {
            locale: config.locale.clone(),
            cache_routes: config.enable_route_cache,
            url_ttl: Duration::from_secs(config.url_cache_ttl),
            table_ttl: Duration::from_secs(config.parsed_page_cache_ttl),
            manifest_path: Some(theme.manifest_path(&config.storage_path)),
        }
    }
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            locale: "en".to_string(),
            cache_routes: true,
            url_ttl: Duration::from_secs(600),
            table_ttl: Duration::from_secs(600),
            manifest_path: None,
        }
    }
}

/// Per-request router over one theme.
#[derive(Debug)]
pub struct Router<'a> {
    theme: &'a Theme,
    cache: &'a CmsCache,
    events: Option<&'a EventBus>,
    options: RouterOptions,
    parameters: RouteParams,
    table: Option<RuleTable>,
}

impl<'a> Router<'a> {
    #[must_use]
    pub fn new(theme: &'a Theme, cache: &'a CmsCache, options: RouterOptions) -> Self {
        Self {
            theme,
            cache,
            events: None,
            options,
            parameters: RouteParams::new(),
            table: None,
        }
    }

    /// Fire `cms.router.beforeRoute` through this bus.
    #[must_use]
    pub fn with_events(mut self, events: &'a EventBus) -> Self {
        self.events = Some(events);
        self
    }

    // -------------------------------------------------------------------------
    // URL -> page
    // -------------------------------------------------------------------------

    /// Resolve a URL to a page, recording the extracted parameters.
    ///
    /// A miss is `None`, never an error. Datasource failures are logged
    /// and treated as misses.
    pub fn find_by_url(&mut self, url: &str) -> Option<CompoundObject> {
        self.parameters = RouteParams::new();
        let Some(url) = normalize_url(url) else {
            tracing::debug!("url exceeds the length limit");
            return None;
        };

        if let Some(events) = self.events {
            if let Some(EventResult::Page(file_name)) =
                events.fire(&CmsEvent::BeforeRoute { url: &url })
            {
                return self.load_page(&file_name);
            }
        }

        for pass in 0..2 {
            let (file_name, params) = self.resolve(&url)?;
            match self.load_page(&file_name) {
                Some(page) => {
                    self.parameters = params;
                    return Some(page);
                }
                None => {
                    tracing::info!(%url, file = %file_name, pass, "routed page is missing, clearing route cache");
                    self.clear_cache();
                }
            }
        }
        None
    }

    fn resolve(&mut self, url: &str) -> Option<(String, RouteParams)> {
        let map_key = self.cache_key(URL_MAP_KEY);
        let mut url_map: UrlMap = if self.options.cache_routes {
            self.cache.get_postcard(&map_key).unwrap_or_default()
        } else {
            UrlMap::new()
        };

        if let Some(memo) = url_map.get(url) {
            return Some((memo.file_name.clone(), memo.params.clone()));
        }

        let (file_name, params) = {
            let table = self.table();
            let (rule, params) = table.find(url)?;
            (rule.file_name().to_string(), params)
        };

        if self.options.cache_routes {
            url_map.insert(
                url.to_string(),
                UrlMemo {
                    file_name: file_name.clone(),
                    params: params.clone(),
                },
            );
            self.cache
                .put_postcard(&map_key, &url_map, self.options.url_ttl);
        }
        Some((file_name, params))
    }

    fn load_page(&self, file_name: &str) -> Option<CompoundObject> {
        match self
            .theme
            .find(ObjectKind::Page, file_name, self.cache, self.options.table_ttl)
        {
            Ok(page) => page,
            Err(e) => {
                tracing::error!(file = %file_name, error = %e, "cannot load routed page");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Page -> URL
    // -------------------------------------------------------------------------

    /// URL of a page given parameter values.
    ///
    /// `None` when the page has no route or a required parameter is missing.
    pub fn find_by_file(&mut self, file_name: &str, params: &RouteParams) -> Option<String> {
        let file_name = normalize_file_name(file_name);
        self.table().rule_for_file(&file_name)?.url(params)
    }

    /// Parameters extracted by the last successful `find_by_url`.
    #[must_use]
    pub fn parameters(&self) -> &RouteParams {
        &self.parameters
    }

    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name)
    }

    pub fn set_parameters(&mut self, params: RouteParams) {
        self.parameters = params;
    }

    /// Routes in match order as `(pattern, file name)`.
    pub fn routes(&mut self) -> Vec<(String, String)> {
        self.table()
            .rules()
            .iter()
            .map(|r| (r.pattern().to_string(), r.file_name().to_string()))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Rule table sources
    // -------------------------------------------------------------------------

    fn cache_key(&self, name: &str) -> String {
        format!("{}{}{}", self.theme.cache_key(), name, self.options.locale)
    }

    fn table(&mut self) -> &RuleTable {
        if self.table.is_none() {
            let table = self.load_table();
            tracing::debug!(theme = self.theme.dir_name(), rules = table.len(), "route table ready");
            self.table = Some(table);
        }
        self.table.get_or_insert_with(RuleTable::default)
    }

    fn load_table(&self) -> RuleTable {
        if let Some(entries) = self.read_manifest() {
            return RuleTable::from_entries(&entries);
        }

        let list_key = self.cache_key(URL_LIST_KEY);
        if self.options.cache_routes {
            if let Some(entries) = self.cache.get_postcard::<Vec<ManifestEntry>>(&list_key) {
                return RuleTable::from_entries(&entries);
            }
        }

        let table = RuleTable::from_entries(&self.scan_pages());
        if self.options.cache_routes {
            self.cache
                .put_postcard(&list_key, &table.entries(), self.options.table_ttl);
        }
        table
    }

    fn read_manifest(&self) -> Option<Vec<ManifestEntry>> {
        let path = self.options.manifest_path.as_ref()?;
        let bytes = std::fs::read(path).ok()?;
        match manifest_from_bytes(&bytes) {
            Ok(entries) => Some(entries),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable route manifest");
                None
            }
        }
    }

    /// Every page of the theme that declares a URL.
    fn scan_pages(&self) -> Vec<ManifestEntry> {
        let files = match self.theme.list_pages() {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(theme = self.theme.dir_name(), error = %e, "cannot list pages");
                return Vec::new();
            }
        };

        files
            .iter()
            .filter_map(|file| {
                let page = self.load_page(file)?;
                let pattern = page.url()?.to_string();
                Some(ManifestEntry {
                    file_name: file.clone(),
                    pattern,
                })
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Drop the URL memo, the cached table and any baked manifest.
    pub fn clear_cache(&mut self) {
        self.cache.forget(&self.cache_key(URL_MAP_KEY));
        self.cache.forget(&self.cache_key(URL_LIST_KEY));
        if let Some(path) = &self.options.manifest_path {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!(path = %path.display(), error = %e, "cannot remove route manifest");
                }
            }
        }
        self.table = None;
    }

    /// Compile the theme's routes from source and write them as a manifest.
    pub fn bake_manifest(&mut self) -> Result<(PathBuf, usize), CmsError> {
        let path = self
            .options
            .manifest_path
            .clone()
            .ok_or_else(|| CmsError::Config("no manifest location configured".to_string()))?;

        let table = RuleTable::from_entries(&self.scan_pages());
        let bytes = manifest_to_bytes(&table.entries())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CmsError::Io(e.to_string()))?;
        }
        std::fs::write(&path, bytes)
            .map_err(|e| CmsError::Io(format!("{}: {}", path.display(), e)))?;

        let count = table.len();
        tracing::info!(path = %path.display(), routes = count, "route manifest baked");
        self.table = Some(table);
        Ok((path, count))
    }
}

// =============================================================================
// TESTS
// =============================================================================
