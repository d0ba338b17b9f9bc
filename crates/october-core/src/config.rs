//! # Configuration
//!
//! `CmsConfig` is read from a TOML file (usually `october.toml`). Every
//! field has a default, so an empty file, or no file at all, is a valid
//! configuration.
//!
//! Environment overrides:
//! - `OCTOBER_ACTIVE_THEME`: replaces `active_theme`
//! - `OCTOBER_DEBUG`: `1`/`true` enables debug mode

use crate::CmsError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Which external cache backs the route, object and property caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redb,
}

/// Maintenance mode settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    /// File name of the page shown while in maintenance.
    pub page: Option<String>,
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CmsConfig {
    /// Directory holding one sub-directory per theme.
    pub themes_path: PathBuf,
    /// Directory for baked manifests and the redb cache file.
    pub storage_path: PathBuf,
    pub active_theme: String,
    /// Theme opened by editors; defaults to the active theme.
    pub edit_theme: Option<String>,
    pub locale: String,
    /// Exposed to templates as `this.environment`.
    pub environment: String,
    pub debug: bool,
    /// Suppresses not-found logging.
    pub testing: bool,
    /// Enables the dynamic route table cache and the URL memo.
    pub enable_route_cache: bool,
    /// Seconds a cached URL resolution stays valid.
    pub url_cache_ttl: u64,
    /// Seconds a cached object or route table stays valid.
    pub parsed_page_cache_ttl: u64,
    /// Missing components raise errors instead of becoming `null`.
    pub strict_components: bool,
    /// Keeps parsed markup in memory between renders.
    pub enable_template_cache: bool,
    /// Restricts markup to the sandbox policy.
    pub safe_mode: bool,
    pub enable_csrf_protection: bool,
    /// Base URL substituted for `media:` references.
    pub media_url: String,
    pub maintenance: MaintenanceConfig,
    pub cache_backend: CacheBackend,
}

impl Default for CmsConfig {
    fn default() -> Self {
        Self {
            themes_path: PathBuf::from("themes"),
            storage_path: PathBuf::from("storage"),
            active_theme: "demo".to_string(),
            edit_theme: None,
            locale: "en".to_string(),
            environment: "production".to_string(),
            debug: false,
            testing: false,
            enable_route_cache: true,
            url_cache_ttl: 600,
            parsed_page_cache_ttl: 600,
            strict_components: true,
            enable_template_cache: true,
            safe_mode: false,
            enable_csrf_protection: true,
            media_url: "/storage/app/media".to_string(),
            maintenance: MaintenanceConfig::default(),
            cache_backend: CacheBackend::Memory,
        }
    }
}

impl CmsConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, CmsError> {
        toml::from_str(text).map_err(|e| CmsError::Config(e.to_string()))
    }

    /// Load configuration from a file, then apply environment overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, CmsError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| CmsError::Io(format!("Cannot read {}: {}", path.display(), e)))?;
            Self::from_toml(&text)?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `OCTOBER_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(theme) = std::env::var("OCTOBER_ACTIVE_THEME") {
            if !theme.is_empty() {
                self.active_theme = theme;
            }
        }
        if let Ok(debug) = std::env::var("OCTOBER_DEBUG") {
            self.debug = matches!(debug.as_str(), "1" | "true" | "yes");
        }
    }

    /// Theme opened by editors.
    #[must_use]
    pub fn edit_theme(&self) -> &str {
        self.edit_theme.as_deref().unwrap_or(&self.active_theme)
    }
}
