//! # CLI Command Implementations

use crate::api;
use october_core::{CmsConfig, CmsError, Site};
use std::path::Path;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Load `october.toml` with environment overrides, then the `--theme` flag.
pub fn load_config(path: &Path, theme: Option<&str>) -> Result<CmsConfig, CmsError> {
    let mut config = CmsConfig::load(path)?;
    if let Some(theme) = theme {
        config.active_theme = theme.to_string();
    }
    tracing::debug!(
        themes = %config.themes_path.display(),
        theme = %config.active_theme,
        "configuration loaded"
    );
    Ok(config)
}

// =============================================================================
// SERVE COMMAND
// =============================================================================

/// Start the HTTP server.
pub async fn cmd_serve(config: CmsConfig, host: &str, port: u16) -> Result<(), CmsError> {
    println!("October Site Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Host:     {}", host);
    println!("  Port:     {}", port);
    println!("  Themes:   {}", config.themes_path.display());
    println!("  Theme:    {}", config.active_theme);
    println!("  Cache:    {:?}", config.cache_backend);
    println!();

    let site = Site::new(config)?;
    // Fail fast on a missing theme instead of on the first request.
    site.active_theme()?;

    let addr = format!("{}:{}", host, port);
    api::run_server(&addr, site).await
}

// =============================================================================
// ROUTING COMMANDS
// =============================================================================

/// Resolve a URL and print the page and parameters.
pub fn cmd_resolve(config: CmsConfig, url: &str, json_mode: bool) -> Result<(), CmsError> {
    let site = Site::new(config)?;
    let theme = site.active_theme()?;
    let mut router = site.router(&theme);

    let page = router.find_by_url(url);
    let params = router.parameters().to_json();

    if json_mode {
        let output = serde_json::json!({
            "url": url,
            "page": page.as_ref().map(|p| p.file_name()),
            "params": params,
        });
        println!("{}", output);
        return Ok(());
    }

    match page {
        Some(page) => {
            println!("{} -> {}", url, page.file_name());
            for (name, value) in router.parameters().iter() {
                println!("  {} = {}", name, value);
            }
        }
        None => println!("{} -> (no page)", url),
    }
    Ok(())
}

/// Print every route in match order.
pub fn cmd_routes(config: CmsConfig, json_mode: bool) -> Result<(), CmsError> {
    let site = Site::new(config)?;
    let theme = site.active_theme()?;
    let routes = site.router(&theme).routes();

    if json_mode {
        let output: Vec<_> = routes
            .iter()
            .map(|(pattern, file)| serde_json::json!({"pattern": pattern, "page": file}))
            .collect();
        println!("{}", serde_json::Value::from(output));
        return Ok(());
    }

    println!("Routes for theme '{}' ({}):", theme.dir_name(), routes.len());
    let width = routes.iter().map(|(p, _)| p.len()).max().unwrap_or(0);
    for (pattern, file) in &routes {
        println!("  {:width$}  {}", pattern, file, width = width);
    }
    Ok(())
}

/// Write the route manifest used ahead of the dynamic cache.
pub fn cmd_bake_routes(config: CmsConfig) -> Result<(), CmsError> {
    let site = Site::new(config)?;
    let theme = site.active_theme()?;
    let (path, count) = site.router(&theme).bake_manifest()?;
    println!("Baked {} routes to {}", count, path.display());
    Ok(())
}

// =============================================================================
// CACHE COMMAND
// =============================================================================

pub fn cmd_clear_cache(config: CmsConfig) -> Result<(), CmsError> {
    let site = Site::new(config)?;
    let theme = site.active_theme()?;
    site.clear_cache(&theme);
    println!("Cleared caches for theme '{}'", theme.dir_name());
    Ok(())
}
