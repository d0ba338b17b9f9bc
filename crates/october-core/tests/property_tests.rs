//! # Property-Based Tests
//!
//! Routing and name validation invariants checked with proptest.

use october_core::controller::{is_valid_handler_name, is_valid_partial_name};
use october_core::router::normalize_url;
use october_core::{
    CmsCache, MemoryDatasource, ObjectKind, RouteParams, RouteRule, Router, RouterOptions, Theme,
    ThemeConfig,
};
use proptest::collection::btree_set;
use proptest::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

fn theme_with_slugs(slugs: &[String]) -> Theme {
    let ds = slugs.iter().fold(
        MemoryDatasource::new()
            .with(ObjectKind::Page, "home.htm", "url = \"/\"\n==\nhome")
            .with(ObjectKind::Page, "post.htm", "url = \"/post/:slug\"\n==\npost"),
        |ds, slug| {
            ds.with(
                ObjectKind::Page,
                &format!("{}.htm", slug),
                &format!("url = \"/{}\"\n==\n{}", slug, slug),
            )
        },
    );
    Theme::with_datasource("mem", PathBuf::from("/themes/mem"), ThemeConfig::default(), Arc::new(ds))
}

fn resolve(router: &mut Router<'_>, url: &str) -> Option<(String, RouteParams)> {
    let page = router.find_by_url(url)?;
    Some((page.file_name().to_string(), router.parameters().clone()))
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Normalizing a URL twice changes nothing.
    #[test]
    fn url_normalization_is_idempotent(url in "[a-z/?#.]{0,40}") {
        let once = normalize_url(&url).expect("short url");
        prop_assert_eq!(normalize_url(&once), Some(once.clone()));
        prop_assert!(once.starts_with('/'));
        prop_assert!(once == "/" || !once.ends_with('/'));
    }

    /// A cached router answers exactly like a cold one, on first and repeat lookups.
    #[test]
    fn cached_resolution_matches_cold(
        slugs in btree_set("[a-z]{3,8}", 1..8),
        extra in proptest::collection::vec("[a-z]{3,8}", 1..8),
    ) {
        let slugs: Vec<String> = slugs.into_iter().collect();
        let theme = theme_with_slugs(&slugs);
        let cold_cache = CmsCache::in_memory();
        let warm_cache = CmsCache::in_memory();
        let cold_options = RouterOptions { cache_routes: false, ..RouterOptions::default() };

        for slug in slugs.iter().chain(extra.iter()) {
            for url in [format!("/{}", slug), format!("/post/{}", slug)] {
                let cold = resolve(&mut Router::new(&theme, &cold_cache, cold_options.clone()), &url);
                let first = resolve(&mut Router::new(&theme, &warm_cache, RouterOptions::default()), &url);
                let again = resolve(&mut Router::new(&theme, &warm_cache, RouterOptions::default()), &url);
                prop_assert_eq!(&cold, &first);
                prop_assert_eq!(&first, &again);
            }
        }
    }

    /// Values matched by a parameter rebuild the same URL.
    #[test]
    fn matched_parameters_rebuild_url(slug in "[a-z0-9-]{1,20}", id in 1u32..100000) {
        let rule = RouteRule::compile("post.htm", "/blog/:id|^[0-9]+$/:slug").expect("rule");
        let url = format!("/blog/{}/{}", id, slug);
        let params = rule.matches(&url).expect("match");
        let id_str = id.to_string();
        prop_assert_eq!(params.get("id"), Some(id_str.as_str()));
        prop_assert_eq!(rule.url(&params), Some(url));
    }

    /// Handler names need `on` followed by an uppercase letter.
    #[test]
    fn handler_name_shape(rest in "[A-Za-z0-9_]{0,12}", alias in "[a-z][a-zA-Z0-9]{0,8}") {
        let upper = format!("onX{}", rest);
        prop_assert!(is_valid_handler_name(&upper));
        let scoped = format!("{}::{}", alias, upper);
        prop_assert!(is_valid_handler_name(&scoped));
        let lower = format!("onx{}", rest);
        prop_assert!(!is_valid_handler_name(&lower));
        let bare = format!("x{}", rest);
        prop_assert!(!is_valid_handler_name(&bare));
    }

    /// Partial names never escape the partials directory.
    #[test]
    fn partial_names_reject_traversal(prefix in "[a-z]{0,6}", suffix in "[a-z]{1,6}") {
        let name = format!("{}/../{}", prefix, suffix);
        prop_assert!(!is_valid_partial_name(&name));
        let nested = format!("{}/{}", suffix, suffix);
        prop_assert!(is_valid_partial_name(&nested));
    }
}
