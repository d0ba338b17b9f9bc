//! # Route Rules
//!
//! Compiles page URL patterns and matches request URLs against them.
//!
//! Pattern syntax, one placeholder per segment:
//!
//! | Form              | Meaning                                        |
//! |-------------------|------------------------------------------------|
//! | `:name`           | required parameter                             |
//! | `:name?`          | optional parameter                             |
//! | `:name?default`   | optional parameter with a default value        |
//! | `:name\|regex`    | parameter constrained by a regular expression  |
//! | `:name*`          | wildcard, captures one or more segments        |
//!
//! An optional parameter followed by any required segment is treated as
//! required: middle segments can never be skipped.

use crate::RouteParams;
use crate::formats::ManifestEntry;
use crate::primitives::MAX_URL_LENGTH;
use regex::Regex;
use std::cmp::Ordering;

// =============================================================================
// URL NORMALIZATION
// =============================================================================

/// Canonical form of a request URL.
///
/// Strips query and fragment, collapses empty segments and drops the
/// trailing slash. Returns `None` for URLs over the length limit.
#[must_use]
pub fn normalize_url(url: &str) -> Option<String> {
    if url.len() > MAX_URL_LENGTH {
        return None;
    }
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    Some(format!("/{}", segments.join("/")))
}

fn url_segments(url: &str) -> Vec<&str> {
    url.split('/').filter(|s| !s.is_empty()).collect()
}

// =============================================================================
// SEGMENTS
// =============================================================================

#[derive(Debug, Clone)]
struct Param {
    name: String,
    optional: bool,
    wildcard: bool,
    default: Option<String>,
    constraint: Option<Regex>,
}

impl Param {
    /// Parse the text after `:`.
    fn parse(spec: &str) -> Result<Self, String> {
        let (head, constraint) = match spec.split_once('|') {
            Some((head, expr)) => {
                let regex = Regex::new(expr)
                    .map_err(|e| format!("invalid expression '{}': {}", expr, e))?;
                (head, Some(regex))
            }
            None => (spec, None),
        };

        let name_end = head.find(['*', '?']).unwrap_or(head.len());
        let name = &head[..name_end];
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(format!("invalid parameter name in ':{}'", spec));
        }

        let modifiers = &head[name_end..];
        let wildcard = modifiers.starts_with('*');
        let after_star = modifiers.strip_prefix('*').unwrap_or(modifiers);
        let (optional, default) = match after_star.strip_prefix('?') {
            Some("") => (true, None),
            Some(default) => (true, Some(default.to_string())),
            None if after_star.is_empty() => (false, None),
            None => return Err(format!("unexpected '{}' in ':{}'", after_star, spec)),
        };

        Ok(Self {
            name: name.to_string(),
            optional,
            wildcard,
            default,
            constraint,
        })
    }

    fn accepts(&self, value: &str) -> bool {
        self.constraint.as_ref().is_none_or(|re| re.is_match(value))
    }

    /// Value used when the URL stops before this parameter.
    fn omitted_value(&self) -> String {
        self.default.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Param(Param),
}

impl Segment {
    fn is_required(&self) -> bool {
        match self {
            Self::Static(_) => true,
            Self::Param(p) => !p.optional,
        }
    }
}

// =============================================================================
// ROUTE RULE
// =============================================================================

/// A compiled URL pattern bound to a page file.
#[derive(Debug, Clone)]
pub struct RouteRule {
    file_name: String,
    pattern: String,
    segments: Vec<Segment>,
}

impl RouteRule {
    /// Compile `pattern` for the page `file_name`.
    pub fn compile(file_name: &str, pattern: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        for raw in url_segments(pattern) {
            let segment = match raw.strip_prefix(':') {
                Some(spec) => Segment::Param(Param::parse(spec)?),
                None => Segment::Static(raw.to_string()),
            };
            segments.push(segment);
        }

        let wildcards = segments
            .iter()
            .filter(|s| matches!(s, Segment::Param(p) if p.wildcard))
            .count();
        if wildcards > 1 {
            return Err(format!("more than one wildcard in '{}'", pattern));
        }

        // An optional segment followed by a required one becomes required.
        let mut required_after = false;
        for segment in segments.iter_mut().rev() {
            if let Segment::Param(param) = segment {
                if required_after {
                    param.optional = false;
                }
            }
            required_after |= segment.is_required();
        }

        Ok(Self {
            file_name: file_name.to_string(),
            pattern: pattern.to_string(),
            segments,
        })
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Names of the parameters in pattern order.
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(p) => Some(p.name.as_str()),
            Segment::Static(_) => None,
        })
    }

    /// Whether the parameter is optional after compilation.
    #[must_use]
    pub fn is_optional(&self, name: &str) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Param(p) if p.name == name && p.optional))
    }

    fn static_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Static(_)))
            .count()
    }

    fn loose_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Param(p) if p.optional || p.wildcard))
            .count()
    }

    /// Ordering used to try rules: most specific first.
    #[must_use]
    pub fn specificity_cmp(&self, other: &Self) -> Ordering {
        other
            .static_count()
            .cmp(&self.static_count())
            .then_with(|| other.segments.len().cmp(&self.segments.len()))
            .then_with(|| self.loose_count().cmp(&other.loose_count()))
            .then_with(|| self.file_name.cmp(&other.file_name))
    }

    /// Match a normalized URL, returning the extracted parameters.
    ///
    /// Parameters the URL omits get their default, or an empty string.
    #[must_use]
    pub fn matches(&self, url: &str) -> Option<RouteParams> {
        let parts = url_segments(url);
        let wildcard_at = self
            .segments
            .iter()
            .position(|s| matches!(s, Segment::Param(p) if p.wildcard));

        match wildcard_at {
            Some(at) => self.match_wildcard(&parts, at),
            None => self.match_fixed(&parts),
        }
    }

    fn match_fixed(&self, parts: &[&str]) -> Option<RouteParams> {
        if parts.len() > self.segments.len() {
            return None;
        }
        let mut params = RouteParams::new();
        for (i, segment) in self.segments.iter().enumerate() {
            match (segment, parts.get(i)) {
                (Segment::Static(expected), Some(part)) => {
                    if !expected.eq_ignore_ascii_case(part) {
                        return None;
                    }
                }
                (Segment::Static(_), None) => return None,
                (Segment::Param(param), Some(part)) => {
                    if !param.accepts(part) {
                        return None;
                    }
                    params.insert(param.name.clone(), *part);
                }
                (Segment::Param(param), None) => {
                    if !param.optional {
                        return None;
                    }
                    params.insert(param.name.clone(), param.omitted_value());
                }
            }
        }
        Some(params)
    }

    fn match_wildcard(&self, parts: &[&str], at: usize) -> Option<RouteParams> {
        let trailing = self.segments.len() - at - 1;
        let available = parts.len().checked_sub(at + trailing)?;

        let mut params = RouteParams::new();
        for (segment, part) in self.segments[..at].iter().zip(parts) {
            self.bind(segment, part, &mut params)?;
        }

        let Segment::Param(wildcard) = &self.segments[at] else {
            return None;
        };
        if available == 0 && !wildcard.optional {
            return None;
        }
        let value = if available == 0 {
            wildcard.omitted_value()
        } else {
            parts[at..at + available].join("/")
        };
        if available > 0 && !wildcard.accepts(&value) {
            return None;
        }
        params.insert(wildcard.name.clone(), value);

        for (segment, part) in self.segments[at + 1..].iter().zip(&parts[at + available..]) {
            self.bind(segment, part, &mut params)?;
        }
        Some(params)
    }

    fn bind(&self, segment: &Segment, part: &str, params: &mut RouteParams) -> Option<()> {
        match segment {
            Segment::Static(expected) => expected.eq_ignore_ascii_case(part).then_some(()),
            Segment::Param(param) => {
                if !param.accepts(part) {
                    return None;
                }
                params.insert(param.name.clone(), part);
                Some(())
            }
        }
    }

    /// Build a URL from parameter values.
    ///
    /// Missing values fall back to defaults. The URL stops at the first
    /// omitted optional parameter; a missing required one yields `None`.
    #[must_use]
    pub fn url(&self, params: &RouteParams) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Static(text) => parts.push(text.clone()),
                Segment::Param(param) => {
                    let given = params.get(&param.name).filter(|v| !v.is_empty());
                    match (given, &param.default) {
                        (Some(value), _) => parts.push(value.to_string()),
                        (None, Some(default)) => parts.push(default.clone()),
                        (None, None) if param.optional => break,
                        (None, None) => return None,
                    }
                }
            }
        }
        Some(format!("/{}", parts.join("/")))
    }
}

// =============================================================================
// RULE TABLE
// =============================================================================

/// Every routable page of a theme, sorted by specificity.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<RouteRule>,
}

impl RuleTable {
    /// Compile entries, skipping (and logging) invalid patterns.
    #[must_use]
    pub fn from_entries(entries: &[ManifestEntry]) -> Self {
        let mut rules: Vec<RouteRule> = entries
            .iter()
            .filter_map(
                |entry| match RouteRule::compile(&entry.file_name, &entry.pattern) {
                    Ok(rule) => Some(rule),
                    Err(reason) => {
                        tracing::warn!(file = %entry.file_name, %reason, "skipping invalid route");
                        None
                    }
                },
            )
            .collect();
        rules.sort_by(RouteRule::specificity_cmp);
        Self { rules }
    }

    /// Entries in match order, for caching and baking.
    #[must_use]
    pub fn entries(&self) -> Vec<ManifestEntry> {
        self.rules
            .iter()
            .map(|r| ManifestEntry {
                file_name: r.file_name.clone(),
                pattern: r.pattern.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule matching a normalized URL.
    #[must_use]
    pub fn find(&self, url: &str) -> Option<(&RouteRule, RouteParams)> {
        self.rules
            .iter()
            .find_map(|rule| rule.matches(url).map(|params| (rule, params)))
    }

    #[must_use]
    pub fn rule_for_file(&self, file_name: &str) -> Option<&RouteRule> {
        self.rules.iter().find(|r| r.file_name == file_name)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str) -> RouteRule {
        RouteRule::compile("page.htm", pattern).expect("compile")
    }

    #[test]
    fn normalize() {
        assert_eq!(normalize_url("blog//post/?a=1#x").as_deref(), Some("/blog/post"));
        assert_eq!(normalize_url("").as_deref(), Some("/"));
        assert_eq!(normalize_url(&"a".repeat(MAX_URL_LENGTH + 1)), None);
    }

    #[test]
    fn required_param() {
        let r = rule("/blog/:post_id");
        let params = r.matches("/blog/42").expect("match");
        assert_eq!(params.get("post_id"), Some("42"));
        assert!(r.matches("/blog").is_none());
        assert!(r.matches("/blog/42/extra").is_none());
    }

    #[test]
    fn middle_optional_is_required() {
        let r = rule("/blog/:id?/comments");
        assert!(!r.is_optional("id"));
        assert!(r.matches("/blog/comments").is_none());
        assert_eq!(
            r.matches("/blog/7/comments").expect("match").get("id"),
            Some("7")
        );
    }

    #[test]
    fn trailing_optional_and_default() {
        let r = rule("/archive/:year?2020/:month?");
        let params = r.matches("/archive").expect("match");
        assert_eq!(params.get("year"), Some("2020"));
        assert_eq!(params.get("month"), Some(""));

        let params = r.matches("/archive/2023/05").expect("match");
        assert_eq!(params.get("month"), Some("05"));
    }

    #[test]
    fn regex_constraint() {
        let r = rule("/post/:id|^[0-9]+$");
        assert!(r.matches("/post/12").is_some());
        assert!(r.matches("/post/abc").is_none());
        assert!(RouteRule::compile("x.htm", "/post/:id|(").is_err());
    }

    #[test]
    fn static_segments_ignore_case() {
        assert!(rule("/About/Team").matches("/about/team").is_some());
    }

    #[test]
    fn wildcard_captures_segments() {
        let r = rule("/docs/:path*/edit");
        let params = r.matches("/docs/a/b/c/edit").expect("match");
        assert_eq!(params.get("path"), Some("a/b/c"));
        assert!(r.matches("/docs/edit").is_none());

        let r = rule("/files/:path*?");
        assert_eq!(r.matches("/files").expect("match").get("path"), Some(""));
    }

    #[test]
    fn url_generation() {
        let r = rule("/blog/:slug/:page?1");
        let params: RouteParams = [("slug", "hello")].into_iter().collect();
        assert_eq!(r.url(&params).as_deref(), Some("/blog/hello/1"));
        assert_eq!(r.url(&RouteParams::new()), None);

        let r = rule("/search/:q?");
        assert_eq!(r.url(&RouteParams::new()).as_deref(), Some("/search"));
        assert_eq!(rule("/").url(&RouteParams::new()).as_deref(), Some("/"));
    }

    #[test]
    fn specificity_prefers_static() {
        let table = RuleTable::from_entries(&[
            ManifestEntry {
                file_name: "post.htm".into(),
                pattern: "/blog/:slug".into(),
            },
            ManifestEntry {
                file_name: "featured.htm".into(),
                pattern: "/blog/featured".into(),
            },
            ManifestEntry {
                file_name: "broken.htm".into(),
                pattern: "/x/:".into(),
            },
        ]);
        assert_eq!(table.len(), 2);
        let (hit, _) = table.find("/blog/featured").expect("match");
        assert_eq!(hit.file_name(), "featured.htm");
        let (hit, params) = table.find("/blog/other").expect("match");
        assert_eq!(hit.file_name(), "post.htm");
        assert_eq!(params.get("slug"), Some("other"));
    }
}
