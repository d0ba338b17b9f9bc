//! Sandbox policy applied while parsing markup.

use std::collections::BTreeSet;

/// Every tag the engine understands.
pub const KNOWN_TAGS: &[&str] = &["page", "partial", "component", "content", "if", "for"];

/// Every filter the engine understands.
pub const KNOWN_FILTERS: &[&str] = &[
    "raw", "escape", "e", "upper", "lower", "default", "length", "page", "theme",
];

/// Tags and filters markup may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    tags: BTreeSet<String>,
    filters: BTreeSet<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::permissive()
    }
}

impl SecurityPolicy {
    /// Everything the engine supports.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            tags: KNOWN_TAGS.iter().map(|t| t.to_string()).collect(),
            filters: KNOWN_FILTERS.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Safe mode: output can never bypass escaping.
    #[must_use]
    pub fn sandboxed() -> Self {
        let mut policy = Self::permissive();
        policy.filters.remove("raw");
        policy
    }

    #[must_use]
    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: &[&str]) -> Self {
        self.filters = filters.iter().map(|f| f.to_string()).collect();
        self
    }

    #[must_use]
    pub fn allows_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    #[must_use]
    pub fn allows_filter(&self, filter: &str) -> bool {
        self.filters.contains(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_drops_raw() {
        assert!(SecurityPolicy::permissive().allows_filter("raw"));
        assert!(!SecurityPolicy::sandboxed().allows_filter("raw"));
        assert!(SecurityPolicy::sandboxed().allows_tag("partial"));
    }

    #[test]
    fn narrowed_policy() {
        let policy = SecurityPolicy::permissive().with_tags(&["if"]);
        assert!(policy.allows_tag("if"));
        assert!(!policy.allows_tag("for"));
    }
}
