//! Session naming: prefix selection and canonical names.
//!
//! Configuration keys are dotted paths (`rules.orderCheck.basic`). A key is
//! selected when its first segment starts with one of the configured prefixes,
//! and its session name is the camel-cased concatenation of its segments
//! (`rulesOrderCheckBasic`).

use std::fmt;

/// Allow-list of accepted key prefixes.
///
/// An empty filter accepts every key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixFilter {
    prefixes: Vec<String>,
}

impl PrefixFilter {
    /// A filter that accepts every key.
    #[must_use]
    pub const fn accept_all() -> Self {
        Self { prefixes: Vec::new() }
    }

    /// Parse a comma-separated prefix list.
    ///
    /// Entries are trimmed and empty entries dropped, so a blank list accepts all keys.
    #[must_use]
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    /// Build a filter from individual prefixes.
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for p in prefixes {
            let p = p.as_ref().trim();
            if !p.is_empty() && !out.iter().any(|existing| existing == p) {
                out.push(p.to_string());
            }
        }
        Self { prefixes: out }
    }

    /// Configured prefixes, in declaration order.
    #[must_use]
    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// Returns true when no prefixes are configured.
    #[must_use]
    pub fn accepts_all(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// See [`is_selected`].
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        is_selected(key, self)
    }
}

impl fmt::Display for PrefixFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefixes.join(","))
    }
}

/// Returns true if `key` should be loaded as a rule session.
///
/// Matching is a case-sensitive prefix test against the key's first
/// dot-delimited segment.
#[must_use]
pub fn is_selected(key: &str, filter: &PrefixFilter) -> bool {
    if filter.accepts_all() {
        return true;
    }
    let head = key.split('.').next().unwrap_or_default();
    filter.prefixes.iter().any(|p| head.starts_with(p.as_str()))
}

/// Derive the canonical session name for a configuration key.
///
/// The first non-empty segment keeps its case; every later segment has its
/// leading character upper-cased. Empty segments (`a..b`, leading or trailing
/// dots) contribute nothing. An empty key yields an empty name.
#[must_use]
pub fn canonicalize(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for segment in key.split('.').filter(|s| !s.is_empty()) {
        if out.is_empty() {
            out.push_str(segment);
            continue;
        }
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

/// Selection and naming in one step.
///
/// Returns the session name for `key`, or `None` when the key is filtered out
/// or has no usable name.
#[must_use]
pub fn select(key: &str, filter: &PrefixFilter) -> Option<String> {
    if !is_selected(key, filter) {
        return None;
    }
    let name = canonicalize(key);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
