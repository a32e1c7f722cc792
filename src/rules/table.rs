//! `SiteRuleTable` — loaded once from config at startup, read-only
//! thereafter.

use crate::model::{SiteRule, VariantRule};
use std::collections::HashMap;
use std::sync::Arc;

/// Read-mostly table of [`SiteRule`]s keyed by registrable domain.
///
/// Cloning is cheap: the inner map lives behind an `Arc` and is shared
/// across workers without a lock, since nothing here is ever mutated
/// after load.
#[derive(Debug, Clone)]
pub struct SiteRuleTable {
    rules: Arc<HashMap<String, SiteRule>>,
}

impl SiteRuleTable {
    /// Build a table from a list of rules, sorting each rule's
    /// `variant_rules` by specificity (longest keyword first) so the
    /// most specific match wins structurally rather than being
    /// re-derived on every lookup.
    pub fn new(rules: Vec<SiteRule>) -> Self {
        let mut map = HashMap::with_capacity(rules.len());
        for mut rule in rules {
            rule.variant_rules
                .sort_by_key(|v| std::cmp::Reverse(v.specificity()));
            map.insert(normalize_domain(&rule.domain), rule);
        }
        Self {
            rules: Arc::new(map),
        }
    }

    /// O(1) lookup by registrable domain.
    pub fn lookup(&self, domain: &str) -> Option<&SiteRule> {
        self.rules.get(&normalize_domain(domain))
    }

    /// First variant rule whose keywords match `machine_name` (and whose
    /// optional URL pattern matches `url`, if present).
    pub fn machine_rule(&self, domain: &str, machine_name: &str, url: &str) -> Option<&VariantRule> {
        self.lookup(domain)?
            .variant_rules
            .iter()
            .find(|v| v.matches(machine_name, url))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Strip a leading "www." so lookups are stable regardless of how the
/// domain was spelled in config or recovered from a URL.
pub fn normalize_domain(domain: &str) -> String {
    domain
        .trim()
        .to_lowercase()
        .strip_prefix("www.")
        .unwrap_or(domain.trim())
        .to_string()
}

/// Recover a normalized domain from a product URL for table lookups.
pub fn domain_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| normalize_domain(h)))
}
