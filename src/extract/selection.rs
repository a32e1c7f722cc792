//! Selection policy among multiple surviving price candidates.
//!
//! Defeats the "bundle price wins because it happens to be closest to
//! the last price" failure mode: range membership is an absolute veto
//! over proximity, checked before proximity is ever consulted.

use crate::model::{SiteRule, VariantRule};
use rust_decimal::Decimal;

/// One parsed, filtered price reading plus enough context to rank it
/// against its siblings.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub price: Decimal,
    pub selector: String,
    /// Position in document order; lower is earlier.
    pub doc_order: usize,
    /// Sits inside `<ins>`/`<em>`/`<strong>` or a `sale`/`current`/`now` class.
    pub is_sale_context: bool,
    /// Sits inside `<del>`/`<s>`/`<strike>`.
    pub is_struck_context: bool,
    /// Sits inside one of `SiteRule.prefer_contexts` (spec.md §3.4).
    pub is_preferred_context: bool,
}

/// Pick the winning candidate per the policy, or `None` if the slice is
/// empty.
pub fn select<'a>(
    candidates: &'a [Candidate],
    site_rule: &SiteRule,
    variant_rule: Option<&VariantRule>,
    previous_price: Option<Decimal>,
) -> Option<&'a Candidate> {
    if candidates.is_empty() {
        return None;
    }

    // A candidate sitting inside one of the site's known price-bearing
    // containers (`entry-summary`, `product-main`, ...) outranks one
    // that doesn't, the same way `avoid_contexts` vetoes outright —
    // narrow the pool before the rest of the policy runs (spec.md §3.4).
    let preferred: Vec<&'a Candidate> = candidates.iter().filter(|c| c.is_preferred_context).collect();
    let pool: Vec<&'a Candidate> = if preferred.is_empty() {
        candidates.iter().collect()
    } else {
        preferred
    };

    if site_rule.prefer_sale_price {
        let has_struck = pool.iter().any(|c| c.is_struck_context);
        if has_struck {
            if let Some(sale) = pool
                .iter()
                .copied()
                .filter(|c| c.is_sale_context)
                .min_by_key(|c| c.doc_order)
            {
                return Some(sale);
            }
        }
    }

    if let Some(range) = variant_rule.and_then(|v| v.expected_price_range) {
        let in_range: Vec<&'a Candidate> = pool
            .iter()
            .filter(|c| c.price >= range.0 && c.price <= range.1)
            .copied()
            .collect();
        if !in_range.is_empty() {
            return Some(closest_or_first(&in_range, previous_price));
        }
        // No candidate satisfies the variant's expected range — fall
        // through to the site-wide policy rather than returning nothing,
        // since the range hint may simply be stale.
    }

    if let Some(prev) = previous_price {
        let in_site_range: Vec<&'a Candidate> = pool
            .iter()
            .filter(|c| c.price >= site_rule.price_range.0 && c.price <= site_rule.price_range.1)
            .copied()
            .collect();
        if let Some(best) = in_site_range.iter().copied().min_by_key(|c| (c.price - prev).abs()) {
            return Some(best);
        }
    }

    pool.into_iter().min_by_key(|c| c.doc_order)
}

fn closest_or_first<'a>(candidates: &[&'a Candidate], previous_price: Option<Decimal>) -> &'a Candidate {
    match previous_price {
        Some(prev) => candidates
            .iter()
            .min_by_key(|c| (c.price - prev).abs())
            .copied()
            .expect("non-empty slice"),
        None => candidates
            .iter()
            .min_by_key(|c| c.doc_order)
            .copied()
            .expect("non-empty slice"),
    }
}
