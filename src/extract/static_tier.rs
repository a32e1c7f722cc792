//! The fast, no-browser tier cascade: learned selector, site rule
//! selectors (or a static table), structured data, and finally the
//! generic common-selector fallback list.

use crate::acquisition::structured::extract_structured_data;
use crate::extract::{common_selectors::COMMON_PRICE_SELECTORS, dom, selection, TierOutcome};
use crate::model::{Machine, SiteRule, SiteType, Tier, VariantRule};
use crate::price;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};

/// Everything the static cascade needs for one machine on one fetch.
pub struct StaticContext<'a> {
    pub html: &'a str,
    pub machine: &'a Machine,
    pub domain: &'a str,
    pub site_rule: Option<&'a SiteRule>,
    pub variant_rule: Option<&'a VariantRule>,
}

pub(crate) fn wide_open_site_rule(domain: &str) -> SiteRule {
    SiteRule {
        domain: domain.to_string(),
        site_type: SiteType::Generic,
        price_selectors: vec![],
        avoid_selectors: vec![],
        avoid_contexts: vec![],
        prefer_contexts: vec![],
        variant_rules: vec![],
        price_range: (Decimal::from(1), Decimal::from(100_000)),
        requires_dynamic: false,
        prefer_sale_price: false,
        extra_correction_heuristics: false,
        table_hint: None,
    }
}

/// Run every static strategy in cascade order and return each one's
/// outcome. The orchestrator validates them in turn and stops at the
/// first pass; this function itself makes no validation decision.
pub fn run_all(ctx: &StaticContext) -> Vec<TierOutcome> {
    let mut outcomes = Vec::new();
    let document = Html::parse_document(ctx.html);
    let previous_price = ctx.machine.previous_price;
    let fallback_rule = wide_open_site_rule(ctx.domain);
    let site_rule = ctx.site_rule.unwrap_or(&fallback_rule);

    if let Some(outcome) = try_learned(ctx, &document) {
        outcomes.push(outcome);
    }

    outcomes.push(try_site_rule(ctx, &document, site_rule, previous_price));
    outcomes.push(try_structured_data(ctx, site_rule, previous_price));
    outcomes.push(try_common_selectors(ctx, &document, site_rule, previous_price));

    outcomes
}

fn try_learned(ctx: &StaticContext, document: &Html) -> Option<TierOutcome> {
    let learned = ctx.machine.learned_selector_for(ctx.domain)?;
    let Ok(selector) = Selector::parse(&learned.selector) else {
        return Some(TierOutcome::miss(
            Tier::Learned,
            format!("stored selector is no longer valid CSS: {}", learned.selector),
        ));
    };
    let Some(el) = document.select(&selector).next() else {
        return Some(TierOutcome::miss(
            Tier::Learned,
            "learned selector matched no element",
        ));
    };
    match price::parse(&element_text(&el)) {
        Some(p) => Some(TierOutcome::hit(Tier::Learned, p, learned.selector.clone(), learned.confidence)),
        None => Some(TierOutcome::miss(
            Tier::Learned,
            "learned selector's element held no parseable price",
        )),
    }
}

fn try_site_rule(
    ctx: &StaticContext,
    document: &Html,
    site_rule: &SiteRule,
    previous_price: Option<Decimal>,
) -> TierOutcome {
    if site_rule.price_selectors.is_empty() && site_rule.site_type != SiteType::StaticTable {
        return TierOutcome::miss(Tier::SiteRule, "no site rule configured for this domain");
    }

    if site_rule.site_type == SiteType::StaticTable {
        return match extract_static_table_price(document, site_rule, ctx.variant_rule) {
            Some(p) => TierOutcome::hit(Tier::SiteRule, p, "static-table", 0.85),
            None => TierOutcome::miss(Tier::SiteRule, "no matching table row/column found"),
        };
    }

    let mode = if let Some(vr) = ctx.variant_rule {
        vr.preferred_selector
            .as_deref()
            .map(|s| vec![s.to_string()])
            .unwrap_or_else(|| site_rule.price_selectors.clone())
    } else {
        site_rule.price_selectors.clone()
    };

    let candidates = collect_candidates(
        document,
        &mode,
        &site_rule.avoid_selectors,
        &site_rule.avoid_contexts,
        &site_rule.prefer_contexts,
    );
    match selection::select(&candidates, site_rule, ctx.variant_rule, previous_price) {
        Some(winner) => TierOutcome::hit(Tier::SiteRule, winner.price, winner.selector.clone(), 0.9),
        None => TierOutcome::miss(Tier::SiteRule, "no site-rule selector produced a surviving candidate"),
    }
}

fn try_structured_data(ctx: &StaticContext, site_rule: &SiteRule, previous_price: Option<Decimal>) -> TierOutcome {
    let sd = extract_structured_data(ctx.html);
    if sd.prices.is_empty() {
        return TierOutcome::miss(Tier::StructuredData, "no JSON-LD or microdata price found");
    }

    let candidates: Vec<selection::Candidate> = sd
        .prices
        .iter()
        .enumerate()
        .map(|(i, p)| selection::Candidate {
            price: p.price,
            selector: "application/ld+json".to_string(),
            doc_order: i,
            is_sale_context: false,
            is_struck_context: false,
            is_preferred_context: false,
        })
        .collect();

    match selection::select(&candidates, site_rule, ctx.variant_rule, previous_price) {
        Some(winner) => TierOutcome::hit(Tier::StructuredData, winner.price, winner.selector.clone(), 0.95),
        None => TierOutcome::miss(Tier::StructuredData, "structured data candidates failed range checks"),
    }
}

fn try_common_selectors(
    ctx: &StaticContext,
    document: &Html,
    site_rule: &SiteRule,
    previous_price: Option<Decimal>,
) -> TierOutcome {
    let selectors: Vec<String> = COMMON_PRICE_SELECTORS.iter().map(|s| s.to_string()).collect();
    let candidates = collect_candidates(
        document,
        &selectors,
        &site_rule.avoid_selectors,
        &site_rule.avoid_contexts,
        &site_rule.prefer_contexts,
    );
    match selection::select(&candidates, site_rule, ctx.variant_rule, previous_price) {
        Some(winner) => TierOutcome::hit(Tier::CommonSelector, winner.price, winner.selector.clone(), 0.6),
        None => TierOutcome::miss(Tier::CommonSelector, "no common selector produced a surviving candidate"),
    }
}

/// Walk `selectors` in order, filtering out avoided contexts/elements,
/// and return every surviving parseable price as a ranked candidate.
fn collect_candidates(
    document: &Html,
    selectors: &[String],
    avoid_selectors: &[String],
    avoid_contexts: &[String],
    prefer_contexts: &[String],
) -> Vec<selection::Candidate> {
    let mut candidates = Vec::new();
    let mut doc_order = 0usize;

    for raw_selector in selectors {
        let Ok(selector) = Selector::parse(raw_selector) else {
            continue;
        };
        for el in document.select(&selector) {
            if dom::matches_any_selector(&el, avoid_selectors) {
                continue;
            }
            if dom::is_in_avoided_context(&el, avoid_contexts, 4) {
                continue;
            }

            let mode = if raw_selector.contains("data-price") {
                price::ParseMode::DataAttribute
            } else {
                price::ParseMode::Normal
            };

            let text = element_value_text(&el);
            if let Some(parsed) = price::parse_with_mode(&text, mode) {
                candidates.push(selection::Candidate {
                    price: parsed,
                    selector: raw_selector.clone(),
                    doc_order,
                    is_sale_context: dom::looks_like_sale_context(&el),
                    is_struck_context: dom::looks_like_struck_context(&el),
                    is_preferred_context: dom::is_in_preferred_context(&el, prefer_contexts, 4),
                });
                doc_order += 1;
            }
        }
    }

    candidates
}

/// `<meta content="...">`/`data-price="..."` attribute value when
/// present, else the element's own text content.
fn element_value_text(el: &ElementRef) -> String {
    el.value()
        .attr("content")
        .or_else(|| el.value().attr("data-price"))
        .map(|s| s.to_string())
        .unwrap_or_else(|| element_text(el))
}

fn element_text(el: &ElementRef) -> String {
    el.text().collect::<String>()
}

/// Static-table extraction (§4.3.2): locate the first table whose
/// header row matches a configured keyword, find the first body row
/// with a currency glyph, and read the configured (or variant-override)
/// column.
fn extract_static_table_price(
    document: &Html,
    site_rule: &SiteRule,
    variant_rule: Option<&VariantRule>,
) -> Option<Decimal> {
    let hint = site_rule.table_hint.as_ref()?;
    let column_index = variant_rule
        .and_then(|v| v.column_index)
        .unwrap_or(hint.column_index);

    let table_sel = Selector::parse("table").ok()?;
    let row_sel = Selector::parse("tr").ok()?;
    let cell_sel = Selector::parse("th,td").ok()?;

    for table in document.select(&table_sel) {
        let mut rows = table.select(&row_sel);
        let Some(header_row) = rows.next() else {
            continue;
        };
        let header_text: String = header_row.text().collect::<String>().to_lowercase();
        let header_matches = hint
            .header_keywords
            .iter()
            .any(|kw| header_text.contains(&kw.to_lowercase()));
        if !header_matches {
            continue;
        }

        for row in rows {
            let row_text: String = row.text().collect();
            if !row_text.contains(['$', '€', '£', '¥']) {
                continue;
            }
            let cells: Vec<ElementRef> = row.select(&cell_sel).collect();
            let Some(cell) = cells.get(column_index) else {
                continue;
            };
            let text = element_text(cell);
            if let Some(price) = price::parse(&text) {
                return Some(price);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LearnedSelector, StaticTableHint, VariantRule};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn machine(previous_price: Option<Decimal>) -> Machine {
        Machine {
            id: "m1".into(),
            name: "ComMarker B6 MOPA 60W".into(),
            product_url: "https://commarker.com/x".into(),
            previous_price,
            brand: None,
            category: None,
            variant_attributes: None,
            learned_selectors: HashMap::new(),
        }
    }

    #[test]
    fn scenario_1_static_shopify_hit_via_learned_selector() {
        let html = r#"<html><body><span class="money">$1,849.00</span></body></html>"#;
        let mut m = machine(Some(dec!(1849.00)));
        m.learned_selectors.insert(
            "example.com".to_string(),
            LearnedSelector {
                selector: ".money".into(),
                last_success_at: chrono::Utc::now(),
                confidence: 0.95,
                price_at_learning: dec!(1849.00),
                learned_via: Tier::Learned,
                reasoning: None,
            },
        );
        let ctx = StaticContext {
            html,
            machine: &m,
            domain: "example.com",
            site_rule: None,
            variant_rule: None,
        };
        let outcomes = run_all(&ctx);
        let learned = &outcomes[0];
        assert_eq!(learned.tier, Tier::Learned);
        assert_eq!(learned.price, Some(dec!(1849.00)));
    }

    #[test]
    fn scenario_2_bundle_contamination_defeated_by_site_rule_tier() {
        let html = r#"
            <html><body>
            <div class="related-products"><span class="price">$4,799.00</span></div>
            <div class="entry-summary"><span class="price">$3,059.00</span></div>
            <div class="bundle-offer"><span class="price">$5,073.00</span></div>
            <div class="upsell"><span class="price">$3,926.00</span></div>
            </body></html>
        "#;
        let m = machine(Some(dec!(4589.00)));
        let site_rule = SiteRule {
            domain: "commarker.com".into(),
            site_type: SiteType::Generic,
            price_selectors: vec![".price".into()],
            avoid_selectors: vec![],
            avoid_contexts: vec![],
            prefer_contexts: vec![],
            variant_rules: vec![],
            price_range: (dec!(100), dec!(50000)),
            requires_dynamic: false,
            prefer_sale_price: false,
            extra_correction_heuristics: false,
            table_hint: None,
        };
        let variant = VariantRule {
            keywords: vec!["mopa 60w".into()],
            url_pattern: None,
            expected_price_range: Some((dec!(2800), dec!(3500))),
            column_index: None,
            preferred_selector: None,
            variant_script: vec![],
        };
        let ctx = StaticContext {
            html,
            machine: &m,
            domain: "commarker.com",
            site_rule: Some(&site_rule),
            variant_rule: Some(&variant),
        };
        let outcomes = run_all(&ctx);
        let site_rule_outcome = outcomes.iter().find(|o| o.tier == Tier::SiteRule).unwrap();
        assert_eq!(site_rule_outcome.price, Some(dec!(3059.00)));
    }

    #[test]
    fn scenario_3_static_table_column_extraction() {
        let html = r#"
            <table>
              <tr><th>Model</th><th>20W</th><th>30W</th><th>50R</th><th>60W</th><th>100W</th><th>150W</th></tr>
              <tr><td>EMP Pricing</td><td>$4,995</td><td>$6,995</td><td>$7,495</td><td>$8,495</td><td>$8,995</td><td>$11,995</td></tr>
            </table>
        "#;
        let m = machine(None);
        let site_rule = SiteRule {
            domain: "empequipment.com".into(),
            site_type: SiteType::StaticTable,
            price_selectors: vec![],
            avoid_selectors: vec![],
            avoid_contexts: vec![],
            prefer_contexts: vec![],
            variant_rules: vec![],
            price_range: (dec!(100), dec!(50000)),
            requires_dynamic: false,
            prefer_sale_price: false,
            extra_correction_heuristics: false,
            table_hint: Some(StaticTableHint {
                header_keywords: vec!["model".into()],
                column_index: 3,
            }),
        };
        let ctx = StaticContext {
            html,
            machine: &m,
            domain: "empequipment.com",
            site_rule: Some(&site_rule),
            variant_rule: None,
        };
        let outcomes = run_all(&ctx);
        let site_rule_outcome = outcomes.iter().find(|o| o.tier == Tier::SiteRule).unwrap();
        assert_eq!(site_rule_outcome.price, Some(dec!(8495)));
    }

    #[test]
    fn avoid_contexts_filters_out_bundle_candidates() {
        let html = r#"
            <div class="bundle-offer"><span class="price">$999.00</span></div>
            <div class="entry-summary"><span class="price">$499.00</span></div>
        "#;
        let m = machine(None);
        let site_rule = SiteRule {
            domain: "x.com".into(),
            site_type: SiteType::Generic,
            price_selectors: vec![".price".into()],
            avoid_selectors: vec![],
            avoid_contexts: vec!["bundle".into()],
            prefer_contexts: vec![],
            variant_rules: vec![],
            price_range: (dec!(1), dec!(100000)),
            requires_dynamic: false,
            prefer_sale_price: false,
            extra_correction_heuristics: false,
            table_hint: None,
        };
        let ctx = StaticContext {
            html,
            machine: &m,
            domain: "x.com",
            site_rule: Some(&site_rule),
            variant_rule: None,
        };
        let outcomes = run_all(&ctx);
        let site_rule_outcome = outcomes.iter().find(|o| o.tier == Tier::SiteRule).unwrap();
        assert_eq!(site_rule_outcome.price, Some(dec!(499.00)));
    }

    #[test]
    fn falls_through_to_common_selector_when_no_site_rule() {
        let html = r#"<div class="product-price">$249.00</div>"#;
        let m = machine(None);
        let ctx = StaticContext {
            html,
            machine: &m,
            domain: "unknown-site.com",
            site_rule: None,
            variant_rule: None,
        };
        let outcomes = run_all(&ctx);
        let common = outcomes.iter().find(|o| o.tier == Tier::CommonSelector).unwrap();
        assert_eq!(common.price, Some(dec!(249.00)));
    }
}
