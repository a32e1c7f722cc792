//! Last-resort tier: trim the page down to its price-bearing content
//! and ask a vendor LLM to read it.

use crate::error::ExtractError;
use crate::extract::{dom, TierOutcome};
use crate::model::{SiteRule, Tier};
use async_trait::async_trait;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::str::FromStr;

/// Per-model pricing, used to compute accounted cost for a call.
#[derive(Debug, Clone)]
pub struct LlmRate {
    pub model_id: String,
    pub cost_per_1m_prompt: Decimal,
    pub cost_per_1m_completion: Decimal,
    /// Payload budget for the trimmed HTML embedded in the prompt
    /// (spec.md §6.4 `llm.max_payload_chars`).
    pub max_payload_chars: usize,
}

/// The vendor LLM, modeled as a black-box text-in/JSON-out RPC. Kept
/// behind a trait so tests can substitute a canned responder instead of
/// calling a real API.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<LlmCompletion, ExtractError>;
}

#[derive(Debug, Clone)]
pub struct LlmCompletion {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// The parsed shape the prompt contract demands back.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmPriceResponse {
    pub price: Option<Decimal>,
    pub currency: Option<String>,
    pub confidence: f32,
    pub selector: Option<String>,
    #[allow(dead_code)]
    pub explanation: Option<String>,
}

/// Outcome of one LLM call, with the accounting the orchestrator needs
/// to attribute spend to a batch.
pub struct LlmResult {
    pub outcome: TierOutcome,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: Decimal,
    /// Present only when the response both parsed and included a
    /// `selector` that reproduces the same price when re-applied — the
    /// only path by which a machine acquires a new learned selector.
    pub reproducible_selector: Option<String>,
}

/// Default payload budget used by callers (tests, and anywhere no
/// configured `LlmRate` is at hand) that don't need a custom limit.
const DEFAULT_MAX_PAYLOAD_CHARS: usize = 6_000;

/// Build the deterministic, trimmed HTML payload the prompt embeds.
pub fn trim_html_for_prompt(html: &str) -> String {
    trim_html_for_prompt_with_budget(html, DEFAULT_MAX_PAYLOAD_CHARS)
}

/// Same as [`trim_html_for_prompt`], but truncating to a caller-supplied
/// character budget instead of the default.
pub fn trim_html_for_prompt_with_budget(html: &str, max_payload_chars: usize) -> String {
    let document = Html::parse_document(html);

    let mut kept = String::new();

    if let Ok(sel) = Selector::parse("title") {
        for el in document.select(&sel) {
            kept.push_str("<title>");
            kept.push_str(&el.text().collect::<String>());
            kept.push_str("</title>\n");
        }
    }
    if let Ok(sel) = Selector::parse(r#"meta[property^="product"], meta[property^="og:price"]"#) {
        for el in document.select(&sel) {
            kept.push_str(&el.html());
            kept.push('\n');
        }
    }
    if let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) {
        for el in document.select(&sel) {
            kept.push_str(&el.html());
            kept.push('\n');
        }
    }
    if let Ok(sel) = Selector::parse(r#"[class*="price" i], [id*="price" i], [class*="product" i], [id*="product" i]"#)
    {
        for el in document.select(&sel) {
            if is_price_or_product_bearing(&el) {
                // Keep the element's parent chain so the model sees where
                // in the page this price/product block sits.
                kept.push_str(&dom::ancestor_chain_markup(&el, 4));
                kept.push_str(&el.html());
                kept.push('\n');
            }
        }
    }
    if let Ok(sel) = Selector::parse("h1") {
        for el in document.select(&sel) {
            if dom::is_in_preferred_context(&el, &["product".to_string()], 4) {
                kept.push_str(&el.html());
                kept.push('\n');
            }
        }
    }

    let collapsed = collapse_whitespace(&kept);
    if collapsed.len() > max_payload_chars {
        collapsed[..max_payload_chars].to_string()
    } else {
        collapsed
    }
}

fn is_price_or_product_bearing(el: &ElementRef) -> bool {
    let class = el.value().attr("class").unwrap_or("").to_lowercase();
    let id = el.value().attr("id").unwrap_or("").to_lowercase();
    class.contains("price") || class.contains("product") || id.contains("price") || id.contains("product")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn build_prompt(trimmed_html: &str, machine_name: &str) -> String {
    format!(
        "You are extracting the current price of a specific product variant from a product page.\n\
         Product: {machine_name}\n\
         Respond with a single JSON object and nothing else, matching exactly:\n\
         {{\"price\": number|null, \"currency\": string, \"confidence\": number between 0 and 1, \"selector\": string|null, \"explanation\": string}}\n\
         Page content:\n{trimmed_html}"
    )
}

/// Run the LLM tier against `html`. `raw_html` is passed separately so
/// a returned `selector` can be verified by re-applying it to the
/// original, untrimmed document.
pub async fn extract(
    client: &dyn LlmClient,
    rate: &LlmRate,
    raw_html: &str,
    machine_name: &str,
    site_rule: Option<&SiteRule>,
) -> LlmResult {
    let trimmed = trim_html_for_prompt_with_budget(raw_html, rate.max_payload_chars);
    let prompt = build_prompt(&trimmed, machine_name);

    let completion = match client.complete(&prompt).await {
        Ok(c) => c,
        Err(e) => {
            return LlmResult {
                outcome: TierOutcome::miss(Tier::Llm, format!("LLM call failed: {e}")),
                prompt_tokens: 0,
                completion_tokens: 0,
                cost_usd: Decimal::ZERO,
                reproducible_selector: None,
            }
        }
    };

    let cost = cost_for(rate, completion.prompt_tokens, completion.completion_tokens);

    let parsed: Result<LlmPriceResponse, _> = serde_json::from_str(completion.text.trim());
    let Ok(parsed) = parsed else {
        return LlmResult {
            outcome: TierOutcome::miss(Tier::Llm, "LLM response failed to parse as the contracted JSON shape"),
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
            cost_usd: cost,
            reproducible_selector: None,
        };
    };

    let Some(price) = parsed.price else {
        return LlmResult {
            outcome: TierOutcome::miss(Tier::Llm, "LLM reported no price on the page"),
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
            cost_usd: cost,
            reproducible_selector: None,
        };
    };

    if let Some(rule) = site_rule {
        if price < rule.price_range.0 || price > rule.price_range.1 {
            return LlmResult {
                outcome: TierOutcome::miss(Tier::Llm, format!("LLM price {price} outside site price range")),
                prompt_tokens: completion.prompt_tokens,
                completion_tokens: completion.completion_tokens,
                cost_usd: cost,
                reproducible_selector: None,
            };
        }
    }

    let reproducible_selector = parsed
        .selector
        .as_deref()
        .filter(|sel| selector_reproduces_price(raw_html, sel, price));

    LlmResult {
        outcome: TierOutcome::hit(
            Tier::Llm,
            price,
            parsed.selector.clone().unwrap_or_else(|| "llm".to_string()),
            parsed.confidence,
        ),
        prompt_tokens: completion.prompt_tokens,
        completion_tokens: completion.completion_tokens,
        cost_usd: cost,
        reproducible_selector: reproducible_selector.map(|s| s.to_string()),
    }
}

/// Re-apply `selector` to the raw page and check it reproduces `price`
/// within one cent — the bar the LLM-learning path requires.
fn selector_reproduces_price(raw_html: &str, selector: &str, price: Decimal) -> bool {
    let Ok(sel) = Selector::parse(selector) else {
        return false;
    };
    let document = Html::parse_document(raw_html);
    let Some(el) = document.select(&sel).next() else {
        return false;
    };
    let text = el.text().collect::<String>();
    match crate::price::parse(&text) {
        Some(found) => (found - price).abs() <= Decimal::from_str("0.01").unwrap(),
        None => false,
    }
}

fn cost_for(rate: &LlmRate, prompt_tokens: u32, completion_tokens: u32) -> Decimal {
    let million = Decimal::from(1_000_000);
    let prompt_cost = rate.cost_per_1m_prompt * Decimal::from(prompt_tokens) / million;
    let completion_cost = rate.cost_per_1m_completion * Decimal::from(completion_tokens) / million;
    prompt_cost + completion_cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    struct CannedClient {
        response: String,
    }

    #[async_trait]
    impl LlmClient for CannedClient {
        async fn complete(&self, _prompt: &str) -> Result<LlmCompletion, ExtractError> {
            Ok(LlmCompletion {
                text: self.response.clone(),
                prompt_tokens: 1200,
                completion_tokens: 40,
            })
        }
    }

    fn rate() -> LlmRate {
        LlmRate {
            model_id: "test-model".into(),
            cost_per_1m_prompt: dec!(3.00),
            cost_per_1m_completion: dec!(15.00),
            max_payload_chars: 6_000,
        }
    }

    #[tokio::test]
    async fn scenario_6_all_tiers_fail_llm_reports_no_price() {
        let client = CannedClient {
            response: r#"{"price": null, "currency": "USD", "confidence": 0.1, "selector": null, "explanation": "no price visible"}"#.to_string(),
        };
        let result = extract(&client, &rate(), "<html><body>no digits here</body></html>", "M6", None).await;
        assert_eq!(result.outcome.tier, Tier::Llm);
        assert_eq!(result.outcome.price, None);
    }

    #[tokio::test]
    async fn parses_price_and_computes_cost() {
        let client = CannedClient {
            response: r#"{"price": 1849.00, "currency": "USD", "confidence": 0.8, "selector": ".money", "explanation": "found in span"}"#.to_string(),
        };
        let html = r#"<span class="money">$1,849.00</span>"#;
        let result = extract(&client, &rate(), html, "M1", None).await;
        assert_eq!(result.outcome.price, Some(dec!(1849.00)));
        assert!(result.cost_usd > Decimal::ZERO);
        assert_eq!(result.reproducible_selector.as_deref(), Some(".money"));
    }

    #[tokio::test]
    async fn rejects_price_outside_site_range() {
        let client = CannedClient {
            response: r#"{"price": 999999.00, "currency": "USD", "confidence": 0.9, "selector": null, "explanation": "x"}"#.to_string(),
        };
        let rule = SiteRule {
            domain: "x.com".into(),
            site_type: crate::model::SiteType::Generic,
            price_selectors: vec![],
            avoid_selectors: vec![],
            avoid_contexts: vec![],
            prefer_contexts: vec![],
            variant_rules: vec![],
            price_range: (dec!(1), dec!(100000)),
            requires_dynamic: false,
            prefer_sale_price: false,
            extra_correction_heuristics: false,
            table_hint: None,
        };
        let result = extract(&client, &rate(), "<html></html>", "M1", Some(&rule)).await;
        assert_eq!(result.outcome.price, None);
    }

    #[tokio::test]
    async fn malformed_response_is_a_miss_not_a_panic() {
        let client = CannedClient {
            response: "not json at all".to_string(),
        };
        let result = extract(&client, &rate(), "<html></html>", "M1", None).await;
        assert_eq!(result.outcome.price, None);
    }

    #[test]
    fn trim_html_keeps_price_bearing_elements_and_drops_noise() {
        let html = r#"
            <html><head><title>ComMarker B6</title></head>
            <body>
                <nav>lots of irrelevant navigation markup here</nav>
                <div class="product-price">$1,849.00</div>
                <footer>unrelated footer content</footer>
            </body></html>
        "#;
        let trimmed = trim_html_for_prompt(html);
        assert!(trimmed.contains("1,849.00"));
        assert!(!trimmed.contains("footer content"));
    }

    #[test]
    fn trim_html_keeps_parent_chain_and_product_section_h1() {
        let html = r#"
            <html><head><title>ComMarker B6</title></head>
            <body>
                <div class="product-main">
                    <h1>ComMarker B6 MOPA 60W</h1>
                    <div class="entry-summary"><span class="price">$1,849.00</span></div>
                </div>
                <h1>Unrelated site tagline</h1>
            </body></html>
        "#;
        let trimmed = trim_html_for_prompt(html);
        assert!(trimmed.contains("product-main"));
        assert!(trimmed.contains("ComMarker B6 MOPA 60W"));
        assert!(!trimmed.contains("Unrelated site tagline"));
    }
}
