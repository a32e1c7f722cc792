//! Headless-browser tier: select the right variant interactively, then
//! re-run the static selector logic against the post-interaction DOM.

use crate::extract::variant_script;
use crate::extract::{static_tier::StaticContext, TierOutcome};
use crate::model::{Machine, SiteRule, Tier, VariantRule};
use crate::renderer::{RenderContext, Renderer};
use scraper::{Html, Selector};
use std::time::Duration;

/// The ancestor containers `static_tier`'s re-parse is scoped to, so a
/// bundle widget elsewhere on the page can't contaminate the result
/// (§4.4 step 6).
const SCOPE_CONTAINERS: &[&str] = &[
    ".entry-summary",
    ".product-main",
    "#product-main",
    ".product-info-main",
];

pub struct DynamicContext<'a> {
    pub machine: &'a Machine,
    pub domain: &'a str,
    pub site_rule: Option<&'a SiteRule>,
    pub variant_rule: Option<&'a VariantRule>,
    pub product_url: &'a str,
}

/// Run the full dynamic-tier protocol: acquire a page, navigate, dismiss
/// popups, run the variant script, wait for the price to settle, and
/// re-extract scoped to the product's own summary container.
///
/// The page is released back to the renderer on every exit path,
/// success or failure, via the `RenderContext::close` call guaranteed
/// by the `?`-free structure below (no early return bypasses it).
pub async fn extract(renderer: &dyn Renderer, ctx: &DynamicContext<'_>, navigate_timeout_ms: u64) -> TierOutcome {
    let mut page = match renderer.new_context().await {
        Ok(p) => p,
        Err(e) => return TierOutcome::miss(Tier::Dynamic, format!("could not acquire browser page: {e}")),
    };

    let outcome = run(page.as_mut(), ctx, navigate_timeout_ms).await;
    let _ = page.close().await;
    outcome
}

async fn run(page: &mut dyn RenderContext, ctx: &DynamicContext<'_>, navigate_timeout_ms: u64) -> TierOutcome {
    if let Err(e) = page.navigate(ctx.product_url, navigate_timeout_ms).await {
        return TierOutcome::miss(Tier::Dynamic, format!("navigation failed: {e}"));
    }

    dismiss_popups(page).await;

    if let Some(vr) = ctx.variant_rule {
        if !vr.variant_script.is_empty() {
            if let Err(e) = variant_script::run_script(page, &vr.variant_script).await {
                return TierOutcome::miss(Tier::Dynamic, format!("variant selection failed: {e}"));
            }
        }
    }

    // Give the post-click AJAX price update a moment even when the
    // script had no explicit WaitForText step.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let html = match page.get_html().await {
        Ok(h) => h,
        Err(e) => return TierOutcome::miss(Tier::Dynamic, format!("failed to read rendered HTML: {e}")),
    };

    let scoped = scoped_html(&html);
    let static_ctx = StaticContext {
        html: &scoped,
        machine: ctx.machine,
        domain: ctx.domain,
        site_rule: ctx.site_rule,
        variant_rule: ctx.variant_rule,
    };

    let inner = crate::extract::static_tier::run_all(&static_ctx);
    match inner.into_iter().find(|o| o.price.is_some() && o.tier != Tier::Learned) {
        Some(hit) => TierOutcome::hit(
            Tier::Dynamic,
            hit.price.expect("checked above"),
            hit.selector_or_path.unwrap_or_default(),
            0.8,
        ),
        None => TierOutcome::miss(Tier::Dynamic, "no candidate survived after variant selection"),
    }
}

/// Best-effort popup dismissal: hide anything that looks like an
/// overlay, click anything that looks like a close button. Never
/// treated as fatal — a missed popup just means the later selectors
/// have to filter around it, same as any other noise on the page.
async fn dismiss_popups(page: &mut dyn RenderContext) {
    let script = r#"(() => {
        const all = Array.from(document.querySelectorAll('body *'));
        for (const el of all) {
            const z = parseInt(getComputedStyle(el).zIndex, 10);
            if (!Number.isNaN(z) && z > 100) {
                el.style.display = 'none';
            }
        }
        const closers = Array.from(document.querySelectorAll('button, a, [role="button"]'))
            .filter(el => /close|dismiss|×|x/i.test((el.textContent || '').trim()));
        for (const el of closers) { el.click(); }
        return true;
    })()"#;
    let _ = page.execute_js(script).await;
}

/// Narrow `html` down to the product-summary container, when one of the
/// known container selectors is present; otherwise return it unchanged.
fn scoped_html(html: &str) -> String {
    let document = Html::parse_document(html);
    for container in SCOPE_CONTAINERS {
        if let Ok(sel) = Selector::parse(container) {
            if let Some(el) = document.select(&sel).next() {
                return el.html();
            }
        }
    }
    html.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SiteType, VariantAction, VariantRule, VariantStep};
    use crate::renderer::NavigationResult;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// A scripted fake page: navigation always succeeds, `execute_js`
    /// records the script and mutates `html` to simulate the site's own
    /// variant-click JS, and `get_html` returns whatever `html` currently
    /// holds.
    struct FakePage {
        html: Mutex<String>,
    }

    #[async_trait]
    impl RenderContext for FakePage {
        async fn navigate(&mut self, _url: &str, _timeout_ms: u64) -> anyhow::Result<NavigationResult> {
            Ok(NavigationResult {
                final_url: _url.to_string(),
                status: 200,
                redirect_chain: vec![],
                load_time_ms: 10,
            })
        }

        async fn execute_js(&self, script: &str) -> anyhow::Result<serde_json::Value> {
            if script.to_lowercase().contains("30w") {
                *self.html.lock().unwrap() = r#"
                    <div class="entry-summary"><span class="price">$2,399.00</span></div>
                "#
                .to_string();
                return Ok(serde_json::Value::Bool(true));
            }
            Ok(serde_json::Value::Bool(true))
        }

        async fn get_html(&self) -> anyhow::Result<String> {
            Ok(self.html.lock().unwrap().clone())
        }

        async fn get_url(&self) -> anyhow::Result<String> {
            Ok("https://commarker.com/product/b6".to_string())
        }

        async fn close(self: Box<Self>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn machine() -> Machine {
        Machine {
            id: "m4".into(),
            name: "ComMarker B6 30W".into(),
            product_url: "https://commarker.com/product/b6".into(),
            previous_price: None,
            brand: None,
            category: None,
            variant_attributes: None,
            learned_selectors: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn scenario_4_variant_selection_via_dynamic_tier() {
        let mut page = FakePage {
            html: Mutex::new(
                r#"<div class="entry-summary"><span class="price">$1,599.00</span></div>"#.to_string(),
            ),
        };

        let site_rule = SiteRule {
            domain: "commarker.com".into(),
            site_type: SiteType::JsRequired,
            price_selectors: vec![".price".into()],
            avoid_selectors: vec![],
            avoid_contexts: vec![],
            prefer_contexts: vec![],
            variant_rules: vec![],
            price_range: (dec!(100), dec!(50000)),
            requires_dynamic: true,
            prefer_sale_price: false,
            extra_correction_heuristics: false,
            table_hint: None,
        };
        let variant = VariantRule {
            keywords: vec!["30w".into()],
            url_pattern: None,
            expected_price_range: None,
            column_index: None,
            preferred_selector: None,
            variant_script: vec![VariantStep {
                action: VariantAction::Click,
                selector_or_text: "30W".into(),
                wait_ms: 50,
            }],
        };
        let m = machine();
        let ctx = DynamicContext {
            machine: &m,
            domain: "commarker.com",
            site_rule: Some(&site_rule),
            variant_rule: Some(&variant),
            product_url: &m.product_url,
        };

        let outcome = run(&mut page, &ctx, 5_000).await;
        assert_eq!(outcome.tier, Tier::Dynamic);
        assert_eq!(outcome.price, Some(dec!(2399.00)));
    }
}
