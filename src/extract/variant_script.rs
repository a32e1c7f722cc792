//! Interpreter for the declarative variant-selection protocol.
//!
//! Each site's click sequence for picking the right product variant
//! (wattage, model tab, bundle tier) is data — a `Vec<VariantStep>` on
//! its `SiteRule` — rather than per-site code, so the dynamic tier is a
//! generic interpreter instead of a growing pile of site-specific
//! branches.

use crate::error::ExtractError;
use crate::model::{VariantAction, VariantStep};
use crate::renderer::RenderContext;
use std::time::Duration;

const DEFAULT_STEP_WAIT_MS: u64 = 300;
const TEXT_POLL_INTERVAL_MS: u64 = 200;
const TEXT_WAIT_BUDGET_MS: u64 = 5_000;

/// Run a site's variant-selection script against an already-navigated
/// page. Best-effort: a step that can't find its target is reported,
/// not panicked on — the caller (the dynamic tier) decides whether a
/// missed step is fatal to the attempt.
pub async fn run_script(
    ctx: &mut dyn RenderContext,
    steps: &[VariantStep],
) -> Result<(), ExtractError> {
    for step in steps {
        match step.action {
            VariantAction::Click => {
                click_matching(ctx, &step.selector_or_text).await?;
            }
            VariantAction::WaitForText => {
                wait_for_text(ctx, &step.selector_or_text).await?;
            }
        }
        let wait = if step.wait_ms > 0 {
            step.wait_ms
        } else {
            DEFAULT_STEP_WAIT_MS
        };
        tokio::time::sleep(Duration::from_millis(wait)).await;
    }
    Ok(())
}

/// `needle` is either a CSS selector (leading `.`, `#`, or `[`) or free
/// text to match against clickable elements' text content.
async fn click_matching(ctx: &mut dyn RenderContext, needle: &str) -> Result<(), ExtractError> {
    let needle_json = serde_json::to_string(needle).unwrap_or_else(|_| "\"\"".to_string());
    let script = format!(
        r#"(() => {{
            const needle = {needle_json}.toLowerCase();
            let el = null;
            if (needle.startsWith('.') || needle.startsWith('#') || needle.startsWith('[')) {{
                el = document.querySelector({needle_json});
            }}
            if (!el) {{
                const candidates = Array.from(document.querySelectorAll(
                    'button, a, [role="button"], input[type="radio"], label, .swatch, .variant-option'
                ));
                el = candidates.find(c => (c.textContent || '').trim().toLowerCase().includes(needle));
            }}
            if (el) {{ el.click(); return true; }}
            return false;
        }})()"#
    );

    let matched = ctx
        .execute_js(&script)
        .await
        .map_err(|e| ExtractError::RendererUnavailable(e.to_string()))?;

    if matched.as_bool() == Some(true) {
        Ok(())
    } else {
        Err(ExtractError::RendererUnavailable(format!(
            "no clickable element matched {needle:?}"
        )))
    }
}

/// Poll the page's HTML for `text` appearing, bounded to a 5 s budget
/// per the dynamic tier's AJAX-settle step.
async fn wait_for_text(ctx: &dyn RenderContext, text: &str) -> Result<(), ExtractError> {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(TEXT_WAIT_BUDGET_MS);
    loop {
        let html = ctx
            .get_html()
            .await
            .map_err(|e| ExtractError::RendererUnavailable(e.to_string()))?;
        if html.contains(text) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ExtractError::RendererUnavailable(format!(
                "text {text:?} did not appear within {TEXT_WAIT_BUDGET_MS}ms"
            )));
        }
        tokio::time::sleep(Duration::from_millis(TEXT_POLL_INTERVAL_MS)).await;
    }
}
