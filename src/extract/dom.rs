//! Shared DOM-walking helpers for the static and dynamic tiers.
//!
//! Implemented as a walk over `scraper`'s immutable `ego_tree`, reading
//! ancestor data through indices rather than back-references, so there
//! is no parent/child reference cycle to reason about.

use scraper::{ElementRef, Selector};

/// Concatenated class/id/text of an element's ancestors, up to
/// `max_levels` up, used for `avoid_contexts`/`prefer_contexts`
/// substring matching. Lowercased so callers can match case-insensitively.
pub fn ancestor_context_text(el: &ElementRef, max_levels: usize) -> String {
    let mut buf = String::new();
    let mut levels = 0;
    let mut node = el.parent();
    while let Some(n) = node {
        if levels >= max_levels {
            break;
        }
        if let Some(element) = n.value().as_element() {
            buf.push(' ');
            buf.push_str(element.name());
            if let Some(class) = element.attr("class") {
                buf.push(' ');
                buf.push_str(class);
            }
            if let Some(id) = element.attr("id") {
                buf.push(' ');
                buf.push_str(id);
            }
        }
        node = n.parent();
        levels += 1;
    }
    buf.to_lowercase()
}

/// Opening-tag breadcrumb of an element's ancestors, outermost first, up
/// to `max_levels` up — the "parent chains" the LLM payload trims keep
/// alongside a price/product-bearing element (spec.md §4.5).
pub fn ancestor_chain_markup(el: &ElementRef, max_levels: usize) -> String {
    let mut chain = Vec::new();
    let mut levels = 0;
    let mut node = el.parent();
    while let Some(n) = node {
        if levels >= max_levels {
            break;
        }
        if let Some(element) = n.value().as_element() {
            let mut tag = format!("<{}", element.name());
            if let Some(class) = element.attr("class") {
                tag.push_str(&format!(" class=\"{class}\""));
            }
            if let Some(id) = element.attr("id") {
                tag.push_str(&format!(" id=\"{id}\""));
            }
            tag.push('>');
            chain.push(tag);
        }
        node = n.parent();
        levels += 1;
    }
    chain.reverse();
    chain.join("")
}

/// Whether any of `avoid_contexts` appears as a substring of the
/// element's ancestor context text.
pub fn is_in_avoided_context(el: &ElementRef, avoid_contexts: &[String], max_levels: usize) -> bool {
    if avoid_contexts.is_empty() {
        return false;
    }
    let ctx = ancestor_context_text(el, max_levels);
    avoid_contexts
        .iter()
        .any(|needle| ctx.contains(&needle.to_lowercase()))
}

/// Whether any of `prefer_contexts` appears as a substring of the
/// element's ancestor context text (spec.md §3.4 `prefer_contexts`).
pub fn is_in_preferred_context(el: &ElementRef, prefer_contexts: &[String], max_levels: usize) -> bool {
    if prefer_contexts.is_empty() {
        return false;
    }
    let ctx = ancestor_context_text(el, max_levels);
    prefer_contexts
        .iter()
        .any(|needle| ctx.contains(&needle.to_lowercase()))
}

/// Whether the element itself matches any of the given CSS selectors
/// (parse failures are skipped, not fatal — a malformed rule shouldn't
/// take the whole extraction down).
pub fn matches_any_selector(el: &ElementRef, selectors: &[String]) -> bool {
    selectors.iter().any(|s| {
        Selector::parse(s)
            .map(|sel| sel.matches(el))
            .unwrap_or(false)
    })
}

/// A `sale`/`current`/`now` class, or a `<ins>`/`<em>`/`<strong>` tag.
pub fn looks_like_sale_context(el: &ElementRef) -> bool {
    let name = el.value().name();
    if matches!(name, "ins" | "em" | "strong") {
        return true;
    }
    el.value()
        .attr("class")
        .map(|c| {
            let c = c.to_lowercase();
            c.contains("sale") || c.contains("current") || c.contains("now")
        })
        .unwrap_or(false)
}

/// A `<del>`/`<s>`/`<strike>` tag — the "was" price.
pub fn looks_like_struck_context(el: &ElementRef) -> bool {
    matches!(el.value().name(), "del" | "s" | "strike")
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    #[test]
    fn ancestor_context_collects_class_and_id() {
        let html = Html::parse_document(
            r#"<div class="related-products"><span class="price">$10</span></div>"#,
        );
        let sel = Selector::parse("span.price").unwrap();
        let el = html.select(&sel).next().unwrap();
        let ctx = ancestor_context_text(&el, 4);
        assert!(ctx.contains("related-products"));
    }

    #[test]
    fn ancestor_chain_markup_orders_outermost_first() {
        let html = Html::parse_document(
            r#"<div class="product-main"><div class="entry-summary"><span class="price">$10</span></div></div>"#,
        );
        let sel = Selector::parse("span.price").unwrap();
        let el = html.select(&sel).next().unwrap();
        let chain = ancestor_chain_markup(&el, 4);
        let outer = chain.find("product-main").unwrap();
        let inner = chain.find("entry-summary").unwrap();
        assert!(outer < inner);
    }

    #[test]
    fn avoided_context_matches_substring() {
        let html = Html::parse_document(
            r#"<div class="bundle-offer"><span class="price">$10</span></div>"#,
        );
        let sel = Selector::parse("span.price").unwrap();
        let el = html.select(&sel).next().unwrap();
        assert!(is_in_avoided_context(&el, &["bundle".to_string()], 4));
        assert!(!is_in_avoided_context(&el, &["warranty".to_string()], 4));
    }

    #[test]
    fn preferred_context_matches_substring() {
        let html = Html::parse_document(
            r#"<div class="entry-summary"><span class="price">$10</span></div>"#,
        );
        let sel = Selector::parse("span.price").unwrap();
        let el = html.select(&sel).next().unwrap();
        assert!(is_in_preferred_context(&el, &["entry-summary".to_string()], 4));
        assert!(!is_in_preferred_context(&el, &["product-main".to_string()], 4));
    }

    #[test]
    fn sale_and_struck_context_detection() {
        let html = Html::parse_document(
            r#"<p><del>$100</del><ins>$80</ins></p>"#,
        );
        let ins_sel = Selector::parse("ins").unwrap();
        let del_sel = Selector::parse("del").unwrap();
        let ins = html.select(&ins_sel).next().unwrap();
        let del = html.select(&del_sel).next().unwrap();
        assert!(looks_like_sale_context(&ins));
        assert!(looks_like_struck_context(&del));
    }
}
