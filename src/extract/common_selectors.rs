//! The fallback selector list tried when a site has no rule, or its
//! rule's own selectors missed. Ordered roughly by how often each shows
//! up across the manufacturer storefronts this system watches.

/// CSS selectors tried, in order, by the COMMON_SELECTOR tier.
pub const COMMON_PRICE_SELECTORS: &[&str] = &[
    ".price",
    ".product-price",
    ".current-price",
    "[data-price]",
    ".price__current",
    ".price-item--sale",
    ".price-item--regular",
    "span.woocommerce-Price-amount",
    "p.price",
    ".product__price",
    ".product-single__price",
    ".money",
    "[itemprop=\"price\"]",
    ".price-box .price",
    ".special-price .price",
    ".regular-price .price",
    "#priceblock_ourprice",
    "#priceblock_dealprice",
    ".a-price .a-offscreen",
    ".product-info-price .price",
    ".pdp-price",
    ".price-current",
    ".price-now",
    ".price_color",
    "meta[itemprop=\"price\"]",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_is_nonempty_and_all_selectors_parse() {
        assert!(COMMON_PRICE_SELECTORS.len() > 20);
        for s in COMMON_PRICE_SELECTORS {
            scraper::Selector::parse(s).unwrap_or_else(|_| panic!("invalid selector: {s}"));
        }
    }
}
