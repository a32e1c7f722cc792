//! Pull price data out of raw HTML without paying for a browser.
//!
//! Walks `<script type="application/ld+json">` blocks looking for a
//! schema.org `Product`/`Offer`, and falls back to `itemprop` microdata
//! when no JSON-LD is present. This is the STRUCTURED_DATA tier's data
//! source; `crate::extract::static_tier` decides what to do with what
//! comes back.

use rust_decimal::Decimal;
use scraper::{Html, Selector};
use serde_json::Value;
use std::str::FromStr;

/// A price candidate pulled from a `Product`/`Offer` object, plus enough
/// surrounding context to validate and label it.
#[derive(Debug, Clone)]
pub struct JsonLdPrice {
    pub price: Decimal,
    pub currency: Option<String>,
    pub high_price: Option<Decimal>,
    pub availability: Option<String>,
}

/// All price-relevant structured data extracted from one page. A page
/// can legitimately contain more than one `Product` object (e.g.
/// variant selectors that expand into an `AggregateOffer`), so this is
/// a list, ordered as encountered in document order.
#[derive(Debug, Clone, Default)]
pub struct StructuredData {
    pub prices: Vec<JsonLdPrice>,
    pub has_jsonld: bool,
    pub has_microdata: bool,
}

/// Parse all `<script type="application/ld+json">` blocks and any
/// `itemprop="price"` microdata in `html`.
pub fn extract_structured_data(html: &str) -> StructuredData {
    let mut sd = StructuredData::default();
    let document = Html::parse_document(html);

    extract_jsonld(&document, &mut sd);
    if sd.prices.is_empty() {
        extract_microdata(&document, &mut sd);
    }

    sd
}

fn extract_jsonld(document: &Html, sd: &mut StructuredData) {
    let sel = Selector::parse(r#"script[type="application/ld+json"]"#).unwrap();
    for element in document.select(&sel) {
        let text = element.inner_html();
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            sd.has_jsonld = true;
            process_jsonld_value(&value, sd);
        }
    }
}

fn process_jsonld_value(value: &Value, sd: &mut StructuredData) {
    if let Some(graph) = value.get("@graph").and_then(|g| g.as_array()) {
        for item in graph {
            classify_jsonld_object(item, sd);
        }
    } else if let Some(arr) = value.as_array() {
        for item in arr {
            classify_jsonld_object(item, sd);
        }
    } else {
        classify_jsonld_object(value, sd);
    }
}

fn classify_jsonld_object(value: &Value, sd: &mut StructuredData) {
    let ld_type = value.get("@type").and_then(type_str).unwrap_or_default();

    if ld_type.eq_ignore_ascii_case("product") {
        if let Some(p) = parse_product(value) {
            sd.prices.push(p);
        }
    } else if ld_type.eq_ignore_ascii_case("offer") || ld_type.eq_ignore_ascii_case("aggregateoffer")
    {
        if let Some(p) = parse_offer(value) {
            sd.prices.push(p);
        }
    }
}

/// `@type` is sometimes a string, sometimes an array of strings
/// (`["Product", "https://schema.org/Product"]`) — take the first.
fn type_str(v: &Value) -> Option<String> {
    if let Some(s) = v.as_str() {
        return Some(s.to_string());
    }
    v.as_array()?.first()?.as_str().map(|s| s.to_string())
}

fn parse_product(value: &Value) -> Option<JsonLdPrice> {
    let offers = value.get("offers")?;
    // `offers` can be a single Offer object or an array of them; a
    // variant-bearing page often lists several and the caller picks.
    if let Some(arr) = offers.as_array() {
        arr.iter().find_map(parse_offer)
    } else {
        parse_offer(offers)
    }
}

fn parse_offer(value: &Value) -> Option<JsonLdPrice> {
    // `offers.price` is the common case; some storefronts nest it under
    // `priceSpecification.price` instead, to carry an original-vs-current
    // distinction (e.g. a `UnitPriceSpecification` alongside a sale `price`).
    let raw_price = value
        .get("price")
        .or_else(|| value.get("lowPrice"))
        .and_then(number_like_to_string)
        .or_else(|| {
            value
                .get("priceSpecification")
                .and_then(|ps| ps.get("price"))
                .and_then(number_like_to_string)
        })?;
    let price = Decimal::from_str(&raw_price).ok()?;

    let high_price = value
        .get("highPrice")
        .and_then(number_like_to_string)
        .and_then(|s| Decimal::from_str(&s).ok());

    let currency = value
        .get("priceCurrency")
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let availability = value
        .get("availability")
        .and_then(Value::as_str)
        .map(|s| s.trim_start_matches("https://schema.org/").to_string());

    Some(JsonLdPrice {
        price,
        currency,
        high_price,
        availability,
    })
}

/// JSON-LD prices are sometimes numbers, sometimes strings
/// (`"price": "1849.00"` vs `"price": 1849.00`).
fn number_like_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_microdata(document: &Html, sd: &mut StructuredData) {
    let Ok(sel) = Selector::parse(r#"[itemprop="price"]"#) else {
        return;
    };
    for element in document.select(&sel) {
        let raw = element
            .value()
            .attr("content")
            .map(|s| s.to_string())
            .or_else(|| Some(element.text().collect::<String>()));
        let Some(raw) = raw else { continue };
        if let Ok(price) = Decimal::from_str(raw.trim()) {
            sd.has_microdata = true;
            sd.prices.push(JsonLdPrice {
                price,
                currency: None,
                high_price: None,
                availability: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn extracts_product_offer_price() {
        let html = r#"
            <html><head>
            <script type="application/ld+json">
            {"@context":"https://schema.org","@type":"Product","name":"ComMarker B6 MOPA 60W",
             "offers":{"@type":"Offer","price":"3059.00","priceCurrency":"USD","availability":"https://schema.org/InStock"}}
            </script>
            </head><body></body></html>
        "#;
        let sd = extract_structured_data(html);
        assert!(sd.has_jsonld);
        assert_eq!(sd.prices.len(), 1);
        assert_eq!(sd.prices[0].price, dec!(3059.00));
        assert_eq!(sd.prices[0].currency.as_deref(), Some("USD"));
        assert_eq!(sd.prices[0].availability.as_deref(), Some("InStock"));
    }

    #[test]
    fn extracts_from_graph_wrapper() {
        let html = r#"
            <script type="application/ld+json">
            {"@graph":[{"@type":"Product","offers":{"price":1849.0,"priceCurrency":"USD"}}]}
            </script>
        "#;
        let sd = extract_structured_data(html);
        assert_eq!(sd.prices[0].price, dec!(1849.0));
    }

    #[test]
    fn falls_back_to_microdata_when_no_jsonld() {
        let html = r#"<span itemprop="price" content="999.00">$999.00</span>"#;
        let sd = extract_structured_data(html);
        assert!(!sd.has_jsonld);
        assert!(sd.has_microdata);
        assert_eq!(sd.prices[0].price, dec!(999.00));
    }

    #[test]
    fn ignores_malformed_jsonld_without_panicking() {
        let html = r#"<script type="application/ld+json">{not valid json</script>"#;
        let sd = extract_structured_data(html);
        assert!(sd.prices.is_empty());
    }

    #[test]
    fn reads_nested_price_specification_when_price_is_absent() {
        let html = r#"
            <script type="application/ld+json">
            {"@type":"Product","offers":{"priceSpecification":{"price":"2399.00","priceCurrency":"USD"},"priceCurrency":"USD"}}
            </script>
        "#;
        let sd = extract_structured_data(html);
        assert_eq!(sd.prices[0].price, dec!(2399.00));
    }

    #[test]
    fn handles_array_of_offers_taking_first_parseable() {
        let html = r#"
            <script type="application/ld+json">
            {"@type":"Product","offers":[{"price":"4589.00","priceCurrency":"USD"}]}
            </script>
        "#;
        let sd = extract_structured_data(html);
        assert_eq!(sd.prices[0].price, dec!(4589.00));
    }
}
