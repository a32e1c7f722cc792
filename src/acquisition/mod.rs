//! HTTP-based acquisition: fetch raw HTML and pull structured data out of
//! it without paying for a browser.
//!
//! The browser (`crate::renderer`) is reserved for sites that need JS to
//! reveal the real price (`SiteRule.requires_dynamic`).

pub mod http_client;
pub mod structured;
pub mod url_health;
