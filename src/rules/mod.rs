//! The site rule table: a process-wide, read-mostly map of per-domain
//! extraction configuration.

mod table;

pub use table::{domain_of, normalize_domain, SiteRuleTable};
