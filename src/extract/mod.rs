//! Extraction tiers: progressively more expensive strategies for
//! recovering a machine's current price from its product page.
//!
//! Each tier implements [`Extractor`], so the orchestrator's cascade is
//! a fold over a fixed ordered list rather than a hand-rolled
//! if/else-if chain.

pub mod common_selectors;
pub mod dom;
pub mod dynamic_tier;
pub mod llm_tier;
pub mod selection;
pub mod static_tier;
pub mod variant_script;
pub mod vendor_llm;

use crate::model::Tier;
use rust_decimal::Decimal;

/// What one tier found, before validation.
#[derive(Debug, Clone)]
pub struct TierOutcome {
    pub tier: Tier,
    pub price: Option<Decimal>,
    pub selector_or_path: Option<String>,
    pub confidence: f32,
    /// Populated when the tier ran but found nothing usable — kept for
    /// the PriceHistory reason field and event log, never fatal.
    pub reason: Option<String>,
}

impl TierOutcome {
    pub fn miss(tier: Tier, reason: impl Into<String>) -> Self {
        Self {
            tier,
            price: None,
            selector_or_path: None,
            confidence: 0.0,
            reason: Some(reason.into()),
        }
    }

    pub fn hit(tier: Tier, price: Decimal, selector_or_path: impl Into<String>, confidence: f32) -> Self {
        Self {
            tier,
            price: Some(price),
            selector_or_path: Some(selector_or_path.into()),
            confidence,
            reason: None,
        }
    }
}
