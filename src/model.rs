//! Core data model: machines, extraction attempts, price history, site
//! rules, and batches. See SPEC_FULL.md §3.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Opaque machine identifier, owned by the external catalog.
pub type MachineId = String;

/// A learned CSS/structured-path selector for one (machine, domain) pair.
///
/// At most one entry exists per domain on a given machine; a new
/// successful LLM-tier extraction (SPEC_FULL.md §4.5 "Learning")
/// overwrites the prior entry outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedSelector {
    pub selector: String,
    pub last_success_at: DateTime<Utc>,
    pub confidence: f32,
    pub price_at_learning: Decimal,
    pub learned_via: Tier,
    pub reasoning: Option<String>,
}

/// Power rating, model suffix, and similar disambiguating attributes
/// that a machine name alone may not spell out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantAttributes {
    pub power_watts: Option<u32>,
    pub model_suffix: Option<String>,
}

/// A single tracked product. Externally owned: only `price` and
/// `learned_selectors` are mutated by this system, and only through
/// the extraction orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    pub product_url: String,
    pub previous_price: Option<Decimal>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub variant_attributes: Option<VariantAttributes>,
    /// Keyed by registrable domain (no leading "www.").
    pub learned_selectors: HashMap<String, LearnedSelector>,
}

impl Machine {
    pub fn learned_selector_for(&self, domain: &str) -> Option<&LearnedSelector> {
        self.learned_selectors.get(domain)
    }
}

/// Extraction strategies, ordered cheapest-to-most-expensive. Later
/// tiers are only attempted when earlier ones fail or fail validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Learned,
    SiteRule,
    StructuredData,
    CommonSelector,
    Dynamic,
    Llm,
    Manual,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Learned => "LEARNED",
            Tier::SiteRule => "SITE_RULE",
            Tier::StructuredData => "STRUCTURED_DATA",
            Tier::CommonSelector => "COMMON_SELECTOR",
            Tier::Dynamic => "DYNAMIC",
            Tier::Llm => "LLM",
            Tier::Manual => "MANUAL",
        }
    }
}

/// Outcome of running VALIDATE (SPEC_FULL.md / spec.md §4.6) against an
/// extracted candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStatus {
    Pass,
    OutOfRange,
    ChangeThresholdExceeded,
    NoPrice,
    NeedsReview,
}

/// The ephemeral record of one tier's attempt to find a price for one
/// machine during one orchestrator run. Not persisted directly — folded
/// into a `PriceHistory` row by the orchestrator.
#[derive(Debug, Clone)]
pub struct ExtractionAttempt {
    pub machine_id: MachineId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tier_used: Tier,
    pub extracted_price: Option<Decimal>,
    pub selector_or_path: Option<String>,
    pub confidence: f32,
    pub validation_status: ValidationStatus,
    pub requires_approval: bool,
    pub llm_cost_usd: Option<Decimal>,
    pub llm_tokens: Option<u32>,
    pub reason: Option<String>,
}

impl ExtractionAttempt {
    pub fn started(machine_id: MachineId) -> Self {
        Self {
            machine_id,
            started_at: Utc::now(),
            finished_at: None,
            tier_used: Tier::Manual,
            extracted_price: None,
            selector_or_path: None,
            confidence: 0.0,
            validation_status: ValidationStatus::NoPrice,
            requires_approval: false,
            llm_cost_usd: None,
            llm_tokens: None,
            reason: None,
        }
    }
}

/// An append-only row recording one completed extraction. Never updated
/// or deleted once written (spec.md §3.3, invariant 1 in §8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceHistory {
    pub id: Uuid,
    pub machine_id: MachineId,
    pub price: Option<Decimal>,
    pub currency: String,
    pub previous_price: Option<Decimal>,
    pub tier_used: Tier,
    pub selector_or_path: Option<String>,
    pub confidence: f32,
    pub validation_status: ValidationStatus,
    pub batch_id: Option<Uuid>,
    pub requires_approval: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-domain site configuration: where to look for a price, what to
/// avoid, and how to sanity-check what's found. Static config, loaded
/// once at startup; never mutated at runtime (spec.md §4.2, §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRule {
    pub domain: String,
    #[serde(rename = "type")]
    pub site_type: SiteType,
    pub price_selectors: Vec<String>,
    #[serde(default)]
    pub avoid_selectors: Vec<String>,
    #[serde(default)]
    pub avoid_contexts: Vec<String>,
    #[serde(default)]
    pub prefer_contexts: Vec<String>,
    #[serde(default)]
    pub variant_rules: Vec<VariantRule>,
    pub price_range: (Decimal, Decimal),
    #[serde(default)]
    pub requires_dynamic: bool,
    #[serde(default)]
    pub prefer_sale_price: bool,
    /// Per-site opt-in for the digit-correction heuristics beyond the
    /// baseline ×10/÷10 salvage (SPEC_FULL.md §9, Open Question).
    #[serde(default)]
    pub extra_correction_heuristics: bool,
    /// Static-table extraction hints (spec.md §4.3.2). Only meaningful
    /// when `site_type == StaticTable`.
    #[serde(default)]
    pub table_hint: Option<StaticTableHint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteType {
    Shopify,
    Woocommerce,
    StaticTable,
    Generic,
    JsRequired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticTableHint {
    pub header_keywords: Vec<String>,
    pub column_index: usize,
}

/// Disambiguates which variant of a product a machine record refers to,
/// matched by (case-insensitive, substring) keyword against the machine
/// name, optionally narrowed by a URL pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantRule {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub url_pattern: Option<String>,
    #[serde(default)]
    pub expected_price_range: Option<(Decimal, Decimal)>,
    #[serde(default)]
    pub column_index: Option<usize>,
    #[serde(default)]
    pub preferred_selector: Option<String>,
    /// Declarative dynamic-tier interaction sequence (SPEC_FULL.md §4.4,
    /// spec.md §9 Design Note).
    #[serde(default)]
    pub variant_script: Vec<VariantStep>,
}

impl VariantRule {
    /// Longest (most specific) keyword in this rule — used to order
    /// `variant_rules` so "ST50R" is tried before "50R" (spec.md §4.2
    /// invariant).
    pub fn specificity(&self) -> usize {
        self.keywords.iter().map(|k| k.len()).max().unwrap_or(0)
    }

    pub fn matches(&self, machine_name: &str, url: &str) -> bool {
        let name_lower = machine_name.to_lowercase();
        let keyword_hit = self
            .keywords
            .iter()
            .any(|kw| name_lower.contains(&kw.to_lowercase()));
        if !keyword_hit {
            return false;
        }
        match &self.url_pattern {
            Some(pattern) => url.contains(pattern.as_str()),
            None => true,
        }
    }
}

/// One step of a per-site variant-selection protocol, interpreted by
/// the dynamic tier (SPEC_FULL.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantStep {
    pub action: VariantAction,
    pub selector_or_text: String,
    #[serde(default)]
    pub wait_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantAction {
    Click,
    WaitForText,
}

/// A human operator's resolution of a `requires_approval` price-history
/// row (spec.md §6.1 `POST /approval/{history_id}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// Lifecycle state of a batch run (spec.md §3.5, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// The outcome of one machine's extraction within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub machine_id: MachineId,
    pub success: bool,
    pub new_price: Option<Decimal>,
    pub tier_used: Option<Tier>,
    pub requires_approval: bool,
    pub reason: Option<String>,
}

/// A batch price-update run over a set of machines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub machine_ids: Vec<MachineId>,
    pub success_count: u32,
    pub failure_count: u32,
    pub results: Vec<BatchResult>,
    /// Failures grouped by domain and reason code, for operator triage
    /// without re-reading every row (SPEC_FULL.md "Ambient Supplement").
    #[serde(default)]
    pub failure_reasons: HashMap<String, u32>,
    /// LLM spend attributed to this batch (spec.md §4.5 "Accounting").
    #[serde(default)]
    pub llm_cost_usd: Decimal,
}

impl Batch {
    pub fn new(id: Uuid, machine_ids: Vec<MachineId>) -> Self {
        Self {
            id,
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            machine_ids,
            success_count: 0,
            failure_count: 0,
            results: Vec::new(),
            failure_reasons: HashMap::new(),
            llm_cost_usd: Decimal::ZERO,
        }
    }

    /// Invariant 4 (spec.md §8): `success_count + failure_count` never
    /// exceeds the input set, and equals it only once the batch is done.
    pub fn is_consistent(&self) -> bool {
        let processed = self.success_count + self.failure_count;
        let total = self.machine_ids.len() as u32;
        if processed > total {
            return false;
        }
        if self.status == BatchStatus::Completed {
            return processed == total;
        }
        true
    }
}
