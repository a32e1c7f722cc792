//! The extraction orchestrator (spec.md §4.6): the state machine for a
//! single machine. Runs the tier cascade — static strategies in order,
//! then dynamic, then LLM — validating each candidate in turn and
//! stopping at the first one VALIDATE accepts, then persists the
//! result and, on an LLM-tier win with a reproducible selector, learns
//! a fast path for next time.

pub mod validate;

use crate::acquisition::http_client::HttpClient;
use crate::error::ExtractError;
use crate::events::{EventBus, ExtractionEvent};
use crate::extract::dynamic_tier::{self, DynamicContext};
use crate::extract::llm_tier::{self, LlmClient, LlmRate};
use crate::extract::static_tier::{self, StaticContext};
use crate::extract::TierOutcome;
use crate::model::{LearnedSelector, Machine, PriceHistory, Tier, ValidationStatus};
use crate::renderer::Renderer;
use crate::rules::{domain_of, SiteRuleTable};
use crate::store::Store;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Per-machine deadline (spec.md §5): fetch 30s, dynamic 60s, LLM 30s,
/// total 180s — enforced here as the outer bound; the inner timeouts
/// live on the individual acquisition calls.
const TOTAL_DEADLINE_SECS: u64 = 180;

/// What one call to [`Orchestrator::extract_machine`] produced, beyond
/// the `PriceHistory` row itself — the things the batch layer needs to
/// update its own accounting without re-deriving them.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub history: PriceHistory,
    pub price_updated: bool,
    pub llm_cost_usd: Decimal,
    pub llm_tokens: u32,
    pub reason: Option<String>,
}

/// Everything one extraction run needs, wired up once at process
/// startup and shared (via `Arc`) across every concurrent job.
pub struct Orchestrator {
    http: HttpClient,
    renderer: Option<Arc<dyn Renderer>>,
    llm: Option<Arc<dyn LlmClient>>,
    llm_rate: LlmRate,
    rules: SiteRuleTable,
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    fetch_timeout_ms: u64,
    dynamic_timeout_ms: u64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: HttpClient,
        renderer: Option<Arc<dyn Renderer>>,
        llm: Option<Arc<dyn LlmClient>>,
        llm_rate: LlmRate,
        rules: SiteRuleTable,
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
        fetch_timeout_ms: u64,
        dynamic_timeout_ms: u64,
    ) -> Self {
        Self {
            http,
            renderer,
            llm,
            llm_rate,
            rules,
            store,
            events,
            fetch_timeout_ms,
            dynamic_timeout_ms,
        }
    }

    /// Run one machine's extraction end to end, bounded by the 180s
    /// total deadline. `llm_budget_remaining`, when given, is debited
    /// by the LLM call's cost; once it would go negative the LLM tier
    /// is skipped rather than attempted over-budget.
    pub async fn extract_machine(
        &self,
        machine_id: &str,
        batch_id: Option<Uuid>,
        llm_budget_remaining: Option<&tokio::sync::Mutex<Decimal>>,
    ) -> Result<RunOutcome, ExtractError> {
        match tokio::time::timeout(
            Duration::from_secs(TOTAL_DEADLINE_SECS),
            self.run(machine_id, batch_id, llm_budget_remaining),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExtractError::Cancelled(format!(
                "{machine_id}: exceeded {TOTAL_DEADLINE_SECS}s total deadline"
            ))),
        }
    }

    async fn run(
        &self,
        machine_id: &str,
        batch_id: Option<Uuid>,
        llm_budget_remaining: Option<&tokio::sync::Mutex<Decimal>>,
    ) -> Result<RunOutcome, ExtractError> {
        let started_at = Utc::now();
        self.events.emit(ExtractionEvent::ExtractionStarted {
            machine_id: machine_id.to_string(),
            timestamp: started_at,
        });

        let machine = self
            .store
            .get_machine(machine_id)
            .await
            .map_err(|e| ExtractError::FetchPermanent {
                url: machine_id.to_string(),
                reason: e.to_string(),
            })?;

        let domain = domain_of(&machine.product_url).unwrap_or_else(|| machine.product_url.clone());
        let site_rule = self.rules.lookup(&domain).cloned();
        let variant_rule = self
            .rules
            .machine_rule(&domain, &machine.name, &machine.product_url)
            .cloned();
        // `VALIDATE`'s range check needs bounds even for a domain with
        // no configured rule; fall back to the same wide-open default
        // the static tier itself uses.
        let default_rule = static_tier::wide_open_site_rule(&domain);
        let rule_ref = site_rule.as_ref().unwrap_or(&default_rule);

        let mut last_outcome: Option<TierOutcome> = None;
        let mut html_for_llm: Option<String> = None;
        let mut accepted: Option<(TierOutcome, validate::ValidateResult)> = None;

        // ---- Static cascade (learned -> site rule -> structured -> common) ----
        match self.http.get(&machine.product_url, self.fetch_timeout_ms).await {
            Ok(resp) => {
                html_for_llm = Some(resp.body.clone());
                let ctx = StaticContext {
                    html: &resp.body,
                    machine: &machine,
                    domain: &domain,
                    site_rule: site_rule.as_ref(),
                    variant_rule: variant_rule.as_ref(),
                };
                for outcome in static_tier::run_all(&ctx) {
                    last_outcome = Some(outcome.clone());
                    if let Some(price) = outcome.price {
                        let v = validate::validate(price, machine.previous_price, rule_ref, variant_rule.as_ref());
                        if v.status == ValidationStatus::Pass {
                            accepted = Some((outcome, v));
                            break;
                        }
                        self.events.emit(ExtractionEvent::TierEscalated {
                            machine_id: machine_id.to_string(),
                            from_tier: outcome.tier,
                            to_tier: next_tier(outcome.tier),
                            reason: format!("validation failed: {:?}", v.status),
                        });
                    }
                }
            }
            Err(ExtractError::FetchPermanent { reason, .. }) if !requires_dynamic(site_rule.as_ref()) => {
                return self
                    .finalize_failure(
                        &machine,
                        batch_id,
                        started_at,
                        Tier::SiteRule,
                        format!("permanent fetch failure, dynamic not required: {reason}"),
                    )
                    .await;
            }
            Err(e) => {
                // Transient-exhausted, or permanent-but-dynamic-required:
                // fall through to the dynamic tier with no static html.
                self.events.emit(ExtractionEvent::TierEscalated {
                    machine_id: machine_id.to_string(),
                    from_tier: Tier::SiteRule,
                    to_tier: Tier::Dynamic,
                    reason: format!("static fetch failed: {e}"),
                });
            }
        }

        // ---- Dynamic tier ----
        if accepted.is_none() {
            if let Some(renderer) = &self.renderer {
                let dctx = DynamicContext {
                    machine: &machine,
                    domain: &domain,
                    site_rule: site_rule.as_ref(),
                    variant_rule: variant_rule.as_ref(),
                    product_url: &machine.product_url,
                };
                let outcome = tokio::time::timeout(
                    Duration::from_millis(self.dynamic_timeout_ms),
                    dynamic_tier::extract(renderer.as_ref(), &dctx, self.fetch_timeout_ms),
                )
                .await
                .unwrap_or_else(|_| TierOutcome::miss(Tier::Dynamic, "dynamic tier exceeded its timeout"));

                last_outcome = Some(outcome.clone());
                if let Some(price) = outcome.price {
                    let v = validate::validate(price, machine.previous_price, rule_ref, variant_rule.as_ref());
                    if v.status == ValidationStatus::Pass {
                        accepted = Some((outcome, v));
                    } else {
                        self.events.emit(ExtractionEvent::TierEscalated {
                            machine_id: machine_id.to_string(),
                            from_tier: Tier::Dynamic,
                            to_tier: Tier::Llm,
                            reason: format!("validation failed: {:?}", v.status),
                        });
                    }
                } else {
                    self.events.emit(ExtractionEvent::TierEscalated {
                        machine_id: machine_id.to_string(),
                        from_tier: Tier::Dynamic,
                        to_tier: Tier::Llm,
                        reason: outcome.reason.unwrap_or_default(),
                    });
                }
            }
        }

        // ---- LLM tier ----
        let mut llm_cost_usd = Decimal::ZERO;
        let mut llm_tokens = 0u32;
        if accepted.is_none() {
            if let (Some(llm), Some(raw_html)) = (&self.llm, &html_for_llm) {
                let proceed = match llm_budget_remaining {
                    Some(budget) => {
                        let guard = budget.lock().await;
                        *guard > Decimal::ZERO
                    }
                    None => true,
                };

                if proceed {
                    let result = llm_tier::extract(
                        llm.as_ref(),
                        &self.llm_rate,
                        raw_html,
                        &machine.name,
                        site_rule.as_ref(),
                    )
                    .await;

                    llm_cost_usd = result.cost_usd;
                    llm_tokens = result.prompt_tokens + result.completion_tokens;
                    if let Some(budget) = llm_budget_remaining {
                        let mut guard = budget.lock().await;
                        *guard -= result.cost_usd;
                    }

                    last_outcome = Some(result.outcome.clone());
                    if let Some(price) = result.outcome.price {
                        let v = validate::validate(price, machine.previous_price, rule_ref, variant_rule.as_ref());
                        if v.status == ValidationStatus::Pass {
                            if let Some(selector) = &result.reproducible_selector {
                                let learned = LearnedSelector {
                                    selector: selector.clone(),
                                    last_success_at: Utc::now(),
                                    confidence: result.outcome.confidence,
                                    price_at_learning: v.final_price,
                                    learned_via: Tier::Llm,
                                    reasoning: None,
                                };
                                if self
                                    .store
                                    .update_machine_learned_selector(&machine.id, &domain, learned.clone())
                                    .await
                                    .is_ok()
                                {
                                    self.events.emit(ExtractionEvent::LearnedSelectorSaved {
                                        machine_id: machine.id.clone(),
                                        domain: domain.clone(),
                                        selector: selector.clone(),
                                        learned_via: Tier::Llm,
                                    });
                                }
                            }
                            accepted = Some((result.outcome, v));
                        }
                    }
                } else {
                    last_outcome = Some(TierOutcome::miss(Tier::Llm, "LLM batch budget exhausted"));
                }
            }
        }

        let finished_at = Utc::now();
        let elapsed_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

        let (tier_used, price, validation_status, requires_approval, selector_or_path, confidence, reason) =
            match (accepted, last_outcome) {
                (Some((outcome, v)), _) => (
                    outcome.tier,
                    Some(v.final_price),
                    v.status,
                    v.requires_approval,
                    outcome.selector_or_path,
                    outcome.confidence,
                    None,
                ),
                (None, Some(outcome)) if outcome.price.is_some() => {
                    // Had a candidate but it never passed VALIDATE anywhere.
                    let v = validate::validate(
                        outcome.price.unwrap(),
                        machine.previous_price,
                        rule_ref,
                        variant_rule.as_ref(),
                    );
                    (
                        outcome.tier,
                        Some(outcome.price.unwrap()),
                        v.status,
                        false,
                        outcome.selector_or_path,
                        outcome.confidence,
                        outcome.reason,
                    )
                }
                (None, Some(outcome)) => (
                    outcome.tier,
                    None,
                    ValidationStatus::NoPrice,
                    false,
                    None,
                    0.0,
                    outcome.reason,
                ),
                (None, None) => (Tier::Manual, None, ValidationStatus::NoPrice, false, None, 0.0, Some("no tier ran".to_string())),
            };

        let history = PriceHistory {
            id: Uuid::new_v4(),
            machine_id: machine.id.clone(),
            price,
            currency: "USD".to_string(),
            previous_price: machine.previous_price,
            tier_used,
            selector_or_path,
            confidence,
            validation_status,
            batch_id,
            requires_approval,
            created_at: finished_at,
        };

        self.store
            .append_price_history(&history)
            .await
            .map_err(|e| ExtractError::FetchPermanent {
                url: machine.product_url.clone(),
                reason: format!("failed to persist price history: {e}"),
            })?;

        let mut price_updated = false;
        if validation_status == ValidationStatus::Pass && !requires_approval {
            if let Some(p) = price {
                self.store
                    .update_machine_price(&machine.id, p, finished_at)
                    .await
                    .map_err(|e| ExtractError::FetchPermanent {
                        url: machine.product_url.clone(),
                        reason: format!("failed to update machine price: {e}"),
                    })?;
                price_updated = true;
            }
        }

        if requires_approval {
            if let Some(p) = price {
                self.events.emit(ExtractionEvent::ApprovalRequired {
                    machine_id: machine.id.clone(),
                    history_id: history.id,
                    previous_price: machine.previous_price,
                    new_price: p,
                    reason: "price change exceeds auto-commit threshold".to_string(),
                });
            }
        }

        self.events.emit(ExtractionEvent::ExtractionComplete {
            machine_id: machine.id.clone(),
            success: price.is_some() && validation_status == ValidationStatus::Pass,
            tier_used: Some(tier_used),
            price,
            requires_approval,
            elapsed_ms,
        });

        Ok(RunOutcome {
            history,
            price_updated,
            llm_cost_usd,
            llm_tokens,
            reason,
        })
    }

    async fn finalize_failure(
        &self,
        machine: &Machine,
        batch_id: Option<Uuid>,
        _started_at: chrono::DateTime<Utc>,
        tier_used: Tier,
        reason: String,
    ) -> Result<RunOutcome, ExtractError> {
        let created_at = Utc::now();
        let history = PriceHistory {
            id: Uuid::new_v4(),
            machine_id: machine.id.clone(),
            price: None,
            currency: "USD".to_string(),
            previous_price: machine.previous_price,
            tier_used,
            selector_or_path: None,
            confidence: 0.0,
            validation_status: ValidationStatus::NoPrice,
            batch_id,
            requires_approval: false,
            created_at,
        };
        self.store
            .append_price_history(&history)
            .await
            .map_err(|e| ExtractError::FetchPermanent {
                url: machine.product_url.clone(),
                reason: format!("failed to persist price history: {e}"),
            })?;

        self.events.emit(ExtractionEvent::ExtractionComplete {
            machine_id: machine.id.clone(),
            success: false,
            tier_used: Some(tier_used),
            price: None,
            requires_approval: false,
            elapsed_ms: 0,
        });

        Ok(RunOutcome {
            history,
            price_updated: false,
            llm_cost_usd: Decimal::ZERO,
            llm_tokens: 0,
            reason: Some(reason),
        })
    }
}

fn requires_dynamic(site_rule: Option<&crate::model::SiteRule>) -> bool {
    site_rule.map(|r| r.requires_dynamic).unwrap_or(false)
}

fn next_tier(current: Tier) -> Tier {
    match current {
        Tier::Learned => Tier::SiteRule,
        Tier::SiteRule => Tier::StructuredData,
        Tier::StructuredData => Tier::CommonSelector,
        Tier::CommonSelector => Tier::Dynamic,
        Tier::Dynamic => Tier::Llm,
        Tier::Llm | Tier::Manual => Tier::Manual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::extract::llm_tier::{LlmCompletion, LlmRate};
    use crate::model::{LearnedSelector, Machine};
    use crate::rules::SiteRuleTable;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rate() -> LlmRate {
        LlmRate {
            model_id: "test-model".into(),
            cost_per_1m_prompt: dec!(3.00),
            cost_per_1m_completion: dec!(15.00),
            max_payload_chars: 6_000,
        }
    }

    struct CannedLlm {
        response: String,
    }

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn complete(&self, _prompt: &str) -> Result<LlmCompletion, ExtractError> {
            Ok(LlmCompletion {
                text: self.response.clone(),
                prompt_tokens: 500,
                completion_tokens: 20,
            })
        }
    }

    async fn seeded_store(machine: Machine) -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().expect("open in-memory store");
        store.put_machine(&machine).await.expect("seed machine");
        Arc::new(store)
    }

    #[tokio::test]
    async fn scenario_1_static_hit_via_learned_selector_updates_price() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/product"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><span class="money">$1,849.00</span></body></html>"#,
            ))
            .mount(&server)
            .await;

        let url = format!("{}/product", server.uri());
        let domain = domain_of(&url).unwrap();

        let mut learned_selectors = HashMap::new();
        learned_selectors.insert(
            domain.clone(),
            LearnedSelector {
                selector: ".money".into(),
                last_success_at: Utc::now(),
                confidence: 0.95,
                price_at_learning: dec!(1849.00),
                learned_via: Tier::Learned,
                reasoning: None,
            },
        );

        let machine = Machine {
            id: "m1".into(),
            name: "Test Laser".into(),
            product_url: url,
            previous_price: Some(dec!(1849.00)),
            brand: None,
            category: None,
            variant_attributes: None,
            learned_selectors,
        };

        let store = seeded_store(machine).await;
        let orchestrator = Orchestrator::new(
            HttpClient::new(5_000),
            None,
            None,
            rate(),
            SiteRuleTable::new(vec![]),
            store.clone(),
            Arc::new(EventBus::new(16)),
            5_000,
            5_000,
        );

        let outcome = orchestrator
            .extract_machine("m1", None, None)
            .await
            .expect("extraction succeeds");

        assert_eq!(outcome.history.tier_used, Tier::Learned);
        assert_eq!(outcome.history.price, Some(dec!(1849.00)));
        assert!(!outcome.history.requires_approval);
        assert!(outcome.price_updated);

        let updated = store.get_machine("m1").await.unwrap();
        assert_eq!(updated.previous_price, Some(dec!(1849.00)));
    }

    #[tokio::test]
    async fn scenario_6_all_tiers_fail_records_no_price_history_row() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/product"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<html><body>no price here</body></html>"),
            )
            .mount(&server)
            .await;

        let machine = Machine {
            id: "m6".into(),
            name: "Mystery Machine".into(),
            product_url: format!("{}/product", server.uri()),
            previous_price: Some(dec!(2500.00)),
            brand: None,
            category: None,
            variant_attributes: None,
            learned_selectors: HashMap::new(),
        };

        let store = seeded_store(machine).await;
        let llm = CannedLlm {
            response: r#"{"price": null, "currency": "USD", "confidence": 0.1, "selector": null, "explanation": "no price visible"}"#
                .to_string(),
        };

        let orchestrator = Orchestrator::new(
            HttpClient::new(5_000),
            None,
            Some(Arc::new(llm)),
            rate(),
            SiteRuleTable::new(vec![]),
            store.clone(),
            Arc::new(EventBus::new(16)),
            5_000,
            5_000,
        );

        let outcome = orchestrator
            .extract_machine("m6", None, None)
            .await
            .expect("extraction completes, even though no price was found");

        assert_eq!(outcome.history.tier_used, Tier::Llm);
        assert_eq!(outcome.history.price, None);
        assert_eq!(outcome.history.validation_status, ValidationStatus::NoPrice);
        assert!(!outcome.price_updated);

        let unchanged = store.get_machine("m6").await.unwrap();
        assert_eq!(unchanged.previous_price, Some(dec!(2500.00)));
    }
}
