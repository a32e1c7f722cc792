//! The batch orchestrator (spec.md §4.7, §5): runs many machines under a
//! global worker cap, a per-domain concurrency cap, and a per-domain
//! rate limit, sharing one LLM budget across the whole run.
//!
//! Batch state lives in the [`crate::store::Store`] the way everything
//! else does — there is no separate in-process batch map — so a crash
//! mid-run leaves a `Running` batch an operator can see and requeue,
//! rather than one that silently vanished (SPEC_FULL.md §9 Open
//! Question).

use crate::error::ExtractError;
use crate::events::{EventBus, ExtractionEvent};
use crate::model::{Batch, BatchResult, BatchStatus};
use crate::orchestrator::Orchestrator;
use crate::rules::domain_of;
use crate::store::Store;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

/// Single-token bucket, burst 1, refilling continuously at
/// `refill_per_sec` — the "1 request per 3 seconds, no burst" default
/// from spec.md §5 is `DomainLimiter::new(1.0 / 3.0)`.
struct DomainLimiter {
    refill_per_sec: f64,
    state: Mutex<(f64, Instant)>,
}

impl DomainLimiter {
    fn new(refill_per_sec: f64) -> Self {
        Self {
            refill_per_sec: refill_per_sec.max(0.001),
            state: Mutex::new((1.0, Instant::now())),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut guard = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(guard.1).as_secs_f64();
                guard.1 = now;
                guard.0 = (guard.0 + elapsed * self.refill_per_sec).min(1.0);
                if guard.0 >= 1.0 {
                    guard.0 -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - guard.0;
                    Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

pub struct BatchConfig {
    pub max_concurrency: usize,
    pub per_domain_concurrency: usize,
    pub requests_per_second_per_domain: f64,
    pub llm_batch_budget_usd: Decimal,
}

/// Runs [`Orchestrator::extract_machine`] over a set of machine ids,
/// fanning out within the limits above and persisting progress to the
/// store as it goes.
pub struct BatchOrchestrator {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    config: BatchConfig,
    domain_semaphores: DashMap<String, Arc<Semaphore>>,
    domain_limiters: DashMap<String, Arc<DomainLimiter>>,
}

impl BatchOrchestrator {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
        config: BatchConfig,
    ) -> Self {
        Self {
            orchestrator,
            store,
            events,
            config,
            domain_semaphores: DashMap::new(),
            domain_limiters: DashMap::new(),
        }
    }

    fn domain_semaphore(&self, domain: &str) -> Arc<Semaphore> {
        self.domain_semaphores
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_domain_concurrency)))
            .clone()
    }

    fn domain_limiter(&self, domain: &str) -> Arc<DomainLimiter> {
        self.domain_limiters
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(DomainLimiter::new(self.config.requests_per_second_per_domain)))
            .clone()
    }

    /// Create the `Batch` row (status `Pending`) and return its id
    /// synchronously, without running any extractions. Callers that need
    /// the id before dispatch completes — the HTTP layer in particular,
    /// which must hand the same id back to the client it later polls
    /// with `GET /batch/:id` — call this first, then `execute_batch`.
    pub async fn create_batch(&self, machine_ids: Vec<String>) -> Result<Uuid, ExtractError> {
        let batch = Batch::new(Uuid::new_v4(), machine_ids);
        let batch_id = batch.id;
        self.store
            .create_batch(&batch)
            .await
            .map_err(|e| ExtractError::FetchPermanent {
                url: "batch".to_string(),
                reason: e.to_string(),
            })?;
        Ok(batch_id)
    }

    /// Create, run, and finalize one batch in a single call. Returns
    /// once every machine has either produced a result or been recorded
    /// as a failure; the `Batch` row in the store reflects the final
    /// state on return. Convenience wrapper over
    /// `create_batch` + `execute_batch` for callers (CLI, tests) that
    /// don't need the id before the run completes.
    pub async fn run_batch(&self, machine_ids: Vec<String>) -> Result<Uuid, ExtractError> {
        let batch_id = self.create_batch(machine_ids.clone()).await?;
        self.execute_batch(batch_id, machine_ids).await?;
        Ok(batch_id)
    }

    /// Run a previously created batch (see `create_batch`) to
    /// completion, persisting progress and the final summary under its
    /// existing id.
    pub async fn execute_batch(&self, batch_id: Uuid, machine_ids: Vec<String>) -> Result<(), ExtractError> {
        let mut batch = self
            .store
            .get_batch(batch_id)
            .await
            .map_err(|e| ExtractError::FetchPermanent {
                url: "batch".to_string(),
                reason: e.to_string(),
            })?;

        self.events.emit(ExtractionEvent::BatchStarted {
            batch_id,
            machine_count: machine_ids.len(),
        });

        batch.status = BatchStatus::Running;
        batch.started_at = Some(Utc::now());
        let _ = self.store.update_batch(&batch).await;

        let total = machine_ids.len();
        let global_semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let llm_budget = Arc::new(Mutex::new(self.config.llm_batch_budget_usd));
        let completed = Arc::new(AtomicU32::new(0));
        let success_count = Arc::new(AtomicU32::new(0));
        let failure_count = Arc::new(AtomicU32::new(0));
        let results: Arc<Mutex<Vec<BatchResult>>> = Arc::new(Mutex::new(Vec::with_capacity(total)));
        let failure_reasons: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));
        let llm_cost_total = Arc::new(Mutex::new(Decimal::ZERO));

        let mut handles = Vec::with_capacity(total);

        for machine_id in machine_ids {
            let global_semaphore = global_semaphore.clone();
            let orchestrator = self.orchestrator.clone();
            let store = self.store.clone();
            let events = self.events.clone();
            let llm_budget = llm_budget.clone();
            let completed = completed.clone();
            let success_count = success_count.clone();
            let failure_count = failure_count.clone();
            let results = results.clone();
            let failure_reasons = failure_reasons.clone();
            let llm_cost_total = llm_cost_total.clone();

            let domain = match store.get_machine(&machine_id).await {
                Ok(machine) => domain_of(&machine.product_url).unwrap_or_else(|| machine.product_url.clone()),
                Err(_) => "unknown".to_string(),
            };
            let domain_semaphore = self.domain_semaphore(&domain);
            let domain_limiter = self.domain_limiter(&domain);

            let handle = tokio::spawn(async move {
                let _global_permit = global_semaphore.acquire_owned().await.ok();
                let _domain_permit = domain_semaphore.acquire_owned().await.ok();
                domain_limiter.acquire().await;

                let outcome = orchestrator
                    .extract_machine(&machine_id, Some(batch_id), Some(&llm_budget))
                    .await;

                let result = match outcome {
                    Ok(run) => {
                        {
                            let mut total_cost = llm_cost_total.lock().await;
                            *total_cost += run.llm_cost_usd;
                        }
                        let success = run.history.price.is_some()
                            && run.history.validation_status == crate::model::ValidationStatus::Pass;
                        if success {
                            success_count.fetch_add(1, Ordering::Relaxed);
                        } else {
                            failure_count.fetch_add(1, Ordering::Relaxed);
                            let reason = run
                                .reason
                                .clone()
                                .unwrap_or_else(|| format!("{:?}", run.history.validation_status));
                            let mut reasons = failure_reasons.lock().await;
                            *reasons.entry(format!("{domain}: {reason}")).or_insert(0) += 1;
                        }
                        BatchResult {
                            machine_id: machine_id.clone(),
                            success,
                            new_price: run.history.price,
                            tier_used: Some(run.history.tier_used),
                            requires_approval: run.history.requires_approval,
                            reason: run.reason,
                        }
                    }
                    Err(e) => {
                        failure_count.fetch_add(1, Ordering::Relaxed);
                        let mut reasons = failure_reasons.lock().await;
                        *reasons.entry(format!("{domain}: {e}")).or_insert(0) += 1;
                        BatchResult {
                            machine_id: machine_id.clone(),
                            success: false,
                            new_price: None,
                            tier_used: None,
                            requires_approval: false,
                            reason: Some(e.to_string()),
                        }
                    }
                };

                results.lock().await.push(result);
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                events.emit(ExtractionEvent::BatchProgress {
                    batch_id,
                    completed: done as usize,
                    total,
                    succeeded: success_count.load(Ordering::Relaxed) as usize,
                    failed: failure_count.load(Ordering::Relaxed) as usize,
                });
            });
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.await;
        }

        batch.status = BatchStatus::Completed;
        batch.finished_at = Some(Utc::now());
        batch.success_count = success_count.load(Ordering::Relaxed);
        batch.failure_count = failure_count.load(Ordering::Relaxed);
        batch.results = Arc::try_unwrap(results).map(Mutex::into_inner).unwrap_or_default();
        batch.failure_reasons = Arc::try_unwrap(failure_reasons).map(Mutex::into_inner).unwrap_or_default();
        batch.llm_cost_usd = *llm_cost_total.lock().await;

        debug_assert!(batch.is_consistent());

        self.store
            .update_batch(&batch)
            .await
            .map_err(|e| ExtractError::FetchPermanent {
                url: "batch".to_string(),
                reason: e.to_string(),
            })?;

        self.events.emit(ExtractionEvent::BatchComplete {
            batch_id,
            success_count: batch.success_count,
            failure_count: batch.failure_count,
            llm_cost_usd: batch.llm_cost_usd,
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::http_client::HttpClient;
    use crate::extract::llm_tier::LlmRate;
    use crate::model::Machine;
    use crate::rules::SiteRuleTable;
    use crate::store::SqliteStore;
    use rust_decimal_macros::dec;
    use std::collections::HashMap as StdHashMap;
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

    async fn seeded_store(machines: Vec<Machine>) -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().expect("open in-memory store");
        for machine in machines {
            store.put_machine(&machine).await.expect("seed machine");
        }
        Arc::new(store)
    }

    fn machine(id: &str, url: String) -> Machine {
        Machine {
            id: id.to_string(),
            name: format!("Machine {id}"),
            product_url: url,
            previous_price: None,
            brand: None,
            category: None,
            variant_attributes: None,
            learned_selectors: StdHashMap::new(),
        }
    }

    #[tokio::test]
    async fn batch_runs_all_machines_and_persists_a_consistent_summary() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><span class="price">$199.00</span></body></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>no price</body></html>"))
            .mount(&server)
            .await;

        let machines = vec![
            machine("a", format!("{}/a", server.uri())),
            machine("b", format!("{}/b", server.uri())),
        ];
        let store = seeded_store(machines).await;

        let orchestrator = Arc::new(Orchestrator::new(
            HttpClient::new(5_000),
            None,
            None,
            rate(),
            SiteRuleTable::new(vec![]),
            store.clone() as Arc<dyn Store>,
            Arc::new(EventBus::new(16)),
            5_000,
            5_000,
        ));

        let batch_orchestrator = BatchOrchestrator::new(
            orchestrator,
            store.clone() as Arc<dyn Store>,
            Arc::new(EventBus::new(16)),
            BatchConfig {
                max_concurrency: 4,
                per_domain_concurrency: 2,
                requests_per_second_per_domain: 100.0,
                llm_batch_budget_usd: dec!(5.00),
            },
        );

        let batch_id = batch_orchestrator
            .run_batch(vec!["a".to_string(), "b".to_string()])
            .await
            .expect("batch completes");

        let batch = store.get_batch(batch_id).await.expect("batch persisted");
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.success_count, 1);
        assert_eq!(batch.failure_count, 1);
        assert!(batch.is_consistent());
        assert_eq!(batch.results.len(), 2);
        assert!(!batch.failure_reasons.is_empty());
    }

    #[tokio::test]
    async fn domain_limiter_spaces_out_acquisitions() {
        let limiter = DomainLimiter::new(1.0 / 3.0);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(2_500));
    }
}
