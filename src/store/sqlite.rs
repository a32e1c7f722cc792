//! `rusqlite`-backed implementation of [`Store`].
//!
//! `rusqlite::Connection` is `Send` but not `Sync`; a single connection
//! behind a `tokio::sync::Mutex` gives every call the snapshot-read /
//! atomic-write guarantee the contract asks for without needing a
//! connection pool at this workload's write volume.

use super::Store;
use crate::error::StoreError;
use crate::model::{Batch, BatchResult, BatchStatus, LearnedSelector, Machine, PriceHistory, Tier, ValidationStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS machines (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                product_url TEXT NOT NULL,
                previous_price TEXT,
                brand TEXT,
                category TEXT,
                variant_attributes TEXT,
                learned_selectors TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS price_history (
                id TEXT PRIMARY KEY,
                machine_id TEXT NOT NULL,
                price TEXT,
                currency TEXT NOT NULL,
                previous_price TEXT,
                tier_used TEXT NOT NULL,
                selector_or_path TEXT,
                confidence REAL NOT NULL,
                validation_status TEXT NOT NULL,
                batch_id TEXT,
                requires_approval INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_price_history_machine
                ON price_history (machine_id, created_at);

            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                machine_ids TEXT NOT NULL,
                success_count INTEGER NOT NULL,
                failure_count INTEGER NOT NULL,
                results TEXT NOT NULL,
                failure_reasons TEXT NOT NULL DEFAULT '{}',
                llm_cost_usd TEXT NOT NULL DEFAULT '0'
            );
            "#,
        )?;
        Ok(())
    }

    /// Insert or replace a machine row — used by tests and by any seed
    /// script that loads the catalog before extraction runs.
    pub async fn put_machine(&self, machine: &Machine) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO machines
                (id, name, product_url, previous_price, brand, category, variant_attributes, learned_selectors)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                machine.id,
                machine.name,
                machine.product_url,
                machine.previous_price.map(|d| d.to_string()),
                machine.brand,
                machine.category,
                machine
                    .variant_attributes
                    .as_ref()
                    .map(|v| serde_json::to_string(v))
                    .transpose()?,
                serde_json::to_string(&machine.learned_selectors)?,
            ],
        )?;
        Ok(())
    }
}

fn row_to_machine(row: &rusqlite::Row) -> rusqlite::Result<Machine> {
    let previous_price: Option<String> = row.get(3)?;
    let variant_attributes: Option<String> = row.get(6)?;
    let learned_selectors: String = row.get(7)?;

    Ok(Machine {
        id: row.get(0)?,
        name: row.get(1)?,
        product_url: row.get(2)?,
        previous_price: previous_price.and_then(|s| Decimal::from_str(&s).ok()),
        brand: row.get(4)?,
        category: row.get(5)?,
        variant_attributes: variant_attributes.and_then(|s| serde_json::from_str(&s).ok()),
        learned_selectors: serde_json::from_str(&learned_selectors).unwrap_or_default(),
    })
}

fn tier_to_str(t: Tier) -> &'static str {
    t.as_str()
}

fn tier_from_str(s: &str) -> Tier {
    match s {
        "LEARNED" => Tier::Learned,
        "SITE_RULE" => Tier::SiteRule,
        "STRUCTURED_DATA" => Tier::StructuredData,
        "COMMON_SELECTOR" => Tier::CommonSelector,
        "DYNAMIC" => Tier::Dynamic,
        "LLM" => Tier::Llm,
        _ => Tier::Manual,
    }
}

fn validation_to_str(v: ValidationStatus) -> &'static str {
    match v {
        ValidationStatus::Pass => "PASS",
        ValidationStatus::OutOfRange => "OUT_OF_RANGE",
        ValidationStatus::ChangeThresholdExceeded => "CHANGE_THRESHOLD_EXCEEDED",
        ValidationStatus::NoPrice => "NO_PRICE",
        ValidationStatus::NeedsReview => "NEEDS_REVIEW",
    }
}

fn validation_from_str(s: &str) -> ValidationStatus {
    match s {
        "PASS" => ValidationStatus::Pass,
        "OUT_OF_RANGE" => ValidationStatus::OutOfRange,
        "CHANGE_THRESHOLD_EXCEEDED" => ValidationStatus::ChangeThresholdExceeded,
        "NEEDS_REVIEW" => ValidationStatus::NeedsReview,
        _ => ValidationStatus::NoPrice,
    }
}

fn batch_status_to_str(s: BatchStatus) -> &'static str {
    match s {
        BatchStatus::Pending => "PENDING",
        BatchStatus::Running => "RUNNING",
        BatchStatus::Completed => "COMPLETED",
        BatchStatus::Failed => "FAILED",
    }
}

fn batch_status_from_str(s: &str) -> BatchStatus {
    match s {
        "RUNNING" => BatchStatus::Running,
        "COMPLETED" => BatchStatus::Completed,
        "FAILED" => BatchStatus::Failed,
        _ => BatchStatus::Pending,
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_machine(&self, id: &str) -> Result<Machine, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, product_url, previous_price, brand, category, variant_attributes, learned_selectors
             FROM machines WHERE id = ?1",
            params![id],
            row_to_machine,
        )
        .optional()?
        .ok_or_else(|| StoreError::MachineNotFound(id.to_string()))
    }

    async fn update_machine_price(&self, id: &str, price: Decimal, _at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE machines SET previous_price = ?1 WHERE id = ?2",
            params![price.to_string(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::MachineNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_machine_learned_selector(
        &self,
        machine_id: &str,
        domain: &str,
        selector: LearnedSelector,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let current: String = conn
            .query_row(
                "SELECT learned_selectors FROM machines WHERE id = ?1",
                params![machine_id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::MachineNotFound(machine_id.to_string()))?;

        let mut map: HashMap<String, LearnedSelector> = serde_json::from_str(&current).unwrap_or_default();
        map.insert(domain.to_string(), selector);

        conn.execute(
            "UPDATE machines SET learned_selectors = ?1 WHERE id = ?2",
            params![serde_json::to_string(&map)?, machine_id],
        )?;
        Ok(())
    }

    async fn append_price_history(&self, row: &PriceHistory) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO price_history
                (id, machine_id, price, currency, previous_price, tier_used, selector_or_path,
                 confidence, validation_status, batch_id, requires_approval, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                row.id.to_string(),
                row.machine_id,
                row.price.map(|p| p.to_string()),
                row.currency,
                row.previous_price.map(|p| p.to_string()),
                tier_to_str(row.tier_used),
                row.selector_or_path,
                row.confidence,
                validation_to_str(row.validation_status),
                row.batch_id.map(|b| b.to_string()),
                row.requires_approval as i64,
                row.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn get_price_history(&self, id: Uuid) -> Result<PriceHistory, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, machine_id, price, currency, previous_price, tier_used, selector_or_path,
                    confidence, validation_status, batch_id, requires_approval, created_at
             FROM price_history WHERE id = ?1",
            params![id.to_string()],
            row_to_price_history,
        )
        .optional()?
        .ok_or_else(|| StoreError::HistoryNotFound(id.to_string()))
    }

    async fn resolve_price_history_approval(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE price_history SET requires_approval = 0 WHERE id = ?1",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::HistoryNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn create_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO batches
                (id, status, created_at, started_at, finished_at, machine_ids,
                 success_count, failure_count, results, failure_reasons, llm_cost_usd)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                batch.id.to_string(),
                batch_status_to_str(batch.status),
                batch.created_at.to_rfc3339(),
                batch.started_at.map(|t| t.to_rfc3339()),
                batch.finished_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&batch.machine_ids)?,
                batch.success_count,
                batch.failure_count,
                serde_json::to_string(&batch.results)?,
                serde_json::to_string(&batch.failure_reasons)?,
                batch.llm_cost_usd.to_string(),
            ],
        )?;
        Ok(())
    }

    async fn update_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE batches SET status=?1, started_at=?2, finished_at=?3, success_count=?4,
                failure_count=?5, results=?6, failure_reasons=?7, llm_cost_usd=?8
             WHERE id = ?9",
            params![
                batch_status_to_str(batch.status),
                batch.started_at.map(|t| t.to_rfc3339()),
                batch.finished_at.map(|t| t.to_rfc3339()),
                batch.success_count,
                batch.failure_count,
                serde_json::to_string(&batch.results)?,
                serde_json::to_string(&batch.failure_reasons)?,
                batch.llm_cost_usd.to_string(),
                batch.id.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::BatchNotFound(batch.id.to_string()));
        }
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Batch, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, status, created_at, started_at, finished_at, machine_ids,
                    success_count, failure_count, results, failure_reasons, llm_cost_usd
             FROM batches WHERE id = ?1",
            params![id.to_string()],
            row_to_batch,
        )
        .optional()?
        .ok_or_else(|| StoreError::BatchNotFound(id.to_string()))
    }
}

fn row_to_price_history(row: &rusqlite::Row) -> rusqlite::Result<PriceHistory> {
    let id: String = row.get(0)?;
    let price: Option<String> = row.get(2)?;
    let previous_price: Option<String> = row.get(4)?;
    let tier_used: String = row.get(5)?;
    let validation_status: String = row.get(8)?;
    let batch_id: Option<String> = row.get(9)?;
    let created_at: String = row.get(11)?;

    Ok(PriceHistory {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        machine_id: row.get(1)?,
        price: price.and_then(|s| Decimal::from_str(&s).ok()),
        currency: row.get(3)?,
        previous_price: previous_price.and_then(|s| Decimal::from_str(&s).ok()),
        tier_used: tier_from_str(&tier_used),
        selector_or_path: row.get(6)?,
        confidence: row.get(7)?,
        validation_status: validation_from_str(&validation_status),
        batch_id: batch_id.and_then(|s| Uuid::parse_str(&s).ok()),
        requires_approval: row.get::<_, i64>(10)? != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_batch(row: &rusqlite::Row) -> rusqlite::Result<Batch> {
    let id: String = row.get(0)?;
    let status: String = row.get(1)?;
    let created_at: String = row.get(2)?;
    let started_at: Option<String> = row.get(3)?;
    let finished_at: Option<String> = row.get(4)?;
    let machine_ids: String = row.get(5)?;
    let results: String = row.get(8)?;
    let failure_reasons: String = row.get(9)?;
    let llm_cost_usd: String = row.get(10)?;

    Ok(Batch {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        status: batch_status_from_str(&status),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        started_at: started_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        finished_at: finished_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        machine_ids: serde_json::from_str(&machine_ids).unwrap_or_default(),
        success_count: row.get(6)?,
        failure_count: row.get(7)?,
        results: serde_json::from_str::<Vec<BatchResult>>(&results).unwrap_or_default(),
        failure_reasons: serde_json::from_str(&failure_reasons).unwrap_or_default(),
        llm_cost_usd: Decimal::from_str(&llm_cost_usd).unwrap_or(Decimal::ZERO),
    })
}
