//! The persistence contract (§6.3): a small set of operations any
//! backend can satisfy. `sqlite` is the concrete backend shipped here;
//! the orchestrator and batch layer depend only on the [`Store`] trait.

pub mod sqlite;

use crate::error::StoreError;
use crate::model::{Batch, LearnedSelector, Machine, PriceHistory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

pub use sqlite::SqliteStore;

/// Everything the extraction core needs from a persistent store. Reads
/// within a request see a consistent snapshot; writes to a single row
/// are atomic — both are satisfied here by serializing access to one
/// `rusqlite::Connection` behind a lock, which is enough for this
/// workload's write volume.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_machine(&self, id: &str) -> Result<Machine, StoreError>;

    /// Only called when `VALIDATE` accepted the price outright (`PASS`
    /// and not `requires_approval`), or when an approval operation
    /// commits a previously-held price.
    async fn update_machine_price(&self, id: &str, price: Decimal, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Read-modify-write of one (machine, domain) learned-selector
    /// entry. The invariant that at most one entry exists per pair is
    /// enforced by this call overwriting whatever was there.
    async fn update_machine_learned_selector(
        &self,
        machine_id: &str,
        domain: &str,
        selector: LearnedSelector,
    ) -> Result<(), StoreError>;

    async fn append_price_history(&self, row: &PriceHistory) -> Result<(), StoreError>;
    async fn get_price_history(&self, id: Uuid) -> Result<PriceHistory, StoreError>;
    /// Flip `requires_approval` to false after an operator decision.
    async fn resolve_price_history_approval(&self, id: Uuid) -> Result<(), StoreError>;

    async fn create_batch(&self, batch: &Batch) -> Result<(), StoreError>;
    async fn update_batch(&self, batch: &Batch) -> Result<(), StoreError>;
    async fn get_batch(&self, id: Uuid) -> Result<Batch, StoreError>;
}
