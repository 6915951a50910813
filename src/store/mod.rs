mod memory;

pub use memory::MemoryStore;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use ulid::Ulid;

use crate::engine::SlotKey;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("slot {key} already occupied by {existing}")]
    AlreadyOccupied { key: SlotKey, existing: Occupant },
    #[error("transaction of {ops} operations exceeds the limit of {max}")]
    TransactionTooLarge { ops: usize, max: usize },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out")]
    Timeout,
    #[error("durability error: {0}")]
    Durability(String),
}

impl StoreError {
    /// Whether repeating the same call may succeed. Chunk writes are keyed by
    /// deterministic slot keys, so retrying a transient failure is safe.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Timeout | StoreError::Durability(_)
        )
    }
}

/// Equality/range predicate for slot scans. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotFilter {
    pub room_id: Option<String>,
    pub kind: Option<SlotKind>,
    pub occupant: Option<Occupant>,
    /// Inclusive lower date bound.
    pub date_from: Option<NaiveDate>,
    /// Inclusive upper date bound.
    pub date_to: Option<NaiveDate>,
}

impl SlotFilter {
    pub fn occupied_by(occupant: Occupant) -> Self {
        Self { occupant: Some(occupant), ..Self::default() }
    }

    pub fn matches(&self, slot: &Slot) -> bool {
        self.room_id.as_ref().is_none_or(|r| *r == slot.room_id)
            && self.kind.is_none_or(|k| k == slot.kind())
            && self.occupant.is_none_or(|o| o == slot.occupant)
            && self.date_from.is_none_or(|d| slot.date >= d)
            && self.date_to.is_none_or(|d| slot.date <= d)
    }
}

/// One operation inside an atomic transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Conditional create: fails the transaction if a different occupant holds the key.
    Put(Slot),
    /// Remove `key` only if it is still held by `expected`.
    Delete { key: SlotKey, expected: Occupant },
}

impl TxnOp {
    pub fn key(&self) -> &SlotKey {
        match self {
            TxnOp::Put(slot) => &slot.key,
            TxnOp::Delete { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Operations that changed state.
    pub applied: usize,
    /// Operations that were already satisfied (idempotent re-apply, missing delete).
    pub unchanged: usize,
}

/// Decision function for a snapshot-metadata read-modify-write.
/// Returning `Some` writes the new record inside the same transaction.
pub type MetaDecision = Box<dyn FnOnce(Option<SnapshotMeta>) -> Option<SnapshotMeta> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaUpdate {
    pub previous: Option<SnapshotMeta>,
    pub written: Option<SnapshotMeta>,
}

/// Document store collaborator: keyed collections for rooms, slots,
/// reservations, templates and snapshot metadata, with bounded atomic
/// transactions over slots.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Hard ceiling on operations in one `commit`.
    fn max_ops_per_transaction(&self) -> usize;

    async fn put_room(&self, room: Room) -> Result<(), StoreError>;
    async fn get_room(&self, id: &str) -> Result<Option<Room>, StoreError>;

    async fn get_slot(&self, key: &SlotKey) -> Result<Option<Slot>, StoreError>;

    async fn slot_exists(&self, key: &SlotKey) -> Result<bool, StoreError> {
        Ok(self.get_slot(key).await?.is_some())
    }

    /// Single atomic conditional create. Re-putting the identical occupant
    /// is a successful no-op (`Ok(false)`); a different occupant fails with
    /// `AlreadyOccupied`.
    async fn put_slot(&self, slot: Slot) -> Result<bool, StoreError>;

    async fn delete_slot(&self, key: &SlotKey) -> Result<Option<Slot>, StoreError>;

    /// Slots matching `filter`, ordered by key.
    async fn query_slots(&self, filter: &SlotFilter) -> Result<Vec<Slot>, StoreError>;

    async fn query_by_room_and_kind(
        &self,
        room_id: &str,
        kind: SlotKind,
    ) -> Result<Vec<Slot>, StoreError> {
        self.query_slots(&SlotFilter {
            room_id: Some(room_id.to_string()),
            kind: Some(kind),
            ..SlotFilter::default()
        })
        .await
    }

    async fn query_by_date(&self, date: NaiveDate) -> Result<Vec<Slot>, StoreError> {
        self.query_slots(&SlotFilter {
            date_from: Some(date),
            date_to: Some(date),
            ..SlotFilter::default()
        })
        .await
    }

    async fn query_by_date_and_kind(
        &self,
        date: NaiveDate,
        kind: SlotKind,
    ) -> Result<Vec<Slot>, StoreError> {
        self.query_slots(&SlotFilter {
            kind: Some(kind),
            date_from: Some(date),
            date_to: Some(date),
            ..SlotFilter::default()
        })
        .await
    }

    /// Apply `ops` as one atomic unit: either all take effect or none do.
    async fn commit(&self, ops: &[TxnOp]) -> Result<CommitSummary, StoreError>;

    async fn put_reservation(&self, reservation: Reservation) -> Result<(), StoreError>;
    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;
    async fn delete_reservation(&self, id: Ulid) -> Result<bool, StoreError>;

    /// Reservations with `from <= start <= to`, ordered by start ascending.
    async fn query_reservations_by_start(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError>;

    async fn put_template(&self, template: RecurringTemplate) -> Result<(), StoreError>;
    async fn get_template(&self, id: Ulid) -> Result<Option<RecurringTemplate>, StoreError>;
    async fn delete_template(&self, id: Ulid) -> Result<bool, StoreError>;

    async fn get_snapshot_meta(&self, month: MonthId) -> Result<Option<SnapshotMeta>, StoreError>;

    /// Transactional read-modify-write of one month's snapshot metadata.
    async fn update_snapshot_meta(
        &self,
        month: MonthId,
        decide: MetaDecision,
    ) -> Result<MetaUpdate, StoreError>;
}

/// Run a store call under a caller-imposed deadline.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::Period;

    fn slot(room: &str, date: &str, occupant: Occupant) -> Slot {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap();
        Slot::new(room, date, Period::First, occupant)
    }

    #[test]
    fn filter_default_matches_everything() {
        let s = slot("R1", "2025-08-01", Occupant::Reservation(Ulid::new()));
        assert!(SlotFilter::default().matches(&s));
    }

    #[test]
    fn filter_combines_fields() {
        let tid = Ulid::new();
        let s = slot("R1", "2025-08-10", Occupant::TemplateLock(tid));
        let f = SlotFilter {
            room_id: Some("R1".into()),
            kind: Some(SlotKind::TemplateLock),
            date_from: Some(NaiveDate::from_ymd_opt(2025, 8, 10).unwrap()),
            date_to: Some(NaiveDate::from_ymd_opt(2025, 8, 31).unwrap()),
            ..SlotFilter::default()
        };
        assert!(f.matches(&s));
        assert!(SlotFilter::occupied_by(Occupant::TemplateLock(tid)).matches(&s));
        assert!(!SlotFilter::occupied_by(Occupant::Reservation(tid)).matches(&s));
        assert!(!SlotFilter { room_id: Some("R2".into()), ..f.clone() }.matches(&s));
        assert!(!SlotFilter { date_from: Some(NaiveDate::from_ymd_opt(2025, 8, 11).unwrap()), ..f }.matches(&s));
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::Timeout.is_transient());
        assert!(StoreError::Unavailable("x".into()).is_transient());
        assert!(!StoreError::TransactionTooLarge { ops: 2, max: 1 }.is_transient());
    }

    #[tokio::test]
    async fn bounded_times_out() {
        let result: Result<(), StoreError> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(StoreError::Timeout));
    }
}
