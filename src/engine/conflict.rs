use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::{StreamExt, TryStreamExt, stream};

use crate::model::Slot;
use crate::period::{self, Period};
use crate::store::{DocumentStore, bounded};

use super::key::{parse_date, validate_room_id};
use super::{EngineError, SlotKey};

/// Concurrent point lookups per check.
const LOOKUP_CONCURRENCY: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictResult {
    pub has_conflict: bool,
    pub conflicting_slots: Vec<SlotKey>,
    /// The existing slots behind `conflicting_slots`, same order.
    pub occupants: Vec<Slot>,
}

impl ConflictResult {
    fn from_occupied(occupants: Vec<Slot>) -> Self {
        Self {
            has_conflict: !occupants.is_empty(),
            conflicting_slots: occupants.iter().map(|s| s.key.clone()).collect(),
            occupants,
        }
    }
}

/// Read-only occupancy checks against the slot store.
pub struct ConflictDetector {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl ConflictDetector {
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Is each period of `periods` (e.g. `"1-3"`, `"1,lunch"`) free for
    /// `room_id` on `date`? Every expanded period is checked individually.
    pub async fn check_conflict(
        &self,
        room_id: &str,
        date: &str,
        periods: &str,
    ) -> Result<ConflictResult, EngineError> {
        self.check_conflicts(&[room_id], date, periods).await
    }

    /// Same as [`check_conflict`](Self::check_conflict) across several rooms.
    /// An empty room list has no conflicts.
    pub async fn check_conflicts(
        &self,
        room_ids: &[&str],
        date: &str,
        periods: &str,
    ) -> Result<ConflictResult, EngineError> {
        let date = parse_date(date)?;
        let periods = period::expand(periods)?;
        let mut keys = Vec::with_capacity(room_ids.len() * periods.len());
        for room in room_ids {
            validate_room_id(room)?;
            keys.extend(cells(room, date, &periods));
        }
        let occupied = self.occupied(&keys).await?;
        Ok(ConflictResult::from_occupied(occupied))
    }

    /// Existing slots among `keys`, in the order of `keys`.
    pub(crate) async fn occupied(&self, keys: &[SlotKey]) -> Result<Vec<Slot>, EngineError> {
        let lookups: Vec<_> = keys
            .iter()
            .map(|key| bounded(self.timeout, self.store.get_slot(key)))
            .collect();
        let found: Vec<Option<Slot>> = stream::iter(lookups)
            .buffered(LOOKUP_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(found.into_iter().flatten().collect())
    }
}

fn cells<'a>(room_id: &'a str, date: NaiveDate, periods: &'a [Period]) -> impl Iterator<Item = SlotKey> + 'a {
    periods.iter().map(move |p| SlotKey::new(room_id, date, *p))
}
