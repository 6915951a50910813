use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::blob::BlobError;
use crate::model::{MonthId, Occupant};
use crate::store::StoreError;

use super::executor::FailedEntry;
use super::SlotKey;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input; a caller bug, never retried.
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown room: {0}")]
    UnknownRoom(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("date {requested} is past the allowed bound {bound}")]
    DateBoundExceeded { requested: NaiveDate, bound: NaiveDate },
    #[error("slot {key} already occupied by {occupant}")]
    AlreadyOccupied { key: SlotKey, occupant: Occupant },
    #[error("plan carries {0} unresolved conflicts")]
    PlanHasConflicts(usize),
    #[error("{} plan entries failed to apply", failed_entries.len())]
    PartialBatchFailure { failed_entries: Vec<FailedEntry> },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// The snapshot guard claim timed out; whether it landed is unknown.
    #[error("snapshot guard for {0} has unknown outcome; do not retry today")]
    SnapshotGuardUnknown(MonthId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}
