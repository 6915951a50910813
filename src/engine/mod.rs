mod conflict;
mod error;
mod executor;
mod key;
mod planner;
mod snapshot;
#[cfg(test)]
mod tests;

pub use conflict::{ConflictDetector, ConflictResult};
pub use error::EngineError;
pub use executor::{BatchExecutor, ChunkOutcome, ChunkReport, ExecutionReport, FailedEntry};
pub use key::{DecodedKey, SlotKey, parse_date, validate_room_id};
pub use planner::{BoundPolicy, Conflict, MutationPlanner, Operation, PlanEntry, WriteAction, WritePlan};
pub use snapshot::{
    SNAPSHOT_CACHE_CONTROL, SNAPSHOT_CONTENT_TYPE, SnapshotArtifact, SnapshotBuilder, SnapshotDoc,
    SnapshotOutcome,
};

use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use tracing::{info, warn};
use ulid::Ulid;

use crate::blob::BlobStore;
use crate::clock::Clock;
use crate::limits::*;
use crate::model::*;
use crate::observability::BOOKINGS_TOTAL;
use crate::period;
use crate::store::{DocumentStore, SlotFilter, bounded};

/// Tunables for an [`Engine`]. `Default` matches the documented defaults.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound on entries per chunk; the store's own ceiling also applies.
    pub max_chunk: usize,
    pub chunk_retries: u32,
    pub retry_backoff: Duration,
    pub store_timeout: Duration,
    /// Offset that defines calendar days and wall-clock period times.
    pub day_offset: FixedOffset,
    pub snapshot_prefix: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_chunk: MAX_OPS_PER_TRANSACTION,
            chunk_retries: DEFAULT_CHUNK_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            day_offset: Utc.fix(),
            snapshot_prefix: "snapshots".into(),
        }
    }
}

/// Result of the booking workflow. A conflict is an expected outcome.
#[derive(Debug)]
pub enum BookingOutcome {
    Booked {
        reservation: Reservation,
        report: ExecutionReport,
    },
    Conflicted {
        conflicts: Vec<Conflict>,
    },
}

#[derive(Debug)]
pub enum TemplateOutcome {
    Created {
        template: RecurringTemplate,
        report: ExecutionReport,
    },
    Conflicted {
        conflicts: Vec<Conflict>,
    },
}

/// Caller-facing API over one shared store.
///
/// Planning never writes. `execute` applies a conflict-free plan in chunks.
/// The workflow methods (`book`, `cancel_reservation`, the template calls)
/// keep reservation and template documents in step with the slots they own.
pub struct Engine {
    store: Arc<dyn DocumentStore>,
    detector: Arc<ConflictDetector>,
    planner: MutationPlanner,
    executor: BatchExecutor,
    snapshots: SnapshotBuilder,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let timeout = settings.store_timeout;
        let detector = Arc::new(ConflictDetector::new(store.clone(), timeout));
        let planner = MutationPlanner::new(store.clone(), detector.clone(), timeout);
        let executor = BatchExecutor::new(
            store.clone(),
            settings.max_chunk,
            settings.chunk_retries,
            settings.retry_backoff,
            timeout,
        );
        let snapshots = SnapshotBuilder::new(
            store.clone(),
            blobs,
            clock.clone(),
            settings.day_offset,
            settings.snapshot_prefix.clone(),
            timeout,
        );
        Self { store, detector, planner, executor, snapshots, clock, settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// The month containing "now" at the configured day offset.
    pub fn current_month(&self) -> MonthId {
        MonthId::containing(self.clock.now(), self.settings.day_offset)
    }

    // ── Queries ──────────────────────────────────────────

    pub async fn check_conflict(
        &self,
        room_id: &str,
        date: &str,
        periods: &str,
    ) -> Result<ConflictResult, EngineError> {
        self.detector.check_conflict(room_id, date, periods).await
    }

    pub async fn check_conflicts(
        &self,
        room_ids: &[&str],
        date: &str,
        periods: &str,
    ) -> Result<ConflictResult, EngineError> {
        self.detector.check_conflicts(room_ids, date, periods).await
    }

    // ── Planning ─────────────────────────────────────────

    pub async fn plan(&self, op: &Operation) -> Result<WritePlan, EngineError> {
        self.planner.plan(op).await
    }

    pub async fn plan_booking(
        &self,
        room_id: &str,
        date: &str,
        periods: &str,
        reservation_id: Ulid,
    ) -> Result<WritePlan, EngineError> {
        let op = Operation::BookSingle {
            room_id: room_id.to_string(),
            date: parse_date(date)?,
            periods: period::expand(periods)?,
            reservation_id,
        };
        self.planner.plan(&op).await
    }

    pub async fn plan_template_instantiation(
        &self,
        template: &RecurringTemplate,
        bound_policy: BoundPolicy,
    ) -> Result<WritePlan, EngineError> {
        self.planner.plan(&Operation::instantiate(template, bound_policy)).await
    }

    pub async fn plan_cancellation(&self, reservation_id: Ulid) -> Result<WritePlan, EngineError> {
        self.planner.plan(&Operation::CancelReservation { reservation_id }).await
    }

    pub async fn plan_template_retirement(&self, template_id: Ulid) -> Result<WritePlan, EngineError> {
        self.planner.plan(&Operation::RetireTemplate { template_id }).await
    }

    pub async fn plan_template_trim(
        &self,
        template_id: Ulid,
        keep_through: NaiveDate,
    ) -> Result<WritePlan, EngineError> {
        self.planner.plan(&Operation::TrimTemplate { template_id, keep_through }).await
    }

    pub async fn plan_purge(&self, filter: SlotFilter) -> Result<WritePlan, EngineError> {
        self.planner.plan(&Operation::PurgeByFilter { filter }).await
    }

    // ── Execution ────────────────────────────────────────

    /// Apply a plan. Refuses plans that still carry conflicts; partial chunk
    /// failure is reported in the returned value.
    pub async fn execute(&self, plan: &WritePlan) -> Result<ExecutionReport, EngineError> {
        if plan.has_conflicts() {
            return Err(EngineError::PlanHasConflicts(plan.conflicts.len()));
        }
        Ok(self.executor.apply(plan).await)
    }

    pub async fn build_monthly_snapshot(&self, month: MonthId) -> Result<SnapshotOutcome, EngineError> {
        self.snapshots.build(month).await
    }

    /// Month reservations from the cached artifact, or from the store when
    /// no artifact has been built yet.
    pub async fn month_reservations(&self, month: MonthId) -> Result<Vec<Reservation>, EngineError> {
        let docs = match self.snapshots.load(month).await? {
            Some(artifact) => artifact.docs,
            None => self.snapshots.collect(month).await?,
        };
        Ok(docs.into_iter().map(Reservation::from).collect())
    }

    // ── Workflows ────────────────────────────────────────

    pub async fn register_room(&self, room: Room) -> Result<(), EngineError> {
        validate_room_id(&room.id)?;
        check_len(&room.name, MAX_ROOM_NAME_LEN, "room name too long")?;
        bounded(self.settings.store_timeout, self.store.put_room(room.clone())).await?;
        info!("registered room {} ({})", room.id, room.name);
        Ok(())
    }

    /// Book `req.periods` of one room on one date.
    ///
    /// The reservation document is written before its slots. If the slot
    /// commit loses a race or fails, the document and any committed slots
    /// are removed again.
    pub async fn book(&self, req: NewReservation) -> Result<BookingOutcome, EngineError> {
        check_len(&req.title, MAX_TITLE_LEN, "title too long")?;
        check_len(&req.name, MAX_TITLE_LEN, "name too long")?;
        check_len(&req.created_by, MAX_CREATOR_LEN, "creator too long")?;
        let reservation = Reservation::from_request(req, self.settings.day_offset, self.clock.now())?;
        let occupant = Occupant::Reservation(reservation.id);

        let plan = self
            .planner
            .plan(&Operation::BookSingle {
                room_id: reservation.room_id.clone(),
                date: reservation.date,
                periods: reservation.periods.clone(),
                reservation_id: reservation.id,
            })
            .await?;
        if plan.has_conflicts() {
            metrics::counter!(BOOKINGS_TOTAL, "outcome" => "conflicted").increment(1);
            return Ok(BookingOutcome::Conflicted { conflicts: plan.conflicts });
        }

        let timeout = self.settings.store_timeout;
        bounded(timeout, self.store.put_reservation(reservation.clone())).await?;
        let report = self.executor.apply(&plan).await;
        if !report.is_complete() {
            self.release(occupant).await;
            bounded(timeout, self.store.delete_reservation(reservation.id)).await?;
            let lost: Vec<Conflict> = self.conflicts_for(&plan, occupant).await?;
            if !lost.is_empty() {
                metrics::counter!(BOOKINGS_TOTAL, "outcome" => "conflicted").increment(1);
                warn!("booking {} lost a race on {} slots", reservation.id, lost.len());
                return Ok(BookingOutcome::Conflicted { conflicts: lost });
            }
            return Err(EngineError::PartialBatchFailure { failed_entries: report.failed_entries });
        }

        metrics::counter!(BOOKINGS_TOTAL, "outcome" => "booked").increment(1);
        info!(
            "booked {} for room {} on {} periods {}",
            reservation.id,
            reservation.room_id,
            reservation.date,
            period::join(&reservation.periods)
        );
        Ok(BookingOutcome::Booked { reservation, report })
    }

    /// Delete a reservation's slots, then the reservation itself.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<ExecutionReport, EngineError> {
        let timeout = self.settings.store_timeout;
        if bounded(timeout, self.store.get_reservation(id)).await?.is_none() {
            return Err(EngineError::NotFound(id));
        }
        let plan = self.plan_cancellation(id).await?;
        let report = self.executor.apply(&plan).await.ensure_complete()?;
        bounded(timeout, self.store.delete_reservation(id)).await?;
        info!("cancelled reservation {id}: {} slots released", report.total_applied);
        Ok(report)
    }

    /// Store a template and lock every slot it covers.
    pub async fn create_template(
        &self,
        req: NewTemplate,
        bound_policy: BoundPolicy,
    ) -> Result<TemplateOutcome, EngineError> {
        check_len(&req.created_by, MAX_CREATOR_LEN, "creator too long")?;
        let template = RecurringTemplate::from_request(req, self.clock.now())?;
        let plan = self.plan_template_instantiation(&template, bound_policy).await?;
        if plan.has_conflicts() {
            return Ok(TemplateOutcome::Conflicted { conflicts: plan.conflicts });
        }

        let timeout = self.settings.store_timeout;
        bounded(timeout, self.store.put_template(template.clone())).await?;
        let report = self.executor.apply(&plan).await;
        if !report.is_complete() {
            let occupant = Occupant::TemplateLock(template.id);
            self.release(occupant).await;
            bounded(timeout, self.store.delete_template(template.id)).await?;
            let lost = self.conflicts_for(&plan, occupant).await?;
            if !lost.is_empty() {
                return Ok(TemplateOutcome::Conflicted { conflicts: lost });
            }
            return Err(EngineError::PartialBatchFailure { failed_entries: report.failed_entries });
        }

        info!(
            "created template {} for room {}: {} slots locked",
            template.id, template.room_id, report.total_applied
        );
        Ok(TemplateOutcome::Created { template, report })
    }

    /// Delete every slot a template generated, then the template.
    pub async fn retire_template(&self, id: Ulid) -> Result<ExecutionReport, EngineError> {
        let timeout = self.settings.store_timeout;
        if bounded(timeout, self.store.get_template(id)).await?.is_none() {
            return Err(EngineError::NotFound(id));
        }
        let plan = self.plan_template_retirement(id).await?;
        let report = self.executor.apply(&plan).await.ensure_complete()?;
        bounded(timeout, self.store.delete_template(id)).await?;
        info!("retired template {id}: {} slots released", report.total_applied);
        Ok(report)
    }

    /// Shrink a template's range to end at `keep_through`, releasing the
    /// slots past it.
    pub async fn trim_template(&self, id: Ulid, keep_through: NaiveDate) -> Result<ExecutionReport, EngineError> {
        let timeout = self.settings.store_timeout;
        let Some(mut template) = bounded(timeout, self.store.get_template(id)).await? else {
            return Err(EngineError::NotFound(id));
        };
        if keep_through < template.range.start {
            return Err(EngineError::Validation(format!(
                "cannot trim template {id} before its start {}; retire it instead",
                template.range.start
            )));
        }
        let plan = self.plan_template_trim(id, keep_through).await?;
        let report = self.executor.apply(&plan).await.ensure_complete()?;
        if keep_through < template.range.end {
            template.range.end = keep_through;
            bounded(timeout, self.store.put_template(template)).await?;
        }
        info!("trimmed template {id} through {keep_through}: {} slots released", report.total_applied);
        Ok(report)
    }

    /// Best-effort removal of every slot held by `occupant`.
    async fn release(&self, occupant: Occupant) {
        let op = match occupant {
            Occupant::Reservation(reservation_id) => Operation::CancelReservation { reservation_id },
            Occupant::TemplateLock(template_id) => Operation::RetireTemplate { template_id },
        };
        match self.planner.plan(&op).await {
            Ok(plan) => {
                let report = self.executor.apply(&plan).await;
                if !report.is_complete() {
                    warn!("rollback of {occupant} left {} slots behind", report.total_failed);
                }
            }
            Err(e) => warn!("rollback of {occupant} could not be planned: {e}"),
        }
    }

    /// Slots of `plan` now held by someone other than `occupant`.
    async fn conflicts_for(&self, plan: &WritePlan, occupant: Occupant) -> Result<Vec<Conflict>, EngineError> {
        let keys: Vec<SlotKey> = plan.entries.iter().map(|e| e.key.clone()).collect();
        Ok(self
            .detector
            .occupied(&keys)
            .await?
            .into_iter()
            .filter(|existing| existing.occupant != occupant)
            .map(|existing| Conflict { existing, requested_by: occupant })
            .collect())
    }
}

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}
