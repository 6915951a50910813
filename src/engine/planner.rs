use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Weekday};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::period::Period;
use crate::store::{DocumentStore, SlotFilter, bounded};

use super::conflict::ConflictDetector;
use super::key::validate_room_id;
use super::{EngineError, SlotKey};

/// How to treat template dates past the template's maximum-date bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BoundPolicy {
    /// Fail planning with `DateBoundExceeded`.
    #[default]
    Reject,
    /// Truncate the range at the bound.
    Clamp,
    /// Instantiate past the bound on purpose.
    Override,
}

/// A requested mutation, before expansion into slot writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    BookSingle {
        room_id: String,
        date: NaiveDate,
        periods: Vec<Period>,
        reservation_id: Ulid,
    },
    InstantiateTemplate {
        template_id: Ulid,
        room_id: String,
        periods: Vec<Period>,
        range: DateRange,
        weekdays: Vec<Weekday>,
        max_date: Option<NaiveDate>,
        bound_policy: BoundPolicy,
    },
    CancelReservation {
        reservation_id: Ulid,
    },
    RetireTemplate {
        template_id: Ulid,
    },
    /// Drop a template's slots dated after `keep_through`.
    TrimTemplate {
        template_id: Ulid,
        keep_through: NaiveDate,
    },
    PurgeByFilter {
        filter: SlotFilter,
    },
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::BookSingle { .. } => "book_single",
            Operation::InstantiateTemplate { .. } => "instantiate_template",
            Operation::CancelReservation { .. } => "cancel_reservation",
            Operation::RetireTemplate { .. } => "retire_template",
            Operation::TrimTemplate { .. } => "trim_template",
            Operation::PurgeByFilter { .. } => "purge_by_filter",
        }
    }

    /// Expansion of a stored template with the given bound policy.
    pub fn instantiate(template: &RecurringTemplate, bound_policy: BoundPolicy) -> Self {
        Operation::InstantiateTemplate {
            template_id: template.id,
            room_id: template.room_id.clone(),
            periods: template.periods.clone(),
            range: template.range,
            weekdays: template.weekdays.clone(),
            max_date: template.max_date,
            bound_policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Create,
    Delete,
}

impl fmt::Display for WriteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteAction::Create => f.write_str("create"),
            WriteAction::Delete => f.write_str("delete"),
        }
    }
}

/// One slot-level write. For deletes, `payload` is the slot that was matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub key: SlotKey,
    pub action: WriteAction,
    pub payload: Slot,
}

/// A requested cell that is already held by someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// The slot as it exists in the store.
    pub existing: Slot,
    pub requested_by: Occupant,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): requested by {}",
            self.existing.key, self.existing, self.requested_by
        )
    }
}

/// Ordered slot writes, or the conflicts that prevented planning them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    pub operation: &'static str,
    pub entries: Vec<PlanEntry>,
    pub conflicts: Vec<Conflict>,
}

impl WritePlan {
    fn empty(operation: &'static str) -> Self {
        Self { operation, entries: Vec::new(), conflicts: Vec::new() }
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Expands operations into write plans. Never writes.
pub struct MutationPlanner {
    store: Arc<dyn DocumentStore>,
    detector: Arc<ConflictDetector>,
    timeout: Duration,
}

impl MutationPlanner {
    pub fn new(store: Arc<dyn DocumentStore>, detector: Arc<ConflictDetector>, timeout: Duration) -> Self {
        Self { store, detector, timeout }
    }

    pub async fn plan(&self, op: &Operation) -> Result<WritePlan, EngineError> {
        let label = op.label();
        let plan = match op {
            Operation::BookSingle { room_id, date, periods, reservation_id } => {
                let cells = periods.iter().map(|p| (*date, *p)).collect();
                self.plan_creates(label, room_id, cells, Occupant::Reservation(*reservation_id))
                    .await?
            }
            Operation::InstantiateTemplate {
                template_id,
                room_id,
                periods,
                range,
                weekdays,
                max_date,
                bound_policy,
            } => {
                let range = apply_bound(*range, *max_date, *bound_policy)?;
                if range.len_days() > MAX_TEMPLATE_DAYS {
                    return Err(EngineError::LimitExceeded("template range too long"));
                }
                let cells = range
                    .days()
                    .filter(|d| weekdays.is_empty() || weekdays.contains(&d.weekday()))
                    .flat_map(|d| periods.iter().map(move |p| (d, *p)))
                    .collect();
                self.plan_creates(label, room_id, cells, Occupant::TemplateLock(*template_id))
                    .await?
            }
            Operation::CancelReservation { reservation_id } => {
                let filter = SlotFilter::occupied_by(Occupant::Reservation(*reservation_id));
                self.plan_deletes(label, &filter).await?
            }
            Operation::RetireTemplate { template_id } => {
                let filter = SlotFilter::occupied_by(Occupant::TemplateLock(*template_id));
                self.plan_deletes(label, &filter).await?
            }
            Operation::TrimTemplate { template_id, keep_through } => {
                let Some(first_dropped) = keep_through.succ_opt() else {
                    return Ok(WritePlan::empty(label));
                };
                let filter = SlotFilter {
                    date_from: Some(first_dropped),
                    ..SlotFilter::occupied_by(Occupant::TemplateLock(*template_id))
                };
                self.plan_deletes(label, &filter).await?
            }
            Operation::PurgeByFilter { filter } => {
                validate_filter(filter)?;
                self.plan_deletes(label, filter).await?
            }
        };

        let outcome = if plan.has_conflicts() { "conflict" } else { "ok" };
        metrics::counter!(
            crate::observability::PLANS_TOTAL,
            "operation" => label,
            "outcome" => outcome
        )
        .increment(1);
        Ok(plan)
    }

    async fn plan_creates(
        &self,
        label: &'static str,
        room_id: &str,
        cells: Vec<(NaiveDate, Period)>,
        occupant: Occupant,
    ) -> Result<WritePlan, EngineError> {
        validate_room_id(room_id)?;
        if cells.is_empty() {
            return Err(EngineError::Validation("operation covers no slots".into()));
        }
        if cells.len() > MAX_PLAN_ENTRIES {
            return Err(EngineError::LimitExceeded("plan too large"));
        }
        if bounded(self.timeout, self.store.get_room(room_id)).await?.is_none() {
            return Err(EngineError::UnknownRoom(room_id.to_string()));
        }

        let slots: Vec<Slot> = cells
            .into_iter()
            .map(|(date, period)| Slot::new(room_id, date, period, occupant))
            .collect();
        let keys: Vec<SlotKey> = slots.iter().map(|s| s.key.clone()).collect();

        // The same occupant re-requesting its own slot is a retry, not a conflict.
        let conflicts: Vec<Conflict> = self
            .detector
            .occupied(&keys)
            .await?
            .into_iter()
            .filter(|existing| existing.occupant != occupant)
            .map(|existing| Conflict { existing, requested_by: occupant })
            .collect();

        if !conflicts.is_empty() {
            warn!(
                "{label} for {occupant} in room {room_id}: {} of {} slots taken",
                conflicts.len(),
                slots.len()
            );
            return Ok(WritePlan { operation: label, entries: Vec::new(), conflicts });
        }

        let entries: Vec<PlanEntry> = slots
            .into_iter()
            .map(|slot| PlanEntry { key: slot.key.clone(), action: WriteAction::Create, payload: slot })
            .collect();
        info!("{label} for {occupant} in room {room_id}: {} creates planned", entries.len());
        Ok(WritePlan { operation: label, entries, conflicts: Vec::new() })
    }

    async fn plan_deletes(&self, label: &'static str, filter: &SlotFilter) -> Result<WritePlan, EngineError> {
        let matched = bounded(self.timeout, self.store.query_slots(filter)).await?;
        if matched.len() > MAX_PLAN_ENTRIES {
            return Err(EngineError::LimitExceeded("plan too large"));
        }
        let entries: Vec<PlanEntry> = matched
            .into_iter()
            .map(|slot| PlanEntry { key: slot.key.clone(), action: WriteAction::Delete, payload: slot })
            .collect();
        info!("{label}: {} deletes planned", entries.len());
        Ok(WritePlan { operation: label, entries, conflicts: Vec::new() })
    }
}

fn apply_bound(
    range: DateRange,
    bound: Option<NaiveDate>,
    policy: BoundPolicy,
) -> Result<DateRange, EngineError> {
    let Some(bound) = bound else {
        return Ok(range);
    };
    if range.end <= bound {
        return Ok(range);
    }
    match policy {
        BoundPolicy::Reject => Err(EngineError::DateBoundExceeded { requested: range.end, bound }),
        BoundPolicy::Clamp if range.start > bound => {
            Err(EngineError::DateBoundExceeded { requested: range.start, bound })
        }
        BoundPolicy::Clamp => DateRange::new(range.start, bound),
        BoundPolicy::Override => {
            warn!("instantiating through {} past the bound {bound} by override", range.end);
            Ok(range)
        }
    }
}

fn validate_filter(filter: &SlotFilter) -> Result<(), EngineError> {
    if let Some(room) = &filter.room_id {
        validate_room_id(room)?;
    }
    if let (Some(from), Some(to)) = (filter.date_from, filter.date_to)
        && from > to
    {
        return Err(EngineError::Validation(format!("purge range starts after it ends: {from}..{to}")));
    }
    Ok(())
}
