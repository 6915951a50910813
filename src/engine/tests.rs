use super::*;
use crate::blob::MemoryBlobStore;
use crate::clock::ManualClock;
use crate::period::Period;
use crate::store::{CommitSummary, MemoryStore, MetaDecision, MetaUpdate, StoreError, TxnOp};

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc, Weekday};

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

fn fast_settings() -> EngineSettings {
    EngineSettings {
        chunk_retries: 2,
        retry_backoff: Duration::from_millis(1),
        store_timeout: Duration::from_secs(2),
        ..EngineSettings::default()
    }
}

struct Harness {
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
    blobs: Arc<MemoryBlobStore>,
    clock: Arc<ManualClock>,
}

async fn harness() -> Harness {
    harness_with(fast_settings()).await
}

async fn harness_with(settings: EngineSettings) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let clock = Arc::new(ManualClock::new(at(2025, 8, 1, 0)));
    let engine = Arc::new(Engine::new(store.clone(), blobs.clone(), clock.clone(), settings));
    for id in ["R101", "R102"] {
        engine
            .register_room(Room { id: id.into(), name: format!("Room {id}"), capacity: 30 })
            .await
            .unwrap();
    }
    Harness { engine, store, blobs, clock }
}

fn booking(room: &str, date: NaiveDate, periods: &str) -> NewReservation {
    NewReservation {
        id: Ulid::new(),
        room_id: room.into(),
        date,
        periods: period::expand(periods).unwrap(),
        title: "Biology".into(),
        name: "Dissection".into(),
        created_by: "lee@example.com".into(),
    }
}

fn template(room: &str, start: NaiveDate, end: NaiveDate, periods: &str) -> NewTemplate {
    NewTemplate {
        id: Ulid::new(),
        room_id: room.into(),
        periods: period::expand(periods).unwrap(),
        range: DateRange::new(start, end).unwrap(),
        weekdays: vec![],
        max_date: None,
        created_by: "admin".into(),
    }
}

fn booked(outcome: BookingOutcome) -> Reservation {
    match outcome {
        BookingOutcome::Booked { reservation, .. } => reservation,
        BookingOutcome::Conflicted { conflicts } => panic!("unexpected conflicts: {conflicts:?}"),
    }
}

fn created(outcome: TemplateOutcome) -> (RecurringTemplate, ExecutionReport) {
    match outcome {
        TemplateOutcome::Created { template, report } => (template, report),
        TemplateOutcome::Conflicted { conflicts } => panic!("unexpected conflicts: {conflicts:?}"),
    }
}

// ── Conflict detection ───────────────────────────────────

#[tokio::test]
async fn booking_makes_slot_conflict() {
    let h = harness().await;
    let d = day(2025, 8, 27);
    assert!(!h.engine.check_conflict("R101", "2025-08-27", "2").await.unwrap().has_conflict);
    booked(h.engine.book(booking("R101", d, "2")).await.unwrap());
    let result = h.engine.check_conflict("R101", "2025-08-27", "2").await.unwrap();
    assert!(result.has_conflict);
    assert_eq!(result.conflicting_slots, vec![SlotKey::encode("R101", "2025-08-27", "2").unwrap()]);
}

#[tokio::test]
async fn range_reports_exactly_the_taken_periods() {
    let h = harness().await;
    let d = day(2025, 8, 27);
    booked(h.engine.book(booking("R101", d, "1")).await.unwrap());
    booked(h.engine.book(booking("R101", d, "3")).await.unwrap());
    let result = h.engine.check_conflict("R101", "2025-08-27", "1-3").await.unwrap();
    let periods: Vec<Period> = result.occupants.iter().map(|s| s.period).collect();
    assert_eq!(periods, vec![Period::First, Period::Third]);
}

#[tokio::test]
async fn template_locks_conflict_like_reservations() {
    let h = harness().await;
    created(
        h.engine
            .create_template(template("R101", day(2025, 9, 1), day(2025, 9, 3), "lunch"), BoundPolicy::Reject)
            .await
            .unwrap(),
    );
    let result = h.engine.check_conflict("R101", "2025-09-02", "4-5").await.unwrap();
    assert_eq!(result.occupants.len(), 1);
    assert_eq!(result.occupants[0].kind(), SlotKind::TemplateLock);

    let outcome = h.engine.book(booking("R101", day(2025, 9, 2), "lunch")).await.unwrap();
    assert!(matches!(outcome, BookingOutcome::Conflicted { conflicts } if conflicts.len() == 1));
    assert_eq!(h.store.reservation_count(), 0);
}

// ── Booking workflow ─────────────────────────────────────

#[tokio::test]
async fn concurrent_bookings_have_one_winner() {
    let h = harness().await;
    let d = day(2025, 8, 27);
    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move { engine.book(booking("R101", d, "2")).await }));
    }

    let mut winners = 0;
    let mut losers = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            BookingOutcome::Booked { .. } => winners += 1,
            BookingOutcome::Conflicted { conflicts } => {
                assert_eq!(conflicts.len(), 1);
                losers += 1;
            }
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(losers, 15);
    assert_eq!(h.store.slot_count().await, 1);
    assert_eq!(h.store.reservation_count(), 1);
}

#[tokio::test]
async fn booking_unknown_room_rejected() {
    let h = harness().await;
    let result = h.engine.book(booking("R999", day(2025, 8, 27), "1")).await;
    assert!(matches!(result, Err(EngineError::UnknownRoom(room)) if room == "R999"));
    assert_eq!(h.store.reservation_count(), 0);
}

#[tokio::test]
async fn booking_derives_times_from_periods() {
    let h = harness().await;
    let r = booked(h.engine.book(booking("R102", day(2025, 8, 27), "4-5")).await.unwrap());
    assert_eq!(r.periods, vec![Period::Fourth, Period::Lunch, Period::Fifth]);
    assert_eq!(r.start, at(2025, 8, 27, 11) + chrono::Duration::minutes(50));
    assert_eq!(r.end, at(2025, 8, 27, 14) + chrono::Duration::minutes(15));
    assert_eq!(r.created_at, at(2025, 8, 1, 0));
    assert_eq!(h.store.slot_count().await, 3);
}

#[tokio::test]
async fn booking_rejects_oversized_title() {
    let h = harness().await;
    let mut req = booking("R101", day(2025, 8, 27), "1");
    req.title = "x".repeat(crate::limits::MAX_TITLE_LEN + 1);
    assert!(matches!(h.engine.book(req).await, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn cancel_releases_slots_and_document() {
    let h = harness().await;
    let d = day(2025, 8, 27);
    let r = booked(h.engine.book(booking("R101", d, "1-3")).await.unwrap());
    let keep = booked(h.engine.book(booking("R101", d, "after")).await.unwrap());

    let report = h.engine.cancel_reservation(r.id).await.unwrap();
    assert_eq!(report.total_applied, 3);
    assert_eq!(h.store.slot_count().await, 1);
    assert!(h.store.get_reservation(r.id).await.unwrap().is_none());
    assert!(h.store.get_reservation(keep.id).await.unwrap().is_some());

    assert!(matches!(h.engine.cancel_reservation(r.id).await, Err(EngineError::NotFound(id)) if id == r.id));
    booked(h.engine.book(booking("R101", d, "2")).await.unwrap());
}

// ── Templates ────────────────────────────────────────────

#[tokio::test]
async fn template_three_days_two_periods_then_retire() {
    let h = harness().await;
    let other = booked(h.engine.book(booking("R101", day(2025, 9, 2), "after")).await.unwrap());

    let (t, report) = created(
        h.engine
            .create_template(template("R101", day(2025, 9, 1), day(2025, 9, 3), "1,2"), BoundPolicy::Reject)
            .await
            .unwrap(),
    );
    assert_eq!(report.total_applied, 6);
    let locks = h
        .store
        .query_slots(&SlotFilter::occupied_by(Occupant::TemplateLock(t.id)))
        .await
        .unwrap();
    assert_eq!(locks.len(), 6);

    let plan = h.engine.plan_template_retirement(t.id).await.unwrap();
    let planned: Vec<SlotKey> = plan.entries.iter().map(|e| e.key.clone()).collect();
    let locked: Vec<SlotKey> = locks.iter().map(|s| s.key.clone()).collect();
    assert_eq!(planned, locked);
    assert!(plan.entries.iter().all(|e| e.action == WriteAction::Delete));

    let retired = h.engine.retire_template(t.id).await.unwrap();
    assert_eq!(retired.total_applied, 6);
    assert_eq!(h.store.slot_count().await, 1);
    assert!(h.store.get_template(t.id).await.unwrap().is_none());
    assert!(h.store.get_reservation(other.id).await.unwrap().is_some());
}

#[tokio::test]
async fn template_weekday_filter() {
    let h = harness().await;
    let mut req = template("R101", day(2025, 9, 1), day(2025, 9, 14), "1");
    req.weekdays = vec![Weekday::Wed, Weekday::Mon];
    let (t, report) = created(h.engine.create_template(req, BoundPolicy::Reject).await.unwrap());
    assert_eq!(t.weekdays, vec![Weekday::Mon, Weekday::Wed]);
    assert_eq!(report.total_applied, 4);
    let slots = h.store.query_by_room_and_kind("R101", SlotKind::TemplateLock).await.unwrap();
    assert!(slots.iter().all(|s| matches!(s.date.weekday(), Weekday::Mon | Weekday::Wed)));
}

#[tokio::test]
async fn template_conflict_aborts_whole_plan() {
    let h = harness().await;
    booked(h.engine.book(booking("R101", day(2025, 9, 2), "2")).await.unwrap());
    let req = template("R101", day(2025, 9, 1), day(2025, 9, 3), "1,2");
    let t = RecurringTemplate::from_request(req.clone(), Utc::now()).unwrap();

    let plan = h.engine.plan_template_instantiation(&t, BoundPolicy::Override).await.unwrap();
    assert!(plan.entries.is_empty());
    assert_eq!(plan.conflicts.len(), 1);
    assert_eq!(plan.conflicts[0].existing.period, Period::Second);
    assert!(matches!(h.engine.execute(&plan).await, Err(EngineError::PlanHasConflicts(1))));

    let outcome = h.engine.create_template(req, BoundPolicy::Override).await.unwrap();
    assert!(matches!(outcome, TemplateOutcome::Conflicted { .. }));
    assert_eq!(h.store.slot_count().await, 1);
}

#[tokio::test]
async fn bound_policy_controls_max_date() {
    let h = harness().await;
    let mut req = template("R101", day(2025, 9, 1), day(2025, 9, 10), "1");
    req.max_date = Some(day(2025, 9, 4));

    let rejected = h.engine.create_template(req.clone(), BoundPolicy::Reject).await;
    assert!(matches!(rejected, Err(EngineError::DateBoundExceeded { bound, .. }) if bound == day(2025, 9, 4)));
    assert_eq!(h.store.slot_count().await, 0);

    let (_, clamped) = created(h.engine.create_template(req.clone(), BoundPolicy::Clamp).await.unwrap());
    assert_eq!(clamped.total_applied, 4);

    req.id = Ulid::new();
    req.room_id = "R102".into();
    let (_, overridden) = created(h.engine.create_template(req, BoundPolicy::Override).await.unwrap());
    assert_eq!(overridden.total_applied, 10);
}

#[tokio::test]
async fn template_range_limit() {
    let h = harness().await;
    let req = template("R101", day(2025, 1, 1), day(2026, 1, 5), "1");
    assert!(matches!(
        h.engine.create_template(req, BoundPolicy::Reject).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn trim_releases_tail_only() {
    let h = harness().await;
    let (t, _) = created(
        h.engine
            .create_template(template("R101", day(2025, 9, 1), day(2025, 9, 10), "1,2"), BoundPolicy::Reject)
            .await
            .unwrap(),
    );
    let report = h.engine.trim_template(t.id, day(2025, 9, 6)).await.unwrap();
    assert_eq!(report.total_applied, 8);
    assert_eq!(h.store.slot_count().await, 12);
    let stored = h.store.get_template(t.id).await.unwrap().unwrap();
    assert_eq!(stored.range.end, day(2025, 9, 6));

    assert!(matches!(
        h.engine.trim_template(t.id, day(2025, 8, 31)).await,
        Err(EngineError::Validation(_))
    ));
    let again = h.engine.trim_template(t.id, day(2025, 9, 6)).await.unwrap();
    assert_eq!(again.total_applied, 0);
}

// ── Execution ────────────────────────────────────────────

#[tokio::test]
async fn reapplying_a_plan_is_idempotent() {
    let h = harness().await;
    let req = template("R101", day(2025, 9, 1), day(2025, 9, 5), "1-3");
    let t = RecurringTemplate::from_request(req, Utc::now()).unwrap();
    let plan = h.engine.plan_template_instantiation(&t, BoundPolicy::Reject).await.unwrap();

    let first = h.engine.execute(&plan).await.unwrap();
    assert_eq!((first.total_applied, first.total_unchanged), (15, 0));
    let second = h.engine.execute(&plan).await.unwrap();
    assert_eq!((second.total_applied, second.total_unchanged), (15, 15));
    assert_eq!(h.store.slot_count().await, 15);

    // Replanning after the first apply sees the slots as our own, not conflicts.
    let replanned = h.engine.plan_template_instantiation(&t, BoundPolicy::Reject).await.unwrap();
    assert!(!replanned.has_conflicts());
    assert_eq!(replanned.len(), 15);
}

#[tokio::test]
async fn purge_by_room_and_dates() {
    let h = harness().await;
    for d in 1..=4 {
        booked(h.engine.book(booking("R101", day(2025, 9, d), "1")).await.unwrap());
        booked(h.engine.book(booking("R102", day(2025, 9, d), "1")).await.unwrap());
    }
    let filter = SlotFilter {
        room_id: Some("R101".into()),
        date_from: Some(day(2025, 9, 2)),
        date_to: Some(day(2025, 9, 3)),
        ..SlotFilter::default()
    };
    let plan = h.engine.plan_purge(filter).await.unwrap();
    assert_eq!(plan.len(), 2);
    let report = h.engine.execute(&plan).await.unwrap();
    assert_eq!(report.total_applied, 2);
    assert_eq!(h.store.slot_count().await, 6);
}

/// Delegates to a `MemoryStore` but fails every commit touching `poisoned`
/// while `failures` remain.
struct FlakyStore {
    inner: MemoryStore,
    poisoned: SlotKey,
    failures: AtomicUsize,
    commits: AtomicUsize,
}

impl FlakyStore {
    fn new(poisoned: SlotKey, failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            poisoned,
            failures: AtomicUsize::new(failures),
            commits: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    fn max_ops_per_transaction(&self) -> usize {
        self.inner.max_ops_per_transaction()
    }
    async fn put_room(&self, room: Room) -> Result<(), StoreError> {
        self.inner.put_room(room).await
    }
    async fn get_room(&self, id: &str) -> Result<Option<Room>, StoreError> {
        self.inner.get_room(id).await
    }
    async fn get_slot(&self, key: &SlotKey) -> Result<Option<Slot>, StoreError> {
        self.inner.get_slot(key).await
    }
    async fn put_slot(&self, slot: Slot) -> Result<bool, StoreError> {
        self.inner.put_slot(slot).await
    }
    async fn delete_slot(&self, key: &SlotKey) -> Result<Option<Slot>, StoreError> {
        self.inner.delete_slot(key).await
    }
    async fn query_slots(&self, filter: &SlotFilter) -> Result<Vec<Slot>, StoreError> {
        self.inner.query_slots(filter).await
    }
    async fn commit(&self, ops: &[TxnOp]) -> Result<CommitSummary, StoreError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if ops.iter().any(|op| *op.key() == self.poisoned)
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Unavailable("injected".into()));
        }
        self.inner.commit(ops).await
    }
    async fn put_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        self.inner.put_reservation(reservation).await
    }
    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        self.inner.get_reservation(id).await
    }
    async fn delete_reservation(&self, id: Ulid) -> Result<bool, StoreError> {
        self.inner.delete_reservation(id).await
    }
    async fn query_reservations_by_start(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError> {
        self.inner.query_reservations_by_start(from, to).await
    }
    async fn put_template(&self, template: RecurringTemplate) -> Result<(), StoreError> {
        self.inner.put_template(template).await
    }
    async fn get_template(&self, id: Ulid) -> Result<Option<RecurringTemplate>, StoreError> {
        self.inner.get_template(id).await
    }
    async fn delete_template(&self, id: Ulid) -> Result<bool, StoreError> {
        self.inner.delete_template(id).await
    }
    async fn get_snapshot_meta(&self, month: MonthId) -> Result<Option<SnapshotMeta>, StoreError> {
        self.inner.get_snapshot_meta(month).await
    }
    async fn update_snapshot_meta(&self, month: MonthId, decide: MetaDecision) -> Result<MetaUpdate, StoreError> {
        self.inner.update_snapshot_meta(month, decide).await
    }
}

/// 200 days x 6 periods = 1200 creates.
async fn flaky_engine(failures: usize) -> (Engine, Arc<FlakyStore>, WritePlan) {
    let t = RecurringTemplate::from_request(
        template("R101", day(2025, 1, 1), day(2025, 7, 19), "1-5"),
        Utc::now(),
    )
    .unwrap();
    let planning = Arc::new(MemoryStore::new());
    planning.put_room(Room { id: "R101".into(), name: "Lab".into(), capacity: 1 }).await.unwrap();
    let plan = MutationPlanner::new(
        planning.clone(),
        Arc::new(ConflictDetector::new(planning, Duration::from_secs(1))),
        Duration::from_secs(1),
    )
    .plan(&Operation::instantiate(&t, BoundPolicy::Reject))
    .await
    .unwrap();
    assert_eq!(plan.len(), 1200);

    let store = Arc::new(FlakyStore::new(plan.entries[700].key.clone(), failures));
    let engine = Engine::new(store.clone(), Arc::new(MemoryBlobStore::new()), Arc::new(ManualClock::new(at(2025, 1, 1, 0))), fast_settings());
    (engine, store, plan)
}

#[tokio::test]
async fn failed_chunk_does_not_stop_the_rest() {
    let (engine, store, plan) = flaky_engine(usize::MAX).await;
    let report = engine.execute(&plan).await.unwrap();

    let sizes: Vec<usize> = report.chunks.iter().map(|c| c.size).collect();
    assert_eq!(sizes, vec![500, 500, 200]);
    assert!(report.chunks[0].committed());
    assert!(matches!(
        report.chunks[1].outcome,
        ChunkOutcome::Failed { reason: StoreError::Unavailable(_), attempts: 3 }
    ));
    assert!(report.chunks[2].committed());
    assert_eq!(report.total_applied, 700);
    assert_eq!(report.total_failed, 500);
    assert_eq!(report.failed_entries.len(), 500);
    assert_eq!(report.failed_entries[0].entry, plan.entries[500]);
    assert_eq!(store.commits.load(Ordering::SeqCst), 5);
    assert_eq!(store.inner.slot_count().await, 700);

    // Chunk 1 stays applied; nothing from chunk 2 leaked in.
    assert!(store.inner.get_slot(&plan.entries[499].key).await.unwrap().is_some());
    assert!(store.inner.get_slot(&plan.entries[500].key).await.unwrap().is_none());
    assert!(store.inner.get_slot(&plan.entries[1000].key).await.unwrap().is_some());
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let (engine, store, plan) = flaky_engine(2).await;
    let report = engine.execute(&plan).await.unwrap();
    assert!(report.is_complete());
    assert!(matches!(report.chunks[1].outcome, ChunkOutcome::Committed { attempts: 3, .. }));
    assert_eq!(store.inner.slot_count().await, 1200);
}

// ── Snapshots ────────────────────────────────────────────

#[tokio::test]
async fn snapshot_guard_allows_one_build_per_day() {
    let h = harness().await;
    booked(h.engine.book(booking("R101", day(2025, 8, 27), "1")).await.unwrap());
    h.clock.set(at(2025, 8, 28, 9));
    let month: MonthId = "2025-08".parse().unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move { engine.build_monthly_snapshot(month).await }));
    }
    let mut built = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            SnapshotOutcome::Built { doc_count, .. } => {
                assert_eq!(doc_count, 1);
                built += 1;
            }
            SnapshotOutcome::AlreadyBuiltToday { last_built_at, .. } => {
                assert_eq!(last_built_at, at(2025, 8, 28, 9));
            }
        }
    }
    assert_eq!(built, 1);
    assert_eq!(h.blobs.writes(), 1);

    h.clock.set(at(2025, 8, 29, 0));
    assert!(matches!(
        h.engine.build_monthly_snapshot(month).await.unwrap(),
        SnapshotOutcome::Built { .. }
    ));
    assert_eq!(h.blobs.writes(), 2);
}

#[tokio::test]
async fn snapshot_day_follows_offset() {
    let settings = EngineSettings {
        day_offset: FixedOffset::east_opt(9 * 3600).unwrap(),
        ..fast_settings()
    };
    let h = harness_with(settings).await;
    let month: MonthId = "2025-08".parse().unwrap();
    // 14:00 UTC and 16:00 UTC fall on different days at UTC+9.
    h.clock.set(at(2025, 8, 10, 14));
    assert!(matches!(h.engine.build_monthly_snapshot(month).await.unwrap(), SnapshotOutcome::Built { .. }));
    h.clock.set(at(2025, 8, 10, 16));
    assert!(matches!(h.engine.build_monthly_snapshot(month).await.unwrap(), SnapshotOutcome::Built { .. }));
    assert_eq!(h.blobs.writes(), 2);
}

#[tokio::test]
async fn month_reservations_read_through() {
    let h = harness().await;
    let month: MonthId = "2025-08".parse().unwrap();
    let first = booked(h.engine.book(booking("R101", day(2025, 8, 5), "1")).await.unwrap());

    let live = h.engine.month_reservations(month).await.unwrap();
    assert_eq!(live, vec![first.clone()]);

    h.engine.build_monthly_snapshot(month).await.unwrap();
    booked(h.engine.book(booking("R101", day(2025, 8, 6), "1")).await.unwrap());

    // Served from the artifact until the next build.
    let cached = h.engine.month_reservations(month).await.unwrap();
    assert_eq!(cached, vec![first]);
}

#[tokio::test]
async fn current_month_uses_clock() {
    let h = harness().await;
    h.clock.set(at(2025, 12, 31, 23));
    assert_eq!(h.engine.current_month().to_string(), "2025-12");
}
