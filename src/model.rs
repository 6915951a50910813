use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{EngineError, SlotKey};
use crate::period::Period;

/// Reference data for a bookable room. Registered by administrators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotKind {
    Reservation,
    TemplateLock,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKind::Reservation => f.write_str("reservation"),
            SlotKind::TemplateLock => f.write_str("template-lock"),
        }
    }
}

/// Who holds a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Occupant {
    Reservation(Ulid),
    TemplateLock(Ulid),
}

impl Occupant {
    pub fn kind(&self) -> SlotKind {
        match self {
            Occupant::Reservation(_) => SlotKind::Reservation,
            Occupant::TemplateLock(_) => SlotKind::TemplateLock,
        }
    }

    pub fn id(&self) -> Ulid {
        match self {
            Occupant::Reservation(id) | Occupant::TemplateLock(id) => *id,
        }
    }
}

impl fmt::Display for Occupant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// The occupancy record for one (room, date, period).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub key: SlotKey,
    pub room_id: String,
    pub date: NaiveDate,
    pub period: Period,
    pub occupant: Occupant,
}

impl Slot {
    pub fn new(room_id: &str, date: NaiveDate, period: Period, occupant: Occupant) -> Self {
        Self {
            key: SlotKey::new(room_id, date, period),
            room_id: room_id.to_string(),
            date,
            period,
            occupant,
        }
    }

    pub fn kind(&self) -> SlotKind {
        self.occupant.kind()
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "room {} on {} period {} held by {}",
            self.room_id, self.date, self.period, self.occupant
        )
    }
}

/// Inclusive range of civil dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, EngineError> {
        if start > end {
            return Err(EngineError::Validation(format!(
                "date range starts after it ends: {start}..{end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self { start: date, end: date }
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }
}

/// Input for a new booking; timestamps are derived from the period catalog.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub id: Ulid,
    pub room_id: String,
    pub date: NaiveDate,
    pub periods: Vec<Period>,
    pub title: String,
    pub name: String,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: String,
    pub title: String,
    pub name: String,
    pub date: NaiveDate,
    pub periods: Vec<Period>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// Build a reservation whose start/end cover its first and last period,
    /// interpreted as wall-clock time at `offset`.
    pub fn from_request(
        req: NewReservation,
        offset: FixedOffset,
        now: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        let mut periods = req.periods;
        periods.sort();
        periods.dedup();
        let (first, last) = match (periods.first(), periods.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => return Err(EngineError::Validation("reservation has no periods".into())),
        };
        Ok(Self {
            id: req.id,
            room_id: req.room_id,
            title: req.title,
            name: req.name,
            date: req.date,
            start: at_offset(req.date, first.starts_at(), offset),
            end: at_offset(req.date, last.ends_at(), offset),
            periods,
            created_by: req.created_by,
            created_at: now,
            updated_at: now,
        })
    }
}

/// A recurring rule that pre-blocks periods of a room across a date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringTemplate {
    pub id: Ulid,
    pub room_id: String,
    pub periods: Vec<Period>,
    pub range: DateRange,
    /// Days of week the template applies to; empty means every day.
    pub weekdays: Vec<Weekday>,
    pub max_date: Option<NaiveDate>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl RecurringTemplate {
    pub fn applies_on(&self, date: NaiveDate) -> bool {
        self.weekdays.is_empty() || self.weekdays.contains(&date.weekday())
    }
}

/// Input for a new recurring template.
#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub id: Ulid,
    pub room_id: String,
    pub periods: Vec<Period>,
    pub range: DateRange,
    pub weekdays: Vec<Weekday>,
    pub max_date: Option<NaiveDate>,
    pub created_by: String,
}

impl RecurringTemplate {
    pub fn from_request(req: NewTemplate, now: DateTime<Utc>) -> Result<Self, EngineError> {
        let mut periods = req.periods;
        periods.sort();
        periods.dedup();
        if periods.is_empty() {
            return Err(EngineError::Validation("template has no periods".into()));
        }
        let mut weekdays = req.weekdays;
        weekdays.sort_by_key(|d| d.num_days_from_monday());
        weekdays.dedup();
        Ok(Self {
            id: req.id,
            room_id: req.room_id,
            periods,
            range: req.range,
            weekdays,
            max_date: req.max_date,
            created_by: req.created_by,
            created_at: now,
        })
    }
}

/// Calendar month, rendered `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonthId {
    year: i32,
    month: u32,
}

impl MonthId {
    pub fn new(year: i32, month: u32) -> Result<Self, EngineError> {
        if !(1..=12).contains(&month) || !(1..=9999).contains(&year) {
            return Err(EngineError::Validation(format!("invalid month {year}-{month}")));
        }
        Ok(Self { year, month })
    }

    /// The month containing `now` as seen at `offset`.
    pub fn containing(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        let local = now.with_timezone(&offset).date_naive();
        Self { year: local.year(), month: local.month() }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(y, m, 1)
            .and_then(|d| d.pred_opt())
            .unwrap_or(NaiveDate::MAX)
    }

    /// `[first-of-month 00:00, last-of-month 23:59:59.999]` at `offset`, in UTC.
    pub fn bounds(&self, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
        let from = at_offset(self.first_day(), NaiveTime::MIN, offset);
        let next = at_offset(self.last_day(), NaiveTime::MIN, offset) + Duration::days(1);
        (from, next - Duration::milliseconds(1))
    }
}

impl fmt::Display for MonthId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || EngineError::Validation(format!("month must be YYYY-MM, got {s:?}"));
        let (y, m) = s.split_once('-').ok_or_else(bad)?;
        if y.len() != 4 || m.len() != 2 || !y.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let year = y.parse().map_err(|_| bad())?;
        let month = m.parse().map_err(|_| bad())?;
        MonthId::new(year, month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub month: MonthId,
    pub last_built_at: DateTime<Utc>,
}

fn at_offset(date: NaiveDate, time: NaiveTime, offset: FixedOffset) -> DateTime<Utc> {
    let local = NaiveDateTime::new(date, time);
    match offset.from_local_datetime(&local).single() {
        Some(dt) => dt.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&local),
    }
}

/// WAL record format. Flat, no nested enums.
///
/// One committed transaction is always exactly one event, so a torn write
/// drops the whole transaction on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomRegistered(Room),
    SlotsCommitted {
        puts: Vec<Slot>,
        deletes: Vec<SlotKey>,
    },
    ReservationSaved(Reservation),
    ReservationDeleted {
        id: Ulid,
    },
    TemplateSaved(RecurringTemplate),
    TemplateDeleted {
        id: Ulid,
    },
    SnapshotClaimed(SnapshotMeta),
}
