use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::limits::MAX_ROOM_ID_LEN;
use crate::period::Period;

use super::EngineError;

const SEP: char = '|';
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Deterministic slot identifier: `{room}|{YYYY-MM-DD}|{period-code}`.
///
/// Room ids never contain the separator and dates/period codes cannot, so
/// distinct triples always produce distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotKey(String);

/// Components recovered from a key by [`SlotKey::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    pub room_id: String,
    pub date: NaiveDate,
    pub period: Period,
}

impl SlotKey {
    /// Build a key from components that are already typed. The room id must
    /// have passed [`validate_room_id`].
    pub(crate) fn new(room_id: &str, date: NaiveDate, period: Period) -> Self {
        SlotKey(format!(
            "{room_id}{SEP}{}{SEP}{}",
            date.format(DATE_FORMAT),
            period.code()
        ))
    }

    /// Encode raw (room, date, period) strings into a key.
    pub fn encode(room_id: &str, date: &str, period: &str) -> Result<Self, EngineError> {
        validate_room_id(room_id)?;
        let date = parse_date(date)?;
        let period: Period = period.parse()?;
        Ok(SlotKey::new(room_id, date, period))
    }

    /// Best-effort inverse of `encode`, for diagnostics.
    pub fn decode(&self) -> Result<DecodedKey, EngineError> {
        let mut parts = self.0.splitn(3, SEP);
        let (Some(room), Some(date), Some(period)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(EngineError::Validation(format!("malformed slot key {:?}", self.0)));
        };
        validate_room_id(room)?;
        Ok(DecodedKey {
            room_id: room.to_string(),
            date: parse_date(date)?,
            period: period.parse()?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Smallest possible key for `room_id`; all of the room's keys share
    /// this prefix and sort after it.
    pub(crate) fn room_prefix(room_id: &str) -> Self {
        SlotKey(format!("{room_id}{SEP}"))
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn validate_room_id(room_id: &str) -> Result<(), EngineError> {
    if room_id.is_empty() {
        return Err(EngineError::Validation("room id is empty".into()));
    }
    if room_id.len() > MAX_ROOM_ID_LEN {
        return Err(EngineError::LimitExceeded("room id too long"));
    }
    if room_id.chars().any(|c| c == SEP || c.is_control()) {
        return Err(EngineError::Validation(format!(
            "room id {room_id:?} contains a reserved character"
        )));
    }
    Ok(())
}

/// Parse a canonical, zero-padded `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    let bad = || EngineError::Validation(format!("date must be YYYY-MM-DD, got {s:?}"));
    if s.len() != 10 {
        return Err(bad());
    }
    let date = NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|_| bad())?;
    // chrono accepts unpadded fields; only the canonical rendering is allowed.
    if date.format(DATE_FORMAT).to_string() != s {
        return Err(bad());
    }
    Ok(date)
}
