use std::fmt;
use std::str::FromStr;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::engine::EngineError;

/// A time-of-day slot in the school day. Declaration order is catalog order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "1")]
    First,
    #[serde(rename = "2")]
    Second,
    #[serde(rename = "3")]
    Third,
    #[serde(rename = "4")]
    Fourth,
    #[serde(rename = "lunch")]
    Lunch,
    #[serde(rename = "5")]
    Fifth,
    #[serde(rename = "6")]
    Sixth,
    #[serde(rename = "7")]
    Seventh,
    #[serde(rename = "after")]
    AfterSchool,
}

struct CatalogEntry {
    period: Period,
    code: &'static str,
    label: &'static str,
    start: (u32, u32),
    end: (u32, u32),
}

const CATALOG: [CatalogEntry; 9] = [
    CatalogEntry { period: Period::First, code: "1", label: "1st period", start: (8, 50), end: (9, 40) },
    CatalogEntry { period: Period::Second, code: "2", label: "2nd period", start: (9, 50), end: (10, 40) },
    CatalogEntry { period: Period::Third, code: "3", label: "3rd period", start: (10, 50), end: (11, 40) },
    CatalogEntry { period: Period::Fourth, code: "4", label: "4th period", start: (11, 50), end: (12, 40) },
    CatalogEntry { period: Period::Lunch, code: "lunch", label: "Lunch break", start: (12, 40), end: (13, 25) },
    CatalogEntry { period: Period::Fifth, code: "5", label: "5th period", start: (13, 25), end: (14, 15) },
    CatalogEntry { period: Period::Sixth, code: "6", label: "6th period", start: (14, 25), end: (15, 15) },
    CatalogEntry { period: Period::Seventh, code: "7", label: "7th period", start: (15, 25), end: (16, 15) },
    CatalogEntry { period: Period::AfterSchool, code: "after", label: "After school", start: (16, 15), end: (18, 0) },
];

impl Period {
    pub const ALL: [Period; 9] = [
        Period::First,
        Period::Second,
        Period::Third,
        Period::Fourth,
        Period::Lunch,
        Period::Fifth,
        Period::Sixth,
        Period::Seventh,
        Period::AfterSchool,
    ];

    fn entry(self) -> &'static CatalogEntry {
        &CATALOG[self.index()]
    }

    /// Position in the catalog.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn code(self) -> &'static str {
        self.entry().code
    }

    pub fn label(self) -> &'static str {
        self.entry().label
    }

    pub fn starts_at(self) -> NaiveTime {
        let (h, m) = self.entry().start;
        NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
    }

    pub fn ends_at(self) -> NaiveTime {
        let (h, m) = self.entry().end;
        NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
    }

    /// Look up a period by its code or exact display label.
    pub fn from_code(s: &str) -> Option<Period> {
        CATALOG
            .iter()
            .find(|e| e.code == s || e.label == s)
            .map(|e| e.period)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Period {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::from_code(s.trim())
            .ok_or_else(|| EngineError::Validation(format!("unrecognized period code: {s:?}")))
    }
}

/// Expand a period expression into individual periods in catalog order.
///
/// Accepts comma lists and hyphen ranges, mixed freely: `"1-3"`, `"1,3"`,
/// `"1-2,lunch"`. Ranges follow catalog order, so `"4-5"` includes lunch.
pub fn expand(expr: &str) -> Result<Vec<Period>, EngineError> {
    let mut seen = [false; Period::ALL.len()];
    let mut any = false;

    for part in expr.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(EngineError::Validation(format!("empty period in {expr:?}")));
        }
        match part.split_once('-') {
            Some((from, to)) => {
                let from: Period = from.parse()?;
                let to: Period = to.parse()?;
                if from > to {
                    return Err(EngineError::Validation(format!(
                        "reversed period range {part:?}"
                    )));
                }
                for p in &Period::ALL[from.index()..=to.index()] {
                    seen[p.index()] = true;
                }
            }
            None => {
                let p: Period = part.parse()?;
                seen[p.index()] = true;
            }
        }
        any = true;
    }

    if !any {
        return Err(EngineError::Validation("no periods given".into()));
    }
    Ok(Period::ALL
        .iter()
        .copied()
        .filter(|p| seen[p.index()])
        .collect())
}

/// Render periods back to the compact comma form used by `expand`.
pub fn join(periods: &[Period]) -> String {
    periods
        .iter()
        .map(|p| p.code())
        .collect::<Vec<_>>()
        .join(",")
}
