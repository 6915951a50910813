use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use ulid::Ulid;

use crate::blob::{BlobError, BlobStore, ObjectMetadata};
use crate::clock::Clock;
use crate::model::{MonthId, Reservation, SnapshotMeta};
use crate::observability::SNAPSHOT_BUILDS_TOTAL;
use crate::period::Period;
use crate::store::{DocumentStore, MetaDecision, StoreError, bounded};

use super::EngineError;

pub const SNAPSHOT_CONTENT_TYPE: &str = "application/json";
pub const SNAPSHOT_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Built {
        month: MonthId,
        path: String,
        doc_count: usize,
        built_at: DateTime<Utc>,
    },
    /// A build for this month already succeeded today; nothing was written.
    AlreadyBuiltToday {
        month: MonthId,
        last_built_at: DateTime<Utc>,
    },
}

/// The cached month export as clients read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotArtifact {
    pub month_id: String,
    pub docs: Vec<SnapshotDoc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDoc {
    pub id: Ulid,
    pub room_id: String,
    pub title: String,
    pub name: String,
    pub date: NaiveDate,
    pub periods: Vec<Period>,
    #[serde(with = "iso_millis")]
    pub start: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub end: DateTime<Utc>,
    pub created_by: String,
    #[serde(with = "iso_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub updated_at: DateTime<Utc>,
}

impl From<&Reservation> for SnapshotDoc {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            room_id: r.room_id.clone(),
            title: r.title.clone(),
            name: r.name.clone(),
            date: r.date,
            periods: r.periods.clone(),
            start: r.start,
            end: r.end,
            created_by: r.created_by.clone(),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

impl From<SnapshotDoc> for Reservation {
    fn from(d: SnapshotDoc) -> Self {
        Self {
            id: d.id,
            room_id: d.room_id,
            title: d.title,
            name: d.name,
            date: d.date,
            periods: d.periods,
            start: d.start,
            end: d.end,
            created_by: d.created_by,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

/// `2025-08-27T08:50:00.000Z`
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Builds month exports, at most once per calendar day per month.
pub struct SnapshotBuilder {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    prefix: String,
    timeout: Duration,
}

impl SnapshotBuilder {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        offset: FixedOffset,
        prefix: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self { store, blobs, clock, offset, prefix: prefix.into(), timeout }
    }

    pub fn path_for(&self, month: MonthId) -> String {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            format!("{month}.json")
        } else {
            format!("{prefix}/{month}.json")
        }
    }

    /// Claim today's build for `month`, then export it.
    ///
    /// The claim is a single read-modify-write on the month's metadata, so of
    /// any number of concurrent callers on one day exactly one proceeds. A
    /// failure after the claim is returned but not rolled back; the next
    /// attempt happens the following day.
    pub async fn build(&self, month: MonthId) -> Result<SnapshotOutcome, EngineError> {
        let now = self.clock.now();
        let offset = self.offset;
        let today = now.with_timezone(&offset).date_naive();
        let decide: MetaDecision = Box::new(move |previous| match previous {
            Some(meta) if meta.last_built_at.with_timezone(&offset).date_naive() == today => None,
            _ => Some(SnapshotMeta { month, last_built_at: now }),
        });

        let update = match bounded(self.timeout, self.store.update_snapshot_meta(month, decide)).await {
            Ok(update) => update,
            Err(StoreError::Timeout) => {
                metrics::counter!(SNAPSHOT_BUILDS_TOTAL, "outcome" => "guard_unknown").increment(1);
                error!("snapshot {month}: guard claim timed out, outcome unknown");
                return Err(EngineError::SnapshotGuardUnknown(month));
            }
            Err(e) => return Err(e.into()),
        };

        if update.written.is_none() {
            let last_built_at = update.previous.map_or(now, |m| m.last_built_at);
            metrics::counter!(SNAPSHOT_BUILDS_TOTAL, "outcome" => "already_built").increment(1);
            info!("snapshot {month}: already built today at {last_built_at}");
            return Ok(SnapshotOutcome::AlreadyBuiltToday { month, last_built_at });
        }

        match self.export(month).await {
            Ok((path, doc_count)) => {
                metrics::counter!(SNAPSHOT_BUILDS_TOTAL, "outcome" => "built").increment(1);
                info!("snapshot {month}: wrote {doc_count} docs to {path}");
                Ok(SnapshotOutcome::Built { month, path, doc_count, built_at: now })
            }
            Err(e) => {
                metrics::counter!(SNAPSHOT_BUILDS_TOTAL, "outcome" => "failed").increment(1);
                error!("snapshot {month}: build failed after claim: {e}");
                Err(e)
            }
        }
    }

    async fn export(&self, month: MonthId) -> Result<(String, usize), EngineError> {
        let docs = self.collect(month).await?;
        let artifact = SnapshotArtifact { month_id: month.to_string(), docs };
        let bytes = serde_json::to_vec(&artifact).map_err(BlobError::from)?;
        let path = self.path_for(month);
        let metadata = ObjectMetadata {
            content_type: SNAPSHOT_CONTENT_TYPE.into(),
            cache_control: SNAPSHOT_CACHE_CONTROL.into(),
        };
        self.blob_call(self.blobs.put(&path, bytes, metadata)).await?;
        Ok((path, artifact.docs.len()))
    }

    /// Reservations starting within `month`, by start ascending, one per id.
    pub async fn collect(&self, month: MonthId) -> Result<Vec<SnapshotDoc>, EngineError> {
        let (from, to) = month.bounds(self.offset);
        let found = bounded(self.timeout, self.store.query_reservations_by_start(from, to)).await?;
        let mut seen = HashSet::with_capacity(found.len());
        Ok(found
            .iter()
            .filter(|r| seen.insert(r.id))
            .map(SnapshotDoc::from)
            .collect())
    }

    async fn blob_call<T, F>(&self, call: F) -> Result<T, BlobError>
    where
        F: Future<Output = Result<T, BlobError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BlobError::Timeout),
        }
    }

    /// The stored artifact for `month`, if one has been built.
    pub async fn load(&self, month: MonthId) -> Result<Option<SnapshotArtifact>, EngineError> {
        let Some(object) = self.blob_call(self.blobs.get(&self.path_for(month))).await? else {
            return Ok(None);
        };
        let artifact = serde_json::from_slice(&object.bytes).map_err(BlobError::from)?;
        Ok(Some(artifact))
    }
}
