use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::observability::{
    CHUNK_COMMIT_DURATION_SECONDS, CHUNK_COMMITS_TOTAL, CHUNK_FAILURES_TOTAL, CHUNK_RETRIES_TOTAL,
};
use crate::store::{DocumentStore, StoreError, TxnOp, bounded};

use super::EngineError;
use super::planner::{PlanEntry, WriteAction, WritePlan};

/// A plan entry that did not reach the store, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEntry {
    pub entry: PlanEntry,
    pub reason: StoreError,
}

impl fmt::Display for FailedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}): {}",
            self.entry.action, self.entry.key, self.entry.payload, self.reason
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Committed {
        /// Entries that changed the store.
        changed: usize,
        /// Entries that were already in effect.
        unchanged: usize,
        attempts: u32,
    },
    Failed {
        reason: StoreError,
        attempts: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    pub index: usize,
    pub size: usize,
    pub outcome: ChunkOutcome,
}

impl ChunkReport {
    pub fn committed(&self) -> bool {
        matches!(self.outcome, ChunkOutcome::Committed { .. })
    }
}

/// Per-chunk accounting for one plan. Partial failure is a value here,
/// not an error; see [`ExecutionReport::ensure_complete`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub chunks: Vec<ChunkReport>,
    /// Entries in committed chunks, including those already in effect.
    pub total_applied: usize,
    /// Subset of `total_applied` that needed no change.
    pub total_unchanged: usize,
    pub total_failed: usize,
    pub failed_entries: Vec<FailedEntry>,
}

impl ExecutionReport {
    pub fn is_complete(&self) -> bool {
        self.failed_entries.is_empty()
    }

    /// Turn any failed entries into `PartialBatchFailure`.
    pub fn ensure_complete(self) -> Result<Self, EngineError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(EngineError::PartialBatchFailure { failed_entries: self.failed_entries })
        }
    }
}

/// Applies write plans in transaction-sized chunks.
pub struct BatchExecutor {
    store: Arc<dyn DocumentStore>,
    chunk_size: usize,
    retries: u32,
    backoff: Duration,
    timeout: Duration,
}

impl BatchExecutor {
    /// `max_chunk` is capped by the store's own transaction ceiling.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        max_chunk: usize,
        retries: u32,
        backoff: Duration,
        timeout: Duration,
    ) -> Self {
        let chunk_size = max_chunk.min(store.max_ops_per_transaction()).max(1);
        Self { store, chunk_size, retries, backoff, timeout }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Commit `plan` chunk by chunk. Never fails; a chunk that cannot be
    /// committed is recorded and the next chunk still runs.
    pub async fn apply(&self, plan: &WritePlan) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let start = Instant::now();

        for (index, chunk) in plan.entries.chunks(self.chunk_size).enumerate() {
            let ops: Vec<TxnOp> = chunk.iter().map(to_txn_op).collect();
            let outcome = self.commit_chunk(index, &ops).await;
            match &outcome {
                ChunkOutcome::Committed { unchanged, .. } => {
                    report.total_applied += chunk.len();
                    report.total_unchanged += unchanged;
                }
                ChunkOutcome::Failed { reason, attempts } => {
                    warn!(
                        "{}: chunk {index} ({} entries) failed after {attempts} attempts: {reason}",
                        plan.operation,
                        chunk.len()
                    );
                    report.total_failed += chunk.len();
                    report.failed_entries.extend(
                        chunk
                            .iter()
                            .map(|entry| FailedEntry { entry: entry.clone(), reason: reason.clone() }),
                    );
                }
            }
            report.chunks.push(ChunkReport { index, size: chunk.len(), outcome });
        }

        info!(
            "{}: {} entries in {} chunks, applied={} unchanged={} failed={} ({:.1}ms)",
            plan.operation,
            plan.entries.len(),
            report.chunks.len(),
            report.total_applied,
            report.total_unchanged,
            report.total_failed,
            start.elapsed().as_secs_f64() * 1000.0
        );
        report
    }

    async fn commit_chunk(&self, index: usize, ops: &[TxnOp]) -> ChunkOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let started = Instant::now();
            let result = bounded(self.timeout, self.store.commit(ops)).await;
            metrics::histogram!(CHUNK_COMMIT_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

            match result {
                Ok(summary) => {
                    metrics::counter!(CHUNK_COMMITS_TOTAL).increment(1);
                    debug!(
                        "chunk {index}: committed {} ops (changed={} unchanged={})",
                        ops.len(),
                        summary.applied,
                        summary.unchanged
                    );
                    return ChunkOutcome::Committed {
                        changed: summary.applied,
                        unchanged: summary.unchanged,
                        attempts,
                    };
                }
                Err(e) if e.is_transient() && attempts <= self.retries => {
                    metrics::counter!(CHUNK_RETRIES_TOTAL).increment(1);
                    let wait = self.backoff * attempts;
                    debug!("chunk {index}: attempt {attempts} failed ({e}), retrying in {wait:?}");
                    tokio::time::sleep(wait).await;
                }
                Err(reason) => {
                    metrics::counter!(CHUNK_FAILURES_TOTAL).increment(1);
                    return ChunkOutcome::Failed { reason, attempts };
                }
            }
        }
    }
}

fn to_txn_op(entry: &PlanEntry) -> TxnOp {
    match entry.action {
        WriteAction::Create => TxnOp::Put(entry.payload.clone()),
        WriteAction::Delete => TxnOp::Delete {
            key: entry.key.clone(),
            expected: entry.payload.occupant,
        },
    }
}
